//! Control endpoint server
//!
//! Per control stream: `ACCEPTED → MESSAGE_READ → PORT_ALLOCATED →
//! REPLY_SENT → (grace delay) → CLOSED`. A failure at any stage ends only
//! that stream; the accept loop keeps running until cancelled.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunproxy_proto::{ControlMessage, FrameCodec};
use tunproxy_transport::{TransportConnection, TransportListener, TransportStream};
use tunproxy_transport_quic::{QuicConfig, QuicConnection, QuicListener, QuicStream};

use crate::port_allocator::PortAllocator;
use crate::task_tracker::TaskTracker;
use crate::ControlError;

/// How long a control stream stays open after the reply
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Callback serving tunnel traffic on a newly created forwarding endpoint
///
/// The future runs until the listener fails or the token is cancelled.
pub type ForwardingSpawner = Arc<
    dyn Fn(QuicListener, CancellationToken) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

pub struct ControlServer {
    listener: QuicListener,
    server_config: Arc<QuicConfig>,
    allocator: Arc<dyn PortAllocator>,
    forwarding: ForwardingSpawner,
    tracker: TaskTracker,
    forward_bind_ip: IpAddr,
    grace: Duration,
}

impl ControlServer {
    /// Bind the control endpoint on `addr`
    pub fn bind(
        addr: SocketAddr,
        server_config: Arc<QuicConfig>,
        allocator: Arc<dyn PortAllocator>,
        forwarding: ForwardingSpawner,
    ) -> Result<Self, ControlError> {
        let listener = QuicListener::new(addr, server_config.clone())?;

        Ok(Self {
            listener,
            server_config,
            allocator,
            forwarding,
            tracker: TaskTracker::new(),
            forward_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            grace: DEFAULT_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Address forwarding endpoints bind on (all interfaces by default)
    pub fn with_forward_bind_ip(mut self, ip: IpAddr) -> Self {
        self.forward_bind_ip = ip;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ControlError> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of forwarding endpoints still being served
    pub fn active_endpoints(&self) -> usize {
        self.tracker.active()
    }

    /// Accept control connections until cancelled or the listener fails
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Control endpoint accept loop cancelled");
                    return;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((connection, remote)) => {
                    debug!(peer = %remote, "Control connection accepted");
                    let server = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        server.handle_connection(connection, cancel).await;
                    });
                }
                Err(e) => {
                    error!("Control endpoint accept failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, connection: QuicConnection, cancel: CancellationToken) {
        let connection_id = connection.connection_id();

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                stream = connection.accept_stream() => stream,
            };

            match stream {
                Ok(Some(stream)) => {
                    let server = self.clone();
                    let cancel = cancel.clone();
                    let connection_id = connection_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_stream(stream, cancel).await {
                            warn!(connection = %connection_id, "Control stream failed: {}", e);
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(connection = %connection_id, "Failed to accept control stream: {}", e);
                    break;
                }
            }
        }

        debug!(connection = %connection_id, "Control connection finished");
    }

    async fn handle_stream(
        &self,
        mut stream: QuicStream,
        cancel: CancellationToken,
    ) -> Result<(), ControlError> {
        let request: ControlMessage = FrameCodec::read_message(&mut stream)
            .await?
            .ok_or(ControlError::UnexpectedEof)?;

        let port = if request.node_port == 0 {
            self.allocator.allocate()?
        } else {
            request.node_port
        };

        let listener = QuicListener::new(
            SocketAddr::new(self.forward_bind_ip, port),
            self.server_config.clone(),
        )?;
        let port = listener.local_addr()?.port();

        let handle = tokio::spawn((self.forwarding)(listener, cancel.child_token()));
        self.tracker.register(port, handle);

        info!(tag = %request.tag, port = port, "Forwarding endpoint created");

        FrameCodec::write_message(&mut stream, &ControlMessage::new(request.tag, port)).await?;
        stream.finish().await?;

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.grace) => {}
        }
        Ok(())
    }

    /// Stop accepting control connections and tear down every forwarding endpoint
    pub async fn close(&self) {
        self.listener.close().await;
        self.tracker.abort_all();
    }
}
