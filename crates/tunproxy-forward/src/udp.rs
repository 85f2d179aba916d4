//! UDP session multiplexer
//!
//! Inbound side: datagrams arriving on a SOCKS inbound's UDP socket are
//! grouped into sessions keyed by (client, destination). Each session owns
//! a bounded input queue, a writer that drains it towards the destination
//! socket or tunnel stream, and a reader that wraps replies in the relay
//! header and sends them back to the client. When either loop ends the
//! other is dropped with it, closing the socket or stream.
//!
//! Relay side: a tunnel stream opened for a UDP session carries
//! length-prefixed datagrams. Each distinct destination gets its own
//! socket keyed by (session id, destination).

use bytes::Bytes;
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use tunproxy_proto::{CodecError, FrameCodec, InitialPacket, UdpHeader, UDP_HEADER_LEN};
use tunproxy_router::Route;
use tunproxy_transport_quic::QuicStream;
use uuid::Uuid;

use crate::context::ForwardContext;
use crate::error::ForwardResult;

/// Capacity of a session's input queue
pub const SESSION_QUEUE_CAPACITY: usize = 1024;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// Receive from `rx`, giving up after `idle` when set
async fn next_datagram(rx: &mut mpsc::Receiver<Bytes>, idle: Option<Duration>) -> Option<Bytes> {
    match idle {
        Some(idle) => tokio::time::timeout(idle, rx.recv()).await.ok().flatten(),
        None => rx.recv().await,
    }
}

/// Read replies from `upstream`, wrap them in the relay header of `dst` and
/// hand them to `deliver` until either side fails
async fn reply_loop<F, Fut>(upstream: &UdpSocket, dst: SocketAddrV4, deliver: F) -> std::io::Result<()>
where
    F: Fn(Bytes) -> Fut,
    Fut: std::future::Future<Output = std::io::Result<()>>,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let header = UdpHeader::new(dst);
    loop {
        let n = upstream.recv(&mut buf).await?;
        deliver(header.wrap(&buf[..n])).await?;
    }
}

async fn connected_socket(dst: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    socket.connect(SocketAddr::V4(dst)).await?;
    Ok(socket)
}

/// Inbound-side session state
#[derive(Debug, Clone)]
struct Work {
    id: String,
    input: mpsc::Sender<Bytes>,
}

/// Session multiplexer behind one inbound UDP socket
pub struct UdpMultiplexer {
    tag: String,
    socket: Arc<UdpSocket>,
    sessions: DashMap<(SocketAddr, SocketAddrV4), Work>,
    ctx: Arc<ForwardContext>,
}

impl UdpMultiplexer {
    pub fn new(tag: impl Into<String>, socket: Arc<UdpSocket>, ctx: Arc<ForwardContext>) -> Self {
        Self {
            tag: tag.into(),
            socket,
            sessions: DashMap::new(),
            ctx,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Read datagrams until cancelled or the socket fails
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(tag = %self.tag, "UDP multiplexer cancelled");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (n, client) = match received {
                Ok(received) => received,
                Err(e) => {
                    error!(tag = %self.tag, "UDP receive failed: {}", e);
                    return;
                }
            };

            let datagram = Bytes::copy_from_slice(&buf[..n]);
            let dst = match UdpHeader::decode(&datagram) {
                Ok((header, _)) => header.address,
                Err(e) => {
                    debug!(tag = %self.tag, client = %client, "Dropping datagram: {}", e);
                    continue;
                }
            };

            self.dispatch(client, dst, datagram, &cancel);
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        client: SocketAddr,
        dst: SocketAddrV4,
        datagram: Bytes,
        cancel: &CancellationToken,
    ) {
        let key = (client, dst);

        if let Some(work) = self.sessions.get(&key).map(|w| w.clone()) {
            match work.input.try_send(datagram) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(session = %work.id, "Session queue full, dropping datagram");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(datagram)) => {
                    self.sessions.remove_if(&key, |_, w| w.id == work.id);
                    self.start_session(key, datagram, cancel);
                    return;
                }
            }
        }

        self.start_session(key, datagram, cancel);
    }

    fn start_session(
        self: &Arc<Self>,
        key: (SocketAddr, SocketAddrV4),
        first: Bytes,
        cancel: &CancellationToken,
    ) {
        let (input, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let id = Uuid::new_v4().to_string();

        // The queue buffers datagrams while the session is being set up.
        let _ = input.try_send(first);
        self.sessions.insert(
            key,
            Work {
                id: id.clone(),
                input,
            },
        );

        let mux = self.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            debug!(session = %id, client = %key.0, dst = %key.1, "UDP session started");
            if let Err(e) = mux.serve_session(&id, key, rx, cancel).await {
                warn!(session = %id, "UDP session failed: {}", e);
            }
            mux.sessions.remove_if(&key, |_, w| w.id == id);
            debug!(session = %id, "UDP session closed");
        });
    }

    async fn serve_session(
        &self,
        id: &str,
        (client, dst): (SocketAddr, SocketAddrV4),
        mut rx: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> ForwardResult<()> {
        let idle = self.ctx.udp_idle_timeout();
        let route = self
            .ctx
            .router()
            .decide(&self.tag, Some(IpAddr::V4(*dst.ip())));

        match route {
            Route::Direct => {
                let upstream = connected_socket(dst).await?;

                let writer = async {
                    while let Some(datagram) = next_datagram(&mut rx, idle).await {
                        let payload = &datagram[UDP_HEADER_LEN..];
                        upstream.send(payload).await?;
                    }
                    Ok::<_, std::io::Error>(())
                };

                let reader = reply_loop(&upstream, dst, |datagram| async move {
                    self.socket.send_to(&datagram, client).await.map(|_| ())
                });

                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    result = writer => Ok(result?),
                    result = reader => Ok(result?),
                }
            }
            Route::Tunnel(tag) => {
                let stream = self
                    .ctx
                    .open_tunnel(&tag, &InitialPacket::socks_udp(id))
                    .await?;
                let (mut send, mut recv) = stream.split();

                let writer = async {
                    while let Some(datagram) = next_datagram(&mut rx, idle).await {
                        FrameCodec::write_frame(&mut send, &datagram).await?;
                    }
                    let _ = send.finish();
                    Ok::<_, CodecError>(())
                };

                let reader = async {
                    while let Some(frame) = FrameCodec::read_frame(&mut recv).await? {
                        self.socket.send_to(&frame, client).await?;
                    }
                    Ok::<_, CodecError>(())
                };

                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    result = writer => Ok(result?),
                    result = reader => Ok(result?),
                }
            }
        }
    }
}

/// Relay-side sessions keyed by (session id, destination)
#[derive(Default)]
pub struct RelaySessions {
    sessions: DashMap<(String, SocketAddrV4), mpsc::Sender<Bytes>>,
}

impl RelaySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Deliver the datagrams of UDP session `id` arriving on `stream` directly
/// to their destinations, sending replies back on the same stream
pub(crate) async fn serve_relay(
    stream: QuicStream,
    id: String,
    sessions: Arc<RelaySessions>,
    idle: Option<Duration>,
) -> ForwardResult<()> {
    let (mut send, mut recv) = stream.split();
    let (responses, mut response_rx) = mpsc::channel::<Bytes>(SESSION_QUEUE_CAPACITY);
    let done = CancellationToken::new();
    let mut destinations = Vec::new();

    let reader = async {
        while let Some(frame) = FrameCodec::read_frame(&mut recv).await? {
            let (header, _) = match UdpHeader::decode(&frame) {
                Ok(decoded) => decoded,
                Err(e) => {
                    debug!(session = %id, "Dropping relayed datagram: {}", e);
                    continue;
                }
            };
            let key = (id.clone(), header.address);
            let payload = frame.slice(UDP_HEADER_LEN..);

            let existing = sessions.sessions.get(&key).map(|tx| tx.clone());
            let tx = match existing {
                Some(tx) if !tx.is_closed() => tx,
                _ => {
                    let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
                    sessions.sessions.insert(key.clone(), tx.clone());
                    destinations.push(key.clone());
                    tokio::spawn(relay_destination(
                        key,
                        rx,
                        responses.clone(),
                        sessions.clone(),
                        idle,
                        done.child_token(),
                    ));
                    tx
                }
            };

            if tx.try_send(payload).is_err() {
                trace!(session = %id, "Relay queue unavailable, dropping datagram");
            }
        }
        Ok::<_, CodecError>(())
    };

    let writer = async {
        while let Some(datagram) = response_rx.recv().await {
            FrameCodec::write_frame(&mut send, &datagram).await?;
        }
        Ok::<_, CodecError>(())
    };

    let result = tokio::select! {
        result = reader => result,
        result = writer => result,
    };

    done.cancel();
    for key in destinations {
        sessions.sessions.remove_if(&key, |_, tx| tx.is_closed());
    }
    let _ = send.finish();

    Ok(result?)
}

async fn relay_destination(
    key: (String, SocketAddrV4),
    mut rx: mpsc::Receiver<Bytes>,
    responses: mpsc::Sender<Bytes>,
    sessions: Arc<RelaySessions>,
    idle: Option<Duration>,
    cancel: CancellationToken,
) {
    let dst = key.1;
    let socket = match connected_socket(dst).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(session = %key.0, dst = %dst, "Failed to open relay socket: {}", e);
            sessions.sessions.remove(&key);
            return;
        }
    };
    debug!(session = %key.0, dst = %dst, "Relay destination opened");

    let writer = async {
        while let Some(payload) = next_datagram(&mut rx, idle).await {
            socket.send(&payload).await?;
        }
        Ok::<_, std::io::Error>(())
    };

    let reader = reply_loop(&socket, dst, |datagram| {
        let responses = responses.clone();
        async move {
            responses
                .send(datagram)
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }
    });

    let result: std::io::Result<()> = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = writer => result,
        result = reader => result,
    };
    if let Err(e) = result {
        debug!(session = %key.0, dst = %dst, "Relay destination ended: {}", e);
    }

    drop(rx);
    sessions.sessions.remove_if(&key, |_, tx| tx.is_closed());
}
