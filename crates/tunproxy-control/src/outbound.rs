//! Outbound negotiation
//!
//! Every configured outbound is negotiated concurrently. Successful results
//! land in the shared directory; failures are collected and reported
//! together once all negotiations have finished.

use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tunproxy_config::OutboundConfig;
use tunproxy_proto::{ControlMessage, FrameCodec};
use tunproxy_router::{OutboundDirectory, PeerInfo};
use tunproxy_transport::{TransportConnection, TransportConnector, TransportStream};
use tunproxy_transport_quic::{QuicConnection, QuicConnector};

use crate::ControlError;

/// Upper bound for one outbound's handshake
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OutboundInitiator {
    connector: Arc<QuicConnector>,
    directory: Arc<OutboundDirectory>,
    timeout: Duration,
}

impl OutboundInitiator {
    pub fn new(connector: Arc<QuicConnector>, directory: Arc<OutboundDirectory>) -> Self {
        Self {
            connector,
            directory,
            timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Negotiate all outbounds, failing if any of them failed
    pub async fn negotiate_all(&self, outbounds: &[OutboundConfig]) -> Result<(), ControlError> {
        let results = join_all(outbounds.iter().map(|outbound| async move {
            (outbound.tag.clone(), self.negotiate(outbound).await)
        }))
        .await;

        let failures: Vec<(String, ControlError)> = results
            .into_iter()
            .filter_map(|(tag, result)| match result {
                Ok(_) => None,
                Err(e) => {
                    warn!(tag = %tag, "Outbound negotiation failed: {}", e);
                    Some((tag, e))
                }
            })
            .collect();

        if failures.is_empty() {
            info!("Negotiated {} outbounds", outbounds.len());
            Ok(())
        } else {
            Err(ControlError::Negotiation(failures))
        }
    }

    /// Negotiate one outbound and record its forwarding endpoint
    pub async fn negotiate(&self, outbound: &OutboundConfig) -> Result<PeerInfo, ControlError> {
        let target = format!("{}:{}", outbound.address, outbound.port);

        let reply = tokio::time::timeout(self.timeout, self.exchange(outbound))
            .await
            .map_err(|_| ControlError::Timeout(target))??;

        if reply.tag != outbound.tag {
            return Err(ControlError::TagMismatch {
                expected: outbound.tag.clone(),
                got: reply.tag,
            });
        }

        // The configured address is kept; the peer only chooses the port.
        Ok(self
            .directory
            .resolve(&outbound.tag, outbound.address.clone(), reply.node_port)?)
    }

    async fn exchange(&self, outbound: &OutboundConfig) -> Result<ControlMessage, ControlError> {
        let addr = resolve_addr(&outbound.address, outbound.port).await?;
        debug!(tag = %outbound.tag, peer = %addr, "Negotiating outbound");

        let connection = self.connector.connect(addr, &outbound.address).await?;
        let result = request_port(&connection, outbound).await;

        connection.close(0, "negotiation complete").await;
        result
    }
}

async fn request_port(
    connection: &QuicConnection,
    outbound: &OutboundConfig,
) -> Result<ControlMessage, ControlError> {
    let mut stream = connection.open_stream().await?;
    FrameCodec::write_message(
        &mut stream,
        &ControlMessage::new(outbound.tag.clone(), outbound.node_port),
    )
    .await?;
    stream.finish().await?;

    FrameCodec::read_message(&mut stream)
        .await?
        .ok_or(ControlError::UnexpectedEof)
}

async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, ControlError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ControlError::Resolve {
            address: host.to_string(),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| ControlError::Resolve {
        address: host.to_string(),
        reason: "no addresses returned".to_string(),
    })
}
