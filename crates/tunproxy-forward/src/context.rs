//! Shared state handed to every inbound and tunnel receiver

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;
use tunproxy_proto::{Ack, FrameCodec, InitialPacket};
use tunproxy_router::{Route, Router};
use tunproxy_transport_quic::QuicStream;

use crate::error::{ForwardError, ForwardResult};
use crate::pool::TunnelPool;
use crate::udp::RelaySessions;

pub struct ForwardContext {
    router: Arc<Router>,
    pool: Arc<TunnelPool>,
    relay_sessions: Arc<RelaySessions>,
    udp_idle_timeout: Option<Duration>,
}

impl ForwardContext {
    pub fn new(router: Arc<Router>, pool: Arc<TunnelPool>) -> Self {
        Self {
            router,
            pool,
            relay_sessions: Arc::new(RelaySessions::new()),
            udp_idle_timeout: None,
        }
    }

    /// Evict UDP sessions idle for longer than `timeout`
    pub fn with_udp_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn pool(&self) -> &Arc<TunnelPool> {
        &self.pool
    }

    pub(crate) fn relay_sessions(&self) -> &Arc<RelaySessions> {
        &self.relay_sessions
    }

    pub fn udp_idle_timeout(&self) -> Option<Duration> {
        self.udp_idle_timeout
    }

    /// Route a connection to `host`
    ///
    /// Names that fail to resolve take the default route, so a tunnel peer
    /// can still resolve them on its side.
    pub async fn route(&self, inbound_tag: &str, host: &str) -> Route {
        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => match resolve_host(host, 0).await {
                Ok(addr) => Some(addr.ip()),
                Err(e) => {
                    debug!("{}", e);
                    None
                }
            },
        };

        let route = self.router.decide(inbound_tag, ip);
        debug!(inbound = %inbound_tag, host = %host, route = %route, "Routing decision");
        route
    }

    /// Open a tunnel stream to `tag`, send `packet` and wait for the peer's ack
    pub async fn open_tunnel(&self, tag: &str, packet: &InitialPacket) -> ForwardResult<QuicStream> {
        let mut stream = self.pool.open_stream(tag).await?;
        FrameCodec::write_message(&mut stream, packet).await?;

        let ack = Ack::from_byte(stream.read_u8().await?);
        if !ack.is_ok() {
            return Err(ForwardError::Rejected(tag.to_string()));
        }
        Ok(stream)
    }
}

/// Resolve `host:port` to its first socket address
pub async fn resolve_host(host: &str, port: u16) -> ForwardResult<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');

    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ForwardError::Resolve {
            address: host.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ForwardError::Resolve {
            address: host.to_string(),
            reason: "no addresses returned".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let v4 = resolve_host("127.0.0.1", 80).await.unwrap();
        assert_eq!(v4, "127.0.0.1:80".parse().unwrap());

        let v6 = resolve_host("[::1]", 443).await.unwrap();
        assert_eq!(v6, "[::1]:443".parse().unwrap());
    }
}
