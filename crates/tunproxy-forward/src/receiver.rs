//! Tunnel-side receiver
//!
//! Serves a forwarding endpoint: every stream opened by a peer starts with
//! an InitialPacket naming what to connect to. The receiver routes it with
//! an empty inbound tag, so only the default route and tag-less rules
//! apply, then either connects directly or hands the stream on to the next
//! hop. The peer gets a one-byte ack before any payload flows.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunproxy_proto::{Ack, FrameCodec, InitialPacket, Network, Protocol};
use tunproxy_router::Route;
use tunproxy_transport::{TransportConnection, TransportListener};
use tunproxy_transport_quic::{QuicConnection, QuicListener, QuicStream};

use crate::context::ForwardContext;
use crate::error::{ForwardError, ForwardResult};
use crate::http::{self, ProxyRequest};
use crate::socks5::Address;
use crate::{pump, socks, udp};

/// Inbound tag used for routing tunneled traffic
const RELAY_INBOUND_TAG: &str = "";

pub struct TunnelReceiver {
    ctx: Arc<ForwardContext>,
}

impl TunnelReceiver {
    pub fn new(ctx: Arc<ForwardContext>) -> Self {
        Self { ctx }
    }

    /// Accept tunnel connections on `listener` until cancelled
    pub async fn serve(self: Arc<Self>, listener: QuicListener, cancel: CancellationToken) {
        let local_addr = listener.local_addr().ok();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((connection, peer)) => {
                    debug!(peer = %peer, "Tunnel connection accepted");
                    tokio::spawn(self.clone().serve_connection(connection, cancel.clone()));
                }
                Err(e) => {
                    warn!("Forwarding endpoint {:?} stopped: {}", local_addr, e);
                    break;
                }
            }
        }

        listener.close().await;
        debug!("Forwarding endpoint {:?} closed", local_addr);
    }

    async fn serve_connection(self: Arc<Self>, connection: QuicConnection, cancel: CancellationToken) {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                stream = connection.accept_stream() => stream,
            };

            match stream {
                Ok(Some(stream)) => {
                    let receiver = self.clone();
                    let peer = connection.remote_address();
                    tokio::spawn(async move {
                        if let Err(e) = receiver.handle_stream(stream).await {
                            warn!(peer = %peer, "Tunnel stream failed: {}", e);
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(connection = %connection.connection_id(), "Tunnel connection ended: {}", e);
                    break;
                }
            }
        }
    }

    async fn handle_stream(&self, mut stream: QuicStream) -> ForwardResult<()> {
        let packet: InitialPacket = FrameCodec::read_message(&mut stream)
            .await?
            .ok_or(ForwardError::MissingInitialPacket)?;

        match packet.protocol {
            Protocol::Http => self.handle_http(stream, packet).await,
            Protocol::Socks => self.handle_socks(stream, packet).await,
        }
    }

    async fn handle_http(&self, mut stream: QuicStream, packet: InitialPacket) -> ForwardResult<()> {
        let content = packet
            .content
            .as_deref()
            .ok_or_else(|| ForwardError::InvalidInitialPacket("missing HTTP content".to_string()))?;
        let request = ProxyRequest::parse(content)?
            .ok_or_else(|| ForwardError::InvalidInitialPacket("incomplete HTTP head".to_string()))?;

        match self.ctx.route(RELAY_INBOUND_TAG, &request.host).await {
            Route::Direct => {
                let upstream = match http::dial(&request).await {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        write_ack(&mut stream, Ack::Failed).await?;
                        return Err(e);
                    }
                };
                write_ack(&mut stream, Ack::Ok).await?;
                http::relay(stream, upstream, &request, content).await
            }
            Route::Tunnel(tag) => self.chain(stream, &tag, &packet).await,
        }
    }

    async fn handle_socks(&self, mut stream: QuicStream, packet: InitialPacket) -> ForwardResult<()> {
        let request = packet
            .request
            .clone()
            .ok_or_else(|| ForwardError::InvalidInitialPacket("missing request".to_string()))?;

        match request.network {
            Network::Tcp => {
                let destination = parse_destination(&request.address)?;
                match self.ctx.route(RELAY_INBOUND_TAG, &destination.host()).await {
                    Route::Direct => {
                        let upstream = match socks::dial(&destination).await {
                            Ok(upstream) => upstream,
                            Err(e) => {
                                write_ack(&mut stream, Ack::Failed).await?;
                                return Err(e.into());
                            }
                        };
                        debug!("Relaying TCP to {}", destination);
                        write_ack(&mut stream, Ack::Ok).await?;
                        pump::copy(stream, upstream).await?;
                        Ok(())
                    }
                    Route::Tunnel(tag) => self.chain(stream, &tag, &packet).await,
                }
            }
            Network::Udp => match self.ctx.router().decide(RELAY_INBOUND_TAG, None) {
                Route::Direct => {
                    debug!(session = %request.id, "Relaying UDP session");
                    write_ack(&mut stream, Ack::Ok).await?;
                    udp::serve_relay(
                        stream,
                        request.id,
                        self.ctx.relay_sessions().clone(),
                        self.ctx.udp_idle_timeout(),
                    )
                    .await
                }
                Route::Tunnel(tag) => self.chain(stream, &tag, &packet).await,
            },
        }
    }

    /// Forward `packet` to the next hop and splice the two streams
    async fn chain(&self, mut stream: QuicStream, tag: &str, packet: &InitialPacket) -> ForwardResult<()> {
        let next = match self.ctx.open_tunnel(tag, packet).await {
            Ok(next) => next,
            Err(e) => {
                write_ack(&mut stream, Ack::Failed).await?;
                return Err(e);
            }
        };
        debug!(outbound = %tag, "Chaining tunnel stream");

        write_ack(&mut stream, Ack::Ok).await?;
        pump::copy(stream, next).await?;
        Ok(())
    }
}

async fn write_ack(stream: &mut QuicStream, ack: Ack) -> ForwardResult<()> {
    stream.write_all(&[ack.as_byte()]).await?;
    Ok(())
}

/// Parse a `host:port` destination
fn parse_destination(address: &str) -> ForwardResult<Address> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(Address::Ip(addr));
    }

    let invalid = || ForwardError::InvalidInitialPacket(format!("invalid destination {}", address));
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    if host.is_empty() {
        return Err(invalid());
    }
    Ok(Address::Domain(host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_destination() {
        assert_eq!(
            parse_destination("1.2.3.4:80").unwrap(),
            Address::Ip("1.2.3.4:80".parse().unwrap())
        );
        assert_eq!(
            parse_destination("[::1]:443").unwrap(),
            Address::Ip("[::1]:443".parse().unwrap())
        );
        assert_eq!(
            parse_destination("example.com:8080").unwrap(),
            Address::Domain("example.com".to_string(), 8080)
        );
        assert!(parse_destination("example.com").is_err());
        assert!(parse_destination(":80").is_err());
    }
}
