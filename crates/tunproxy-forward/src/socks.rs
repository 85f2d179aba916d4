//! SOCKS5 inbound
//!
//! One TCP listener for the handshake and CONNECT traffic, plus a UDP
//! socket bound to the same address that carries UDP ASSOCIATE datagrams.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunproxy_config::{Credentials, InboundConfig};
use tunproxy_proto::InitialPacket;
use tunproxy_router::Route;

use crate::context::{resolve_host, ForwardContext};
use crate::error::ForwardResult;
use crate::pump;
use crate::socks5::{self, Address, Socks5Error};
use crate::udp::UdpMultiplexer;

pub struct SocksInbound {
    tag: String,
    listener: TcpListener,
    udp: Arc<UdpMultiplexer>,
    credentials: Option<Credentials>,
    ctx: Arc<ForwardContext>,
}

impl SocksInbound {
    pub async fn bind(config: &InboundConfig, ctx: Arc<ForwardContext>) -> ForwardResult<Self> {
        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;

        // Port 0 picks the TCP port first so both sockets share it.
        let socket = UdpSocket::bind(local_addr).await?;
        let udp = Arc::new(UdpMultiplexer::new(
            config.tag.clone(),
            Arc::new(socket),
            ctx.clone(),
        ));

        info!(tag = %config.tag, "SOCKS5 inbound listening on {} (TCP+UDP)", local_addr);

        Ok(Self {
            tag: config.tag.clone(),
            listener,
            udp,
            credentials: config.credentials().cloned(),
            ctx,
        })
    }

    pub fn local_addr(&self) -> ForwardResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn udp(&self) -> &Arc<UdpMultiplexer> {
        &self.udp
    }

    /// Serve TCP clients and UDP datagrams until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(self.udp.clone().run(cancel.child_token()));

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(tag = %self.tag, "SOCKS5 inbound cancelled");
                    return;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((client, peer)) => {
                    debug!(tag = %self.tag, peer = %peer, "Accepted SOCKS5 client");
                    let inbound = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inbound.handle_client(client).await {
                            warn!(tag = %inbound.tag, peer = %peer, "SOCKS5 client failed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!(tag = %self.tag, "SOCKS5 inbound accept failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn handle_client(&self, mut client: TcpStream) -> ForwardResult<()> {
        self.authenticate(&mut client).await?;

        let request = socks5::read_request(&mut client).await?;
        match request.command {
            socks5::CMD_CONNECT => self.connect(client, request.destination).await,
            socks5::CMD_UDP_ASSOCIATE => self.udp_associate(client).await,
            command => {
                socks5::write_reply(&mut client, socks5::REP_CMD_NOT_SUPPORTED, None).await?;
                Err(Socks5Error::UnsupportedCommand(command).into())
            }
        }
    }

    async fn authenticate(&self, client: &mut TcpStream) -> ForwardResult<()> {
        let methods = socks5::read_greeting(client).await?;

        let Some(credentials) = &self.credentials else {
            if methods.contains(&socks5::AUTH_NONE) {
                socks5::write_method(client, socks5::AUTH_NONE).await?;
                return Ok(());
            }
            socks5::write_method(client, socks5::AUTH_NO_ACCEPTABLE).await?;
            return Err(Socks5Error::NoAcceptableMethod.into());
        };

        if !methods.contains(&socks5::AUTH_PASSWORD) {
            socks5::write_method(client, socks5::AUTH_NO_ACCEPTABLE).await?;
            return Err(Socks5Error::NoAcceptableMethod.into());
        }
        socks5::write_method(client, socks5::AUTH_PASSWORD).await?;

        let (user, pass) = socks5::read_credentials(client).await?;
        let accepted = credentials.matches(&user, &pass);
        socks5::write_auth_status(client, accepted).await?;

        if accepted {
            Ok(())
        } else {
            Err(Socks5Error::AuthFailed(user).into())
        }
    }

    async fn connect(&self, mut client: TcpStream, destination: Address) -> ForwardResult<()> {
        match self.ctx.route(&self.tag, &destination.host()).await {
            Route::Direct => {
                let upstream = match dial(&destination).await {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        socks5::write_reply(&mut client, socks5::reply_for_dial_error(&e), None)
                            .await?;
                        return Err(e.into());
                    }
                };
                debug!(tag = %self.tag, "Direct CONNECT to {}", destination);

                socks5::write_reply(&mut client, socks5::REP_SUCCESS, upstream.local_addr().ok())
                    .await?;
                pump::copy(client, upstream).await?;
                Ok(())
            }
            Route::Tunnel(tag) => {
                let packet = InitialPacket::socks_tcp(destination.to_string());
                let stream = match self.ctx.open_tunnel(&tag, &packet).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        socks5::write_reply(&mut client, socks5::REP_GENERAL_FAILURE, None).await?;
                        return Err(e);
                    }
                };
                debug!(tag = %self.tag, outbound = %tag, "Tunneled CONNECT to {}", destination);

                socks5::write_reply(&mut client, socks5::REP_SUCCESS, None).await?;
                pump::copy(client, stream).await?;
                Ok(())
            }
        }
    }

    /// Answer with the relay socket's address and close the control
    /// connection; datagrams flow through the shared UDP socket
    async fn udp_associate(&self, mut client: TcpStream) -> ForwardResult<()> {
        let mut bind = self.udp.local_addr()?;
        if bind.ip().is_unspecified() {
            let local_ip: IpAddr = client.local_addr()?.ip();
            bind.set_ip(local_ip);
        }

        socks5::write_reply(&mut client, socks5::REP_SUCCESS, Some(bind)).await?;
        let _ = client.shutdown().await;
        Ok(())
    }
}

/// Dial a SOCKS destination
pub(crate) async fn dial(destination: &Address) -> std::io::Result<TcpStream> {
    match destination {
        Address::Ip(addr) => TcpStream::connect(addr).await,
        Address::Domain(host, port) => {
            let addr = resolve_host(host, *port)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;
            TcpStream::connect(addr).await
        }
    }
}
