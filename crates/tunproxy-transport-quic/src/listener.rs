//! Forwarding and control endpoints (server side) and the shared client
//! endpoint used to dial peers

use async_trait::async_trait;
use quinn::Endpoint;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunproxy_transport::{
    TransportConfig, TransportConnector, TransportError, TransportListener, TransportResult,
};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;

#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        TransportConfig::validate(&*config)?;

        let endpoint = Endpoint::server(config.build_server_config()?, bind_addr)
            .map_err(TransportError::IoError)?;
        info!(
            "QUIC endpoint listening on {}",
            endpoint.local_addr().map_err(TransportError::IoError)?
        );

        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportListener for QuicListener {
    type Connection = QuicConnection;

    /// Next established connection; failed handshakes are skipped
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        while let Some(incoming) = self.endpoint.accept().await {
            let remote = incoming.remote_address();
            match incoming.await {
                Ok(connection) => {
                    debug!(peer = %remote, "QUIC connection accepted");
                    return Ok((QuicConnection::new(connection), remote));
                }
                Err(e) => warn!(peer = %remote, "QUIC handshake failed: {}", e),
            }
        }

        Err(TransportError::ConnectionError(
            "QUIC endpoint closed".to_string(),
        ))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    async fn close(&self) {
        self.endpoint.close(0u32.into(), b"endpoint closed");
    }
}

/// Client endpoint; every connection it dials shares one local UDP socket
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        TransportConfig::validate(&*config)?;

        let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(TransportError::IoError)?;
        endpoint.set_default_client_config(config.build_client_config()?);

        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection> {
        let connection = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?
            .await
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", addr, e)))?;

        debug!(peer = %addr, "QUIC connection established");
        Ok(QuicConnection::new(connection))
    }
}
