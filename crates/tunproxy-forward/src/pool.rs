//! Tunnel connection pool
//!
//! Keeps one QUIC connection per outbound tag. Connections are dialed on
//! first use from a shared client endpoint; a connection that fails to open
//! a stream is evicted and dialed again once.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tunproxy_router::OutboundDirectory;
use tunproxy_transport::{TransportConnection, TransportConnector};
use tunproxy_transport_quic::{QuicConnection, QuicConnector, QuicStream};

use crate::context::resolve_host;
use crate::error::{ForwardError, ForwardResult};

pub struct TunnelPool {
    connector: Arc<QuicConnector>,
    directory: Arc<OutboundDirectory>,
    connections: Mutex<HashMap<String, QuicConnection>>,
}

impl TunnelPool {
    pub fn new(connector: Arc<QuicConnector>, directory: Arc<OutboundDirectory>) -> Self {
        Self {
            connector,
            directory,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new stream to the forwarding endpoint of `tag`
    pub async fn open_stream(&self, tag: &str) -> ForwardResult<QuicStream> {
        let connection = self.connection(tag).await?;
        match connection.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!(tag = %tag, "Tunnel connection unusable, redialing: {}", e);
                self.evict(tag, &connection).await;
                let connection = self.connection(tag).await?;
                Ok(connection.open_stream().await?)
            }
        }
    }

    async fn connection(&self, tag: &str) -> ForwardResult<QuicConnection> {
        let mut connections = self.connections.lock().await;

        if let Some(connection) = connections.get(tag) {
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
            debug!(tag = %tag, "Dropping closed tunnel connection");
            connections.remove(tag);
        }

        let peer = self
            .directory
            .get(tag)
            .ok_or_else(|| ForwardError::UnknownOutbound(tag.to_string()))?;
        let addr = resolve_host(&peer.address, peer.node_port).await?;

        let connection = self.connector.connect(addr, &peer.address).await?;
        info!(tag = %tag, peer = %addr, "Tunnel connection established");

        connections.insert(tag.to_string(), connection.clone());
        Ok(connection)
    }

    async fn evict(&self, tag: &str, stale: &QuicConnection) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(tag)
            .is_some_and(|c| c.connection_id() == stale.connection_id())
        {
            connections.remove(tag);
        }
        stale.close(0, "evicted").await;
    }

    /// Number of pooled connections
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (tag, connection) in connections {
            debug!(tag = %tag, "Closing tunnel connection");
            connection.close(0, "shutdown").await;
        }
    }
}
