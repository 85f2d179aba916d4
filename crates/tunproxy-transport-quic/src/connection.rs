//! QUIC connection: one per peer, carrying every tunnel stream

use async_trait::async_trait;
use quinn::{Connection, ConnectionError};
use std::net::SocketAddr;
use tracing::{debug, trace, warn};
use tunproxy_transport::{TransportConnection, TransportError, TransportResult};

use crate::stream::QuicStream;

#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    connection_id: String,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        let connection_id = format!("quic-{}", connection.stable_id());
        Self {
            inner: connection,
            connection_id,
        }
    }
}

/// Ways a connection ends that are not failures of the stream accept
fn is_orderly_close(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::ApplicationClosed(_)
            | ConnectionError::ConnectionClosed(_)
            | ConnectionError::LocallyClosed
            | ConnectionError::TimedOut
            | ConnectionError::Reset
    )
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        let (send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        trace!(connection = %self.connection_id, stream = send.id().index(), "Opened stream");
        Ok(QuicStream::new(send, recv))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        match self.inner.accept_bi().await {
            Ok((send, recv)) => {
                trace!(connection = %self.connection_id, stream = send.id().index(), "Accepted stream");
                Ok(Some(QuicStream::new(send, recv)))
            }
            Err(e) if is_orderly_close(&e) => {
                debug!(connection = %self.connection_id, "Connection ended: {}", e);
                Ok(None)
            }
            Err(e) => {
                warn!(connection = %self.connection_id, "Stream accept failed: {}", e);
                Err(TransportError::ConnectionError(e.to_string()))
            }
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());
        debug!(connection = %self.connection_id, code = error_code, "Closed: {}", reason);
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orderly_close_classification() {
        assert!(is_orderly_close(&ConnectionError::LocallyClosed));
        assert!(is_orderly_close(&ConnectionError::TimedOut));
        assert!(is_orderly_close(&ConnectionError::Reset));
        assert!(!is_orderly_close(&ConnectionError::VersionMismatch));
    }
}
