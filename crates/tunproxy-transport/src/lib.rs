//! Transport abstraction for tunnel connections
//!
//! The proxy treats its multiplexed tunnel transport as an opaque capability:
//! listen, dial, open/accept bidirectional streams, and read/write/finish
//! on those streams. This crate names that capability as traits so the
//! control plane and the forwarding dispatcher stay independent of the
//! concrete implementation.
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │   control plane, forwarding dispatcher     │
//! └───────────────────────────────────────────┘
//!                     │ uses traits
//!                     ↓
//! ┌───────────────────────────────────────────┐
//! │ TransportListener    TransportConnection   │
//! │ TransportConnector   TransportStream       │
//! └───────────────────────────────────────────┘
//!                     │ implemented by
//!                     ↓
//!            tunproxy-transport-quic
//! ```

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// ALPN identifier negotiated by every tunnel connection
pub const DEFAULT_ALPN: &str = "tunproxy/1";

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional byte stream over a transport connection
///
/// Reads and writes go through `AsyncRead`/`AsyncWrite` so streams can be
/// handed straight to the duplex pump.
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + Debug {
    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;

    /// Stream ID (unique within its connection)
    fn stream_id(&self) -> u64;
}

/// A multiplexed connection to a remote peer
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    /// The stream type created by this connection
    type Stream: TransportStream;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection
    ///
    /// `error_code` is application specific, 0 for normal closure.
    async fn close(&self, error_code: u32, reason: &str);

    fn is_closed(&self) -> bool;

    fn remote_address(&self) -> SocketAddr;

    /// Stable identifier used for logging
    fn connection_id(&self) -> String;
}

/// Server side: accepts incoming transport connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// Accept the next established connection
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting new connections
    async fn close(&self);
}

/// Client side: establishes outgoing transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// Connect to `addr`, presenting `server_name` for TLS
    async fn connect(&self, addr: SocketAddr, server_name: &str)
        -> TransportResult<Self::Connection>;
}

/// Security settings shared by listeners and connectors
#[derive(Debug, Clone)]
pub struct TransportSecurityConfig {
    /// Whether to verify the server's TLS certificate
    pub verify_server_cert: bool,

    /// Custom root CA certificates (DER)
    pub root_certs: Vec<Vec<u8>>,

    /// Application-Layer Protocol Negotiation (ALPN) protocols
    pub alpn_protocols: Vec<String>,
}

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        // Peers present self-signed certificates unless a CA is configured.
        Self {
            verify_server_cert: false,
            root_certs: Vec::new(),
            alpn_protocols: vec![DEFAULT_ALPN.to_string()],
        }
    }
}

/// Transport-specific configuration
pub trait TransportConfig: Send + Sync + Debug {
    fn security_config(&self) -> &TransportSecurityConfig;

    fn validate(&self) -> TransportResult<()>;
}
