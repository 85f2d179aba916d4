//! QUIC tunnel transport using quinn
//!
//! Every tunnel is one QUIC connection (TLS 1.3, ALPN `tunproxy/1`); every
//! proxied flow is one bidirectional stream on it.
//!
//! # Example
//!
//! ```no_run
//! use tunproxy_transport_quic::{QuicConfig, QuicConnector, QuicListener};
//! use tunproxy_transport::{TransportConnector, TransportListener};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Arc::new(QuicConfig::server_self_signed()?);
//! let listener = QuicListener::new("127.0.0.1:0".parse()?, server)?;
//!
//! let connector = QuicConnector::new(Arc::new(QuicConfig::client_default()))?;
//! let connection = connector.connect(listener.local_addr()?, "localhost").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::QuicConfig;
pub use connection::QuicConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::{QuicRecvHalf, QuicSendHalf, QuicStream};
