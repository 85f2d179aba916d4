use thiserror::Error;
use tunproxy_proto::{CodecError, UdpHeaderError};
use tunproxy_transport::TransportError;

use crate::socks5::Socks5Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    #[error("UDP header error: {0}")]
    UdpHeader(#[from] UdpHeaderError),

    #[error("Invalid HTTP request: {0}")]
    Http(String),

    #[error("Failed to resolve {address}: {reason}")]
    Resolve { address: String, reason: String },

    #[error("Outbound {0} is not resolved")]
    UnknownOutbound(String),

    #[error("Peer for outbound {0} rejected the stream")]
    Rejected(String),

    #[error("Tunnel stream closed before the initial packet")]
    MissingInitialPacket,

    #[error("Malformed initial packet: {0}")]
    InvalidInitialPacket(String),
}

pub type ForwardResult<T> = Result<T, ForwardError>;
