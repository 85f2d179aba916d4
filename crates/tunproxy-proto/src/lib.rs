//! Tunproxy wire protocol
//!
//! This crate defines the messages exchanged between tunnel peers:
//!
//! - the control-plane handshake message (`{"tag", "nodePort"}`) used to
//!   negotiate a forwarding endpoint,
//! - the [`InitialPacket`] sent as the first frame of every forwarding stream,
//! - the one-byte [`Ack`] the receiving peer answers with,
//! - the fixed 10-byte UDP relay header.
//!
//! Structured messages travel as length-prefixed JSON frames (see [`FrameCodec`]).

pub mod codec;
pub mod messages;
pub mod udp;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;
pub use udp::{UdpHeader, UdpHeaderError, UDP_HEADER_LEN};

/// ALPN protocol identifier announced by both tunnel peers
pub const ALPN_PROTOCOL: &str = "tunproxy/1";

/// Routing decision meaning "connect to the destination without tunneling"
pub const DIRECT_TAG: &str = "direct";
