//! Forwarding dispatcher
//!
//! Client-facing HTTP and SOCKS5 inbounds, the receiver serving tunnel
//! streams on forwarding endpoints, and the machinery that moves bytes once
//! a route is chosen:
//!
//! ```text
//! client ──▶ inbound ──route──▶ direct dial ─────────────────────▶ target
//!                        └────▶ pool stream ══ QUIC ══▶ receiver ─▶ target
//!                               (InitialPacket, ack)        └─▶ next hop
//! ```

pub mod context;
pub mod error;
pub mod http;
pub mod pool;
pub mod pump;
pub mod receiver;
pub mod socks;
pub mod socks5;
pub mod udp;

pub use context::ForwardContext;
pub use error::{ForwardError, ForwardResult};
pub use http::HttpInbound;
pub use pool::TunnelPool;
pub use receiver::TunnelReceiver;
pub use socks::SocksInbound;
pub use udp::{RelaySessions, UdpMultiplexer};
