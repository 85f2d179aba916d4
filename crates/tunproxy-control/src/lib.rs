//! Control-plane negotiation
//!
//! An outbound initiator dials a peer's control endpoint, sends
//! `{tag, nodePort}` and receives the port of a forwarding endpoint the
//! peer created for it:
//!
//! ```text
//! initiator                         endpoint server
//!     │ ── {tag, nodePort: 0} ──────────▶ │ allocate port, bind forwarding endpoint
//!     │ ◀──────── {tag, nodePort: P} ──── │ spawn forwarding loop on P
//!     │                                   │ (grace delay, close)
//!  directory[tag] = (peer address, P)
//! ```

pub mod endpoint;
pub mod outbound;
pub mod port_allocator;
pub mod task_tracker;

pub use endpoint::{ControlServer, ForwardingSpawner};
pub use outbound::OutboundInitiator;
pub use port_allocator::{PortAllocator, RandomPortAllocator};
pub use task_tracker::TaskTracker;

use thiserror::Error;
use tunproxy_proto::CodecError;
use tunproxy_router::DirectoryError;
use tunproxy_transport::TransportError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("No free port in {range} after {attempts} attempts")]
    PortExhausted { attempts: usize, range: String },

    #[error("Failed to resolve {address}: {reason}")]
    Resolve { address: String, reason: String },

    #[error("Control stream closed before a message arrived")]
    UnexpectedEof,

    #[error("Peer answered for tag {got}, expected {expected}")]
    TagMismatch { expected: String, got: String },

    #[error("Negotiation with {0} timed out")]
    Timeout(String),

    #[error("Outbound negotiation failed: {}", describe(.0))]
    Negotiation(Vec<(String, ControlError)>),
}

fn describe(failures: &[(String, ControlError)]) -> String {
    failures
        .iter()
        .map(|(tag, err)| format!("{}: {}", tag, err))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_error_lists_every_tag() {
        let err = ControlError::Negotiation(vec![
            ("vpn1".to_string(), ControlError::UnexpectedEof),
            ("vpn2".to_string(), ControlError::Timeout("1.2.3.4:7000".to_string())),
        ]);

        let message = err.to_string();
        assert!(message.contains("vpn1: Control stream closed"));
        assert!(message.contains("vpn2: Negotiation with 1.2.3.4:7000 timed out"));
    }
}
