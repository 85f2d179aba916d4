//! Forwarding port allocation

use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use tracing::{debug, trace};
use tunproxy_config::PortRange;

use crate::ControlError;

/// Candidates tried before giving up
pub const MAX_ATTEMPTS: usize = 64;

/// Source of ports for new forwarding endpoints
pub trait PortAllocator: Send + Sync {
    fn allocate(&self) -> Result<u16, ControlError>;
}

/// Picks random ports in a range and keeps the first one that is free for
/// both TCP and UDP
#[derive(Debug, Clone)]
pub struct RandomPortAllocator {
    range: PortRange,
    max_attempts: usize,
}

impl RandomPortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Check if a port can be bound on all interfaces for TCP and UDP
    pub fn is_port_available(port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        TcpListener::bind(addr).is_ok() && UdpSocket::bind(addr).is_ok()
    }
}

impl PortAllocator for RandomPortAllocator {
    fn allocate(&self) -> Result<u16, ControlError> {
        let mut rng = rand::thread_rng();

        for _ in 0..self.max_attempts {
            let candidate = rng.gen_range(self.range.as_range());
            if Self::is_port_available(candidate) {
                debug!(port = candidate, "Allocated forwarding port");
                return Ok(candidate);
            }
            trace!(port = candidate, "Port in use, retrying");
        }

        Err(ControlError::PortExhausted {
            attempts: self.max_attempts,
            range: self.range.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_within_range() {
        let range = PortRange::new(40000, 40100).unwrap();
        let allocator = RandomPortAllocator::new(range);

        let port = allocator.allocate().unwrap();
        assert!(range.as_range().contains(&port));
    }

    #[test]
    fn test_occupied_single_port_range_is_exhausted() {
        let held = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let range = PortRange {
            low: port,
            high: port,
        };

        let allocator = RandomPortAllocator::new(range).with_max_attempts(4);
        assert!(matches!(
            allocator.allocate(),
            Err(ControlError::PortExhausted { attempts: 4, .. })
        ));
    }

    #[test]
    fn test_udp_occupied_port_is_unavailable() {
        let held = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = held.local_addr().unwrap().port();
        assert!(!RandomPortAllocator::is_port_available(port));
    }
}
