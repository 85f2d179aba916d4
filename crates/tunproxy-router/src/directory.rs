//! Outbound directory
//!
//! Maps each outbound tag to the peer address and forwarding port obtained
//! by the control-plane handshake. Entries are written once and never
//! rewritten; lookups vastly outnumber writes after startup.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::info;
use tunproxy_proto::NetAddr;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Outbound {0} is already resolved")]
    AlreadyResolved(String),
}

/// Resolved forwarding endpoint of an outbound peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub tag: String,
    pub address: String,
    pub node_port: u16,
}

impl PeerInfo {
    pub fn forwarding_addr(&self) -> NetAddr {
        NetAddr::new(self.address.clone(), self.node_port)
    }
}

#[derive(Debug, Default)]
struct Inner {
    peers: HashMap<String, PeerInfo>,
    // Resolution order; the first entry is the default route.
    order: Vec<String>,
}

#[derive(Debug, Default)]
pub struct OutboundDirectory {
    inner: RwLock<Inner>,
}

impl OutboundDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the negotiated endpoint of `tag`
    pub fn resolve(
        &self,
        tag: &str,
        address: impl Into<String>,
        node_port: u16,
    ) -> Result<PeerInfo, DirectoryError> {
        let mut inner = self.write();
        if inner.peers.contains_key(tag) {
            return Err(DirectoryError::AlreadyResolved(tag.to_string()));
        }

        let peer = PeerInfo {
            tag: tag.to_string(),
            address: address.into(),
            node_port,
        };
        info!(
            tag = %tag,
            address = %peer.address,
            node_port = node_port,
            "Outbound resolved"
        );

        inner.peers.insert(tag.to_string(), peer.clone());
        inner.order.push(tag.to_string());
        Ok(peer)
    }

    pub fn get(&self, tag: &str) -> Option<PeerInfo> {
        self.read().peers.get(tag).cloned()
    }

    /// First resolved tag, used when no routing rule applies
    pub fn default_tag(&self) -> Option<String> {
        self.read().order.first().cloned()
    }

    pub fn tags(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().order.is_empty()
    }
}
