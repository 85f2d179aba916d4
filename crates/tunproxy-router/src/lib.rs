//! Routing decisions for proxied connections
//!
//! - [`OutboundDirectory`]: tag → negotiated peer address, filled by the
//!   control plane
//! - [`GeoIpLookup`]: country code of a destination IP
//! - [`Router`]: per-connection direct/tunnel decision from the rule table

pub mod directory;
pub mod engine;
pub mod geoip;

pub use directory::{DirectoryError, OutboundDirectory, PeerInfo};
pub use engine::{Route, Router, Rule};
pub use geoip::{GeoIpError, GeoIpLookup, MmdbGeoIp, NoGeoIp, StaticGeoIp};
