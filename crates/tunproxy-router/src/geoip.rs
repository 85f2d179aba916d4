//! Country lookup for destination addresses

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum GeoIpError {
    #[error("Failed to open GeoIP database {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("GeoIP lookup failed for {ip}: {reason}")]
    Lookup { ip: IpAddr, reason: String },

    #[error("No country recorded for {0}")]
    NotFound(IpAddr),

    #[error("No GeoIP database configured")]
    Unavailable,
}

/// Country code lookup capability
pub trait GeoIpLookup: Send + Sync {
    /// ISO 3166-1 alpha-2 country code of `ip`
    fn country_code(&self, ip: IpAddr) -> Result<String, GeoIpError>;
}

/// MaxMind country database held in memory
pub struct MmdbGeoIp {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MmdbGeoIp {
    pub fn open(path: &Path) -> Result<Self, GeoIpError> {
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| GeoIpError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        info!("Loaded GeoIP database from {}", path.display());
        Ok(Self { reader })
    }
}

impl GeoIpLookup for MmdbGeoIp {
    fn country_code(&self, ip: IpAddr) -> Result<String, GeoIpError> {
        let record: maxminddb::geoip2::Country =
            self.reader.lookup(ip).map_err(|e| GeoIpError::Lookup {
                ip,
                reason: e.to_string(),
            })?;

        record
            .country
            .and_then(|c| c.iso_code)
            .map(str::to_string)
            .ok_or(GeoIpError::NotFound(ip))
    }
}

/// Fixed address → country table
#[derive(Debug, Default, Clone)]
pub struct StaticGeoIp {
    table: HashMap<IpAddr, String>,
}

impl StaticGeoIp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, code: &str) -> Self {
        self.table.insert(ip, code.to_string());
        self
    }
}

impl GeoIpLookup for StaticGeoIp {
    fn country_code(&self, ip: IpAddr) -> Result<String, GeoIpError> {
        self.table.get(&ip).cloned().ok_or(GeoIpError::NotFound(ip))
    }
}

/// Lookup used when no database is configured; every lookup fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeoIp;

impl GeoIpLookup for NoGeoIp {
    fn country_code(&self, _ip: IpAddr) -> Result<String, GeoIpError> {
        Err(GeoIpError::Unavailable)
    }
}
