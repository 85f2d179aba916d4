//! Configuration loading and validation
//!
//! A configuration file is YAML (`.yaml`, `.yml`) or JSON (`.json`). It is
//! parsed once at startup and never mutated afterwards.

pub mod port_range;
pub mod types;

pub use port_range::PortRange;
pub use types::*;

use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Outbound tag reserved for the "no tunnel" routing decision
pub const RESERVED_TAG: &str = "direct";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config file extension: {0}")]
    UnsupportedFormat(String),

    #[error("Configuration defines neither an endpoint nor any inbound")]
    NothingToRun,

    #[error("Duplicate {kind} tag: {tag}")]
    DuplicateTag { kind: &'static str, tag: String },

    #[error("Empty {0} tag")]
    EmptyTag(&'static str),

    #[error("Outbound tag '{0}' is reserved")]
    ReservedTag(String),

    #[error("Invalid port range '{0}': expected low-high with 0 < low < high")]
    InvalidPortRange(String),

    #[error("Invalid transfer settings: {0}")]
    InvalidTransfer(String),
}

impl Config {
    /// Load and validate a configuration file, choosing the format by extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let config = match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content)?,
            "json" => Self::from_json(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        debug!(
            inbounds = config.inbounds.len(),
            outbounds = config.outbounds.len(),
            endpoint = config.endpoint.is_some(),
            "Loaded configuration from {}",
            path.display()
        );

        Ok(config)
    }

    /// Parse and validate YAML
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_none() && self.inbounds.is_empty() {
            return Err(ConfigError::NothingToRun);
        }

        let mut tags = HashSet::new();
        for inbound in &self.inbounds {
            if inbound.tag.is_empty() {
                return Err(ConfigError::EmptyTag("inbound"));
            }
            if !tags.insert(inbound.tag.as_str()) {
                return Err(ConfigError::DuplicateTag {
                    kind: "inbound",
                    tag: inbound.tag.clone(),
                });
            }
        }

        let mut tags = HashSet::new();
        for outbound in &self.outbounds {
            if outbound.tag.is_empty() {
                return Err(ConfigError::EmptyTag("outbound"));
            }
            if outbound.tag.eq_ignore_ascii_case(RESERVED_TAG) {
                return Err(ConfigError::ReservedTag(outbound.tag.clone()));
            }
            if !tags.insert(outbound.tag.as_str()) {
                return Err(ConfigError::DuplicateTag {
                    kind: "outbound",
                    tag: outbound.tag.clone(),
                });
            }
        }

        if let Some(endpoint) = &self.endpoint {
            endpoint.port_range()?;
        }

        let transfer = &self.transfer;
        if transfer.keep_alive_period == 0 {
            return Err(ConfigError::InvalidTransfer(
                "keepAlivePeriod must be > 0".to_string(),
            ));
        }
        if transfer.max_idle_timeout < transfer.keep_alive_period.saturating_mul(2) {
            return Err(ConfigError::InvalidTransfer(
                "maxIdleTimeout must be at least twice keepAlivePeriod".to_string(),
            ));
        }

        Ok(())
    }
}
