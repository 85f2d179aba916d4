//! Configuration model
//!
//! Keys are camelCase in both YAML and JSON files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::port_range::PortRange;

/// Root configuration object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    /// Control-plane listener; absent on pure clients
    #[serde(default)]
    pub endpoint: Option<EndpointConfig>,

    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,

    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,

    #[serde(default)]
    pub routing: Option<RoutingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_console_level")]
    pub console_level: String,

    #[serde(default = "default_file_level")]
    pub file_level: String,

    /// Directory receiving `tunproxy.log`; no file output when absent
    #[serde(default)]
    pub log_file_path: Option<PathBuf>,
}

fn default_console_level() -> String {
    "warn".to_string()
}

fn default_file_level() -> String {
    "error".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_level: default_console_level(),
            file_level: default_file_level(),
            log_file_path: None,
        }
    }
}

/// TLS material; every field is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub crt: Option<PathBuf>,

    #[serde(default)]
    pub key: Option<PathBuf>,

    /// CA bundle used to verify peers; peers are not verified when absent
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

/// Tunnel transport tuning
///
/// Durations are in seconds, buffer sizes in bytes (0 keeps the transport
/// default).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default = "default_max_bidi_streams")]
    pub max_bidi_remote_streams: u32,

    #[serde(default)]
    pub max_uni_remote_streams: u32,

    #[serde(default)]
    pub max_stream_read_buffer_size: u64,

    #[serde(default)]
    pub max_stream_write_buffer_size: u64,

    #[serde(default)]
    pub max_conn_read_buffer_size: u64,

    #[serde(default = "default_max_idle_timeout")]
    pub max_idle_timeout: u64,

    #[serde(default = "default_keep_alive_period")]
    pub keep_alive_period: u64,

    /// Evict UDP relay sessions idle for this long; 0 keeps them until
    /// their socket or stream fails
    #[serde(default)]
    pub udp_idle_timeout: u64,
}

fn default_max_bidi_streams() -> u32 {
    100
}

fn default_max_idle_timeout() -> u64 {
    30 * 60
}

fn default_keep_alive_period() -> u64 {
    20
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            tls: None,
            max_bidi_remote_streams: default_max_bidi_streams(),
            max_uni_remote_streams: 0,
            max_stream_read_buffer_size: 0,
            max_stream_write_buffer_size: 0,
            max_conn_read_buffer_size: 0,
            max_idle_timeout: default_max_idle_timeout(),
            keep_alive_period: default_keep_alive_period(),
            udp_idle_timeout: 0,
        }
    }
}

impl TransferConfig {
    pub fn max_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.max_idle_timeout)
    }

    pub fn keep_alive_period(&self) -> Duration {
        Duration::from_secs(self.keep_alive_period)
    }

    pub fn udp_idle_timeout(&self) -> Option<Duration> {
        (self.udp_idle_timeout > 0).then(|| Duration::from_secs(self.udp_idle_timeout))
    }
}

/// Control-plane endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(default = "default_bind_address")]
    pub address: String,

    pub port: u16,

    /// Range for allocated forwarding ports, `low-high`
    #[serde(default = "default_rand_port")]
    pub rand_port: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_rand_port() -> String {
    "10000-60000".to_string()
}

impl EndpointConfig {
    pub fn port_range(&self) -> Result<PortRange, crate::ConfigError> {
        self.rand_port.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundProtocol {
    #[serde(alias = "socks5")]
    Socks,
    Http,
}

/// Username/password accepted by an inbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundConfig {
    pub tag: String,

    #[serde(default = "default_inbound_address")]
    pub address: String,

    pub port: u16,

    pub protocol: InboundProtocol,

    #[serde(default)]
    pub setting: Option<Credentials>,
}

impl Credentials {
    pub fn matches(&self, user: &str, pass: &str) -> bool {
        self.user == user && self.pass == pass
    }
}

impl InboundConfig {
    /// Credentials clients must present; a setting with an empty user or
    /// password disables authentication
    pub fn credentials(&self) -> Option<&Credentials> {
        self.setting
            .as_ref()
            .filter(|c| !c.user.is_empty() && !c.pass.is_empty())
    }
}

fn default_inbound_address() -> String {
    "127.0.0.1".to_string()
}

/// Remote peer reachable through a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    pub tag: String,

    /// Peer host (name or IP)
    pub address: String,

    /// Peer control-plane port
    pub port: u16,

    /// Requested forwarding port on the peer, 0 lets the peer allocate one
    #[serde(default)]
    pub node_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// MaxMind country database
    #[serde(default)]
    pub geoip: Option<PathBuf>,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub in_tag: String,

    pub out_tag: String,

    /// Negated country patterns such as `!US`
    #[serde(default)]
    pub ip: Vec<String>,
}
