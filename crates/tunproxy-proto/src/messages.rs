//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host and port pair, formatted as `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddr {
    #[serde(default)]
    pub address: String,
    pub port: u16,
}

impl NetAddr {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') && !self.address.starts_with('[') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Control-plane handshake message
///
/// Sent by the outbound initiator with the requested node port (0 asks the
/// peer to allocate one) and echoed back by the endpoint with the port it
/// actually bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub tag: String,
    #[serde(rename = "nodePort")]
    pub node_port: u16,
}

impl ControlMessage {
    pub fn new(tag: impl Into<String>, node_port: u16) -> Self {
        Self {
            tag: tag.into(),
            node_port,
        }
    }
}

/// Upstream protocol carried by a forwarding stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Socks,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Socks => write!(f, "socks"),
        }
    }
}

/// Transport network of a SOCKS request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

/// Structured destination for SOCKS flows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub network: Network,
    /// UDP session identifier (empty for TCP)
    #[serde(default)]
    pub id: String,
    /// Destination in `host:port` form (empty for UDP, where every
    /// datagram carries its own destination)
    #[serde(default)]
    pub address: String,
}

/// First frame on every new forwarding stream
///
/// Tells the receiving peer which upstream protocol to establish and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialPacket {
    pub protocol: Protocol,
    /// Raw HTTP request bytes (base64 in JSON)
    #[serde(default, with = "base64_bytes")]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub request: Option<Request>,
}

impl InitialPacket {
    /// HTTP flow carrying the raw client request
    pub fn http(content: Vec<u8>) -> Self {
        Self {
            protocol: Protocol::Http,
            content: Some(content),
            request: None,
        }
    }

    /// SOCKS CONNECT flow to `address`
    pub fn socks_tcp(address: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Socks,
            content: None,
            request: Some(Request {
                network: Network::Tcp,
                id: String::new(),
                address: address.into(),
            }),
        }
    }

    /// SOCKS UDP relay session `id`
    pub fn socks_udp(id: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Socks,
            content: None,
            request: Some(Request {
                network: Network::Udp,
                id: id.into(),
                address: String::new(),
            }),
        }
    }
}

/// One-byte acknowledgment written by the receiving peer once the
/// InitialPacket has been acted upon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ack {
    Ok = 0x00,
    Failed = 0x01,
}

impl Ack {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Self {
        if byte == Ack::Ok as u8 {
            Ack::Ok
        } else {
            Ack::Failed
        }
    }

    pub fn is_ok(self) -> bool {
        self == Ack::Ok
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_wire_names() {
        let json = serde_json::to_string(&ControlMessage::new("vpn1", 51000)).unwrap();
        assert_eq!(json, r#"{"tag":"vpn1","nodePort":51000}"#);
    }

    #[test]
    fn test_initial_packet_http_shape() {
        let packet = InitialPacket::http(b"GET / HTTP/1.1\r\n\r\n".to_vec());
        let value: serde_json::Value = serde_json::to_value(&packet).unwrap();

        assert_eq!(value["protocol"], "http");
        assert_eq!(value["content"], "R0VUIC8gSFRUUC8xLjENCg0K");
        assert!(value["request"].is_null());

        let decoded: InitialPacket = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_initial_packet_socks_shape() {
        let packet = InitialPacket::socks_tcp("example.com:443");
        let value: serde_json::Value = serde_json::to_value(&packet).unwrap();

        assert_eq!(value["protocol"], "socks");
        assert!(value["content"].is_null());
        assert_eq!(value["request"]["network"], "tcp");
        assert_eq!(value["request"]["address"], "example.com:443");
    }

    #[test]
    fn test_initial_packet_tolerates_missing_fields() {
        let decoded: InitialPacket =
            serde_json::from_str(r#"{"protocol":"socks","request":{"network":"udp","id":"42"}}"#)
                .unwrap();
        let request = decoded.request.unwrap();
        assert_eq!(request.network, Network::Udp);
        assert_eq!(request.id, "42");
        assert!(request.address.is_empty());
        assert!(decoded.content.is_none());
    }

    #[test]
    fn test_net_addr_display() {
        assert_eq!(NetAddr::new("1.2.3.4", 51000).to_string(), "1.2.3.4:51000");
        assert_eq!(NetAddr::new("::1", 80).to_string(), "[::1]:80");
    }

    #[test]
    fn test_ack_bytes() {
        assert!(Ack::from_byte(0).is_ok());
        assert_eq!(Ack::from_byte(7), Ack::Failed);
        assert_eq!(Ack::Failed.as_byte(), 1);
    }
}
