//! UDP relay datagram header
//!
//! Every relayed datagram starts with a fixed 10-byte header:
//!
//! ```text
//! +----+----+----+----+----+----+----+----+----+----+---------
//! | 0x00 0x00 | rsv | rsv |    IPv4 address   | port (BE)| payload
//! +----+----+----+----+----+----+----+----+----+----+---------
//! ```
//!
//! The first two bytes must be zero (fragmentation is not supported), the
//! next two are ignored on decode. Responses are written with the
//! `[0, 0, 0, 1]` marker, which is also the SOCKS5 UDP reply layout for an
//! IPv4 address. IPv6 destinations are not representable.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Length of the UDP relay header
pub const UDP_HEADER_LEN: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UdpHeaderError {
    #[error("Datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("Fragmented or malformed datagram (reserved bytes {0:#04x} {1:#04x})")]
    Reserved(u8, u8),
}

/// Destination (or origin, for responses) of a relayed datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpHeader {
    pub address: SocketAddrV4,
}

impl UdpHeader {
    pub fn new(address: SocketAddrV4) -> Self {
        Self { address }
    }

    /// Split a datagram into its header and payload
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8]), UdpHeaderError> {
        if datagram.len() < UDP_HEADER_LEN {
            return Err(UdpHeaderError::TooShort(datagram.len()));
        }
        if datagram[0] != 0 || datagram[1] != 0 {
            return Err(UdpHeaderError::Reserved(datagram[0], datagram[1]));
        }

        let ip = Ipv4Addr::new(datagram[4], datagram[5], datagram[6], datagram[7]);
        let port = u16::from_be_bytes([datagram[8], datagram[9]]);

        Ok((
            Self::new(SocketAddrV4::new(ip, port)),
            &datagram[UDP_HEADER_LEN..],
        ))
    }

    /// Encode the header alone
    pub fn encode(&self) -> [u8; UDP_HEADER_LEN] {
        let mut out = [0u8; UDP_HEADER_LEN];
        out[3] = 0x01;
        out[4..8].copy_from_slice(&self.address.ip().octets());
        out[8..10].copy_from_slice(&self.address.port().to_be_bytes());
        out
    }

    /// Prefix `payload` with this header
    pub fn wrap(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN + payload.len());
        buf.put_slice(&self.encode());
        buf.put_slice(payload);
        buf.freeze()
    }
}
