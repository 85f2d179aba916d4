//! SOCKS5 wire format (RFC 1928 / RFC 1929 subset)

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const PASSWORD_AUTH_VERSION: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported SOCKS version: {0}")]
    Version(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Invalid username/password auth version: {0}")]
    AuthVersion(u8),

    #[error("Authentication failed for user {0}")]
    AuthFailed(String),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    AddressType(u8),

    #[error("Invalid domain name")]
    InvalidDomain,
}

/// Destination carried in a SOCKS5 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Client request after the greeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub destination: Address,
}

/// Read the client greeting and return the offered auth methods
pub async fn read_greeting<S>(stream: &mut S) -> Result<Vec<u8>, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::Version(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

pub async fn write_method<S>(stream: &mut S, method: u8) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS5_VERSION, method]).await?;
    Ok(())
}

/// Read a username/password sub-negotiation request
pub async fn read_credentials<S>(stream: &mut S) -> Result<(String, String), Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;
    if ver[0] != PASSWORD_AUTH_VERSION {
        return Err(Socks5Error::AuthVersion(ver[0]));
    }

    let mut ulen = [0u8; 1];
    stream.read_exact(&mut ulen).await?;
    let mut username = vec![0u8; ulen[0] as usize];
    stream.read_exact(&mut username).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    Ok((
        String::from_utf8_lossy(&username).into_owned(),
        String::from_utf8_lossy(&password).into_owned(),
    ))
}

pub async fn write_auth_status<S>(stream: &mut S, success: bool) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    let status = if success { 0x00 } else { 0x01 };
    stream.write_all(&[PASSWORD_AUTH_VERSION, status]).await?;
    Ok(())
}

/// Read a request; unknown address types are answered with 0x08 before
/// the error is returned
pub async fn read_request<S>(stream: &mut S) -> Result<Request, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::Version(header[0]));
    }

    let command = header[1];
    let destination = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Address::Ip(SocketAddr::new(Ipv4Addr::from(addr).into(), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(domain).map_err(|_| Socks5Error::InvalidDomain)?;
            Address::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Address::Ip(SocketAddr::new(Ipv6Addr::from(addr).into(), port))
        }
        atyp => {
            write_reply(stream, REP_ATYP_NOT_SUPPORTED, None).await?;
            return Err(Socks5Error::AddressType(atyp));
        }
    };

    Ok(Request {
        command,
        destination,
    })
}

/// Write a reply; `bind` defaults to 0.0.0.0:0
pub async fn write_reply<S>(
    stream: &mut S,
    reply: u8,
    bind: Option<SocketAddr>,
) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    let bind = bind.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[SOCKS5_VERSION, reply, 0x00]);
    match bind.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&bind.port().to_be_bytes());

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Reply code for a failed upstream dial
pub fn reply_for_dial_error(err: &std::io::Error) -> u8 {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        _ => REP_HOST_UNREACHABLE,
    }
}
