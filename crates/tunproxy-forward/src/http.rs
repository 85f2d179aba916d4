//! HTTP proxy inbound
//!
//! Handles `CONNECT host:port` and absolute-URI requests. The request head
//! is read whole before routing, then either relayed directly or shipped
//! to a tunnel peer inside an InitialPacket.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunproxy_config::{Credentials, InboundConfig};
use tunproxy_proto::InitialPacket;
use tunproxy_router::Route;

use crate::context::{resolve_host, ForwardContext};
use crate::error::{ForwardError, ForwardResult};
use crate::pump;

/// Upper bound on a request head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
Proxy-Authenticate: Basic realm=\"tunproxy\"\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Parsed proxy request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    pub host: String,
    pub port: u16,
    pub proxy_authorization: Option<String>,
    /// Length of the head including the terminating blank line
    pub head_len: usize,
}

impl ProxyRequest {
    /// Parse a request head; `Ok(None)` means more bytes are needed
    pub fn parse(buf: &[u8]) -> ForwardResult<Option<Self>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ForwardError::Http(e.to_string())),
        };

        let method = req
            .method
            .ok_or_else(|| ForwardError::Http("missing method".to_string()))?
            .to_string();
        let path = req
            .path
            .ok_or_else(|| ForwardError::Http("missing request target".to_string()))?;

        let header = |name: &str| {
            req.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
        };

        let (authority, default_port) = if method.eq_ignore_ascii_case("CONNECT") {
            (path.to_string(), 443)
        } else if let Some(rest) = path.strip_prefix("http://") {
            (authority_of(rest).to_string(), 80)
        } else if let Some(rest) = path.strip_prefix("https://") {
            (authority_of(rest).to_string(), 443)
        } else {
            let host = header("Host").ok_or_else(|| ForwardError::Http("missing Host".to_string()))?;
            (host, 80)
        };

        let authority = match authority.find('@') {
            Some(at) => authority[at + 1..].to_string(),
            None => authority,
        };
        let (host, port) = split_host_port(&authority, default_port)?;

        Ok(Some(Self {
            method,
            host,
            port,
            proxy_authorization: header("Proxy-Authorization"),
            head_len,
        }))
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Whether the request carries `credentials` as Basic proxy auth
    pub fn is_authorized(&self, credentials: &Credentials) -> bool {
        let Some(value) = self.proxy_authorization.as_deref() else {
            return false;
        };
        let Some((scheme, encoded)) = value.split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }

        STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|pair| {
                pair.split_once(':')
                    .map(|(user, pass)| credentials.matches(user, pass))
            })
            .unwrap_or(false)
    }
}

fn authority_of(rest: &str) -> &str {
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

fn split_host_port(authority: &str, default_port: u16) -> ForwardResult<(String, u16)> {
    let invalid = || ForwardError::Http(format!("invalid authority {}", authority));

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => default_port,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_string(), port.parse().map_err(|_| invalid())?))
        }
        Some(_) => Ok((authority.to_string(), default_port)),
        None if authority.is_empty() => Err(invalid()),
        None => Ok((authority.to_string(), default_port)),
    }
}

/// Read until a complete request head has arrived
///
/// Returns the parsed head and every byte read so far, which may include
/// the start of the body or of a tunneled payload.
pub async fn read_request<S>(stream: &mut S) -> ForwardResult<(ProxyRequest, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ForwardError::Http("connection closed mid-request".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(request) = ProxyRequest::parse(&buf)? {
            return Ok((request, buf));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ForwardError::Http("request head too large".to_string()));
        }
    }
}

/// Dial the target of `request`
pub async fn dial(request: &ProxyRequest) -> ForwardResult<TcpStream> {
    let addr = resolve_host(&request.host, request.port).await?;
    Ok(TcpStream::connect(addr).await?)
}

/// Complete a request whose upstream is already connected, then pump
///
/// CONNECT answers the client with `200 Connection Established` and passes
/// on any bytes that followed the head; other methods send the raw request
/// upstream.
pub async fn relay<C>(
    mut client: C,
    mut upstream: TcpStream,
    request: &ProxyRequest,
    raw: &[u8],
) -> ForwardResult<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    if request.is_connect() {
        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;
        if raw.len() > request.head_len {
            upstream.write_all(&raw[request.head_len..]).await?;
        }
    } else {
        upstream.write_all(raw).await?;
    }

    pump::copy(client, upstream).await?;
    Ok(())
}

pub struct HttpInbound {
    tag: String,
    listener: TcpListener,
    credentials: Option<Credentials>,
    ctx: Arc<ForwardContext>,
}

impl HttpInbound {
    pub async fn bind(config: &InboundConfig, ctx: Arc<ForwardContext>) -> ForwardResult<Self> {
        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        info!(
            tag = %config.tag,
            "HTTP inbound listening on {}",
            listener.local_addr()?
        );

        Ok(Self {
            tag: config.tag.clone(),
            listener,
            credentials: config.credentials().cloned(),
            ctx,
        })
    }

    pub fn local_addr(&self) -> ForwardResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until cancelled or the listener fails
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(tag = %self.tag, "HTTP inbound cancelled");
                    return;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((client, peer)) => {
                    debug!(tag = %self.tag, peer = %peer, "Accepted HTTP client");
                    let inbound = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inbound.handle_client(client).await {
                            warn!(tag = %inbound.tag, peer = %peer, "HTTP client failed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!(tag = %self.tag, "HTTP inbound accept failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn handle_client(&self, mut client: TcpStream) -> ForwardResult<()> {
        let (request, raw) = read_request(&mut client).await?;
        debug!(
            tag = %self.tag,
            method = %request.method,
            "Request to {}:{}",
            request.host,
            request.port
        );

        if let Some(credentials) = &self.credentials {
            if !request.is_authorized(credentials) {
                client.write_all(AUTH_REQUIRED).await?;
                let _ = client.shutdown().await;
                return Ok(());
            }
        }

        match self.ctx.route(&self.tag, &request.host).await {
            Route::Direct => {
                let upstream = match dial(&request).await {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        let _ = client.write_all(BAD_GATEWAY).await;
                        return Err(e);
                    }
                };
                relay(client, upstream, &request, &raw).await
            }
            Route::Tunnel(tag) => {
                let stream = match self.ctx.open_tunnel(&tag, &InitialPacket::http(raw)).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = client.write_all(BAD_GATEWAY).await;
                        return Err(e);
                    }
                };
                pump::copy(client, stream).await?;
                Ok(())
            }
        }
    }
}
