//! HTTP forward-proxy frontend
//!
//! One request per client connection. `CONNECT host:port` becomes a raw relay;
//! an absolute-URI request is rewritten to origin form with `Connection: close`
//! and relayed until the origin closes.

use super::session::{ClientIdentity, SessionCore, CLIENT_HANDSHAKE_TIMEOUT};
use super::{accept_loop, InboundListener};
use crate::auth::Credential;
use crate::common::net::PrefixedStream;
use crate::registry::Protocol;
use crate::statistic::TrackedSession;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use httparse::{Request as HttpRequest, Status as HttpStatus, EMPTY_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const FRONTEND: &str = "http";
const MAX_HTTP_HEAD_BYTES: usize = 32 * 1024;
const MAX_HTTP_HEADERS: usize = 64;

/// Where a request wants to go
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Connect {
        host: String,
        port: u16,
    },
    Forward {
        host: String,
        port: u16,
        /// Host header value
        authority: String,
        path: String,
    },
}

impl Target {
    fn host_port(&self) -> (&str, u16) {
        match self {
            Target::Connect { host, port } | Target::Forward { host, port, .. } => (host, *port),
        }
    }
}

/// Parsed request head, owned
struct RequestHead {
    method: String,
    target: Target,
    headers: Vec<(String, Vec<u8>)>,
    /// Bytes after the head that were already read
    body_prefix: Vec<u8>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

pub struct HttpListener {
    core: Arc<SessionCore>,
}

impl HttpListener {
    pub fn new(core: Arc<SessionCore>) -> Self {
        HttpListener { core }
    }

    async fn handle_connection(core: Arc<SessionCore>, stream: TcpStream, peer: SocketAddr) {
        let session = core.begin(FRONTEND, peer);
        if let Err(e) = Self::process_connection(&core, &session, stream, peer).await {
            debug!("HTTP session from {} ended: {}", peer, e);
        }
        core.end(&session);
    }

    async fn process_connection(
        core: &SessionCore,
        session: &Arc<TrackedSession>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let head = tokio::time::timeout(CLIENT_HANDSHAKE_TIMEOUT, read_head(&mut stream))
            .await
            .map_err(|_| Error::protocol("HTTP request head timed out"))
            .and_then(|r| r);
        let head = match head {
            Ok(head) => head,
            Err(e) => {
                core.fail(session, None, None, &e);
                return reject(&mut stream, e).await;
            }
        };
        let (host, port) = head.target.host_port();
        let (host, port) = (host.to_string(), port);
        debug!("HTTP {} {} -> {}:{}", head.method, peer, host, port);

        let _permit = match core.admit() {
            Ok(permit) => permit,
            Err(e) => {
                core.fail(session, None, None, &e);
                return reject(&mut stream, e).await;
            }
        };

        let credential = head
            .header("proxy-authorization")
            .ok_or_else(|| Error::auth("proxy authorization required"))
            .and_then(|v| {
                std::str::from_utf8(v).map_err(|_| Error::auth("proxy authorization is not utf-8"))
            })
            .and_then(Credential::from_basic);
        let credential = match credential {
            Ok(c) => c,
            Err(e) => {
                core.fail(session, None, None, &e);
                return reject(&mut stream, e).await;
            }
        };

        let ctx = match core
            .authenticate(session, &ClientIdentity::Credential(credential))
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => return reject(&mut stream, e).await,
        };

        let connected = match core
            .connect(session, &ctx, Protocol::Http, &host, port, &stream)
            .await
        {
            Ok(c) => c,
            Err(e) => return reject(&mut stream, e).await,
        };

        let prefix = match &head.target {
            Target::Connect { .. } => {
                if let Err(e) = stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                {
                    let err = Error::from(e);
                    core.abandon(session, &ctx, connected, &err);
                    return Err(err);
                }
                head.body_prefix.clone()
            }
            Target::Forward { .. } => {
                let mut forwarded = rewrite_head(&head);
                forwarded.extend_from_slice(&head.body_prefix);
                forwarded
            }
        };

        // the prefix is replayed toward the node first and counted as upload
        let client = PrefixedStream::new(stream, prefix);
        core.relay(session, &ctx, client, connected).await?;
        Ok(())
    }
}

#[async_trait]
impl InboundListener for HttpListener {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        accept_loop(self.name(), listener, self.core.clone(), cancel, Self::handle_connection).await
    }
}

async fn read_head(stream: &mut TcpStream) -> Result<RequestHead> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    while find_head_end(&buf).is_none() {
        if buf.len() >= MAX_HTTP_HEAD_BYTES {
            return Err(Error::protocol("HTTP header too large"));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::protocol("unexpected EOF in HTTP request head"));
        }
    }
    parse_head(&buf)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(buf: &[u8]) -> Result<RequestHead> {
    let mut headers_buf = [EMPTY_HEADER; MAX_HTTP_HEADERS];
    let mut req = HttpRequest::new(&mut headers_buf);
    let head_len = match req.parse(buf) {
        Ok(HttpStatus::Complete(len)) => len,
        Ok(HttpStatus::Partial) => return Err(Error::protocol("incomplete HTTP request")),
        Err(e) => return Err(Error::protocol(format!("invalid HTTP request: {}", e))),
    };

    let method = req
        .method
        .ok_or_else(|| Error::protocol("invalid HTTP request line"))?;
    let uri = req
        .path
        .ok_or_else(|| Error::protocol("invalid HTTP request line"))?;

    let target = if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = parse_host_port(uri, None)?;
        Target::Connect { host, port }
    } else {
        parse_absolute_uri(uri)?
    };

    Ok(RequestHead {
        method: method.to_string(),
        target,
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
        body_prefix: buf[head_len..].to_vec(),
    })
}

fn parse_absolute_uri(uri: &str) -> Result<Target> {
    if uri.len() >= 8 && uri[..8].eq_ignore_ascii_case("https://") {
        return Err(Error::protocol("https requests must use CONNECT"));
    }
    let rest = match uri.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("http://") => &uri[7..],
        _ => return Err(Error::protocol(format!("not an absolute http URI: {}", uri))),
    };
    let (authority, path) = match rest.find(|c| c == '/' || c == '?') {
        Some(idx) if rest.as_bytes()[idx] == b'?' => (&rest[..idx], format!("/{}", &rest[idx..])),
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    // drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let (host, port) = parse_host_port(authority, Some(80))?;
    Ok(Target::Forward {
        host,
        port,
        authority: authority.to_string(),
        path,
    })
}

/// Parse `host[:port]` or `[v6]:port`. Without a default the port is required.
fn parse_host_port(authority: &str, default_port: Option<u16>) -> Result<(String, u16)> {
    let invalid = || Error::protocol(format!("invalid authority: {}", authority));
    if authority.is_empty() {
        return Err(invalid());
    }

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(invalid)?;
        let host = &rest[..end];
        let port = match &rest[end + 1..] {
            "" => None,
            p => Some(p.strip_prefix(':').ok_or_else(invalid)?),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => default_port.ok_or_else(invalid)?,
    };
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Origin-form request head sent through the tunnel
fn rewrite_head(head: &RequestHead) -> Vec<u8> {
    let (authority, path) = match &head.target {
        Target::Forward {
            authority, path, ..
        } => (authority.as_str(), path.as_str()),
        Target::Connect { .. } => return Vec::new(),
    };

    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(head.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    out.extend_from_slice(authority.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in &head.headers {
        if is_hop_by_hop_header(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

/// Headers that must not travel past the proxy. Framing headers stay so the
/// body can be streamed untouched.
fn is_hop_by_hop_header(header: &str) -> bool {
    matches!(
        header.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "upgrade"
    )
}

/// Status line for an error that ended the session before relaying
fn status_for(err: &Error) -> (u16, &'static str) {
    match err {
        Error::AuthFailure(_) => (407, "Proxy Authentication Required"),
        Error::QuotaExceeded(_) => (402, "Payment Required"),
        Error::NoAvailableNode(_) => (503, "Service Unavailable"),
        Error::Target(_) => (502, "Bad Gateway"),
        Error::Protocol(_) => (400, "Bad Request"),
        _ => (500, "Internal Server Error"),
    }
}

fn error_response(err: &Error) -> String {
    let (code, reason) = status_for(err);
    let challenge = if code == 407 {
        "Proxy-Authenticate: Basic realm=\"nodegate\"\r\n"
    } else {
        ""
    };
    format!(
        "HTTP/1.1 {} {}\r\n{}Content-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        challenge,
        reason.len(),
        reason
    )
}

async fn reject(stream: &mut TcpStream, err: Error) -> Result<()> {
    // the client may already be gone
    let _ = stream.write_all(error_response(&err).as_bytes()).await;
    let _ = stream.shutdown().await;
    Err(err)
}
