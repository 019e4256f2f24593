//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinSet;

const RELAY_BUF_SIZE: usize = 16 * 1024;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Byte stream that can carry relayed traffic (client socket or node tunnel)
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// SOCKS5 address type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Parse from SOCKS5 format
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Self, u16)> {
        let mut atyp = [0u8; 1];
        reader.read_exact(&mut atyp).await?;

        match atyp[0] {
            0x01 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok((addr, port))
            }
            0x03 => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let len = len[0] as usize;
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8(buf[..len].to_vec())
                    .map_err(|e| Error::parse(format!("Invalid domain: {}", e)))?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok((Address::Domain(domain), port))
            }
            0x04 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                let addr = Address::Ipv6(Ipv6Addr::from(ip));
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok((addr, port))
            }
            t => Err(Error::protocol(format!("Unknown address type: {}", t))),
        }
    }

    /// Encode in SOCKS5 format
    pub fn to_bytes(&self, port: u16) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len());
        match self {
            Address::Ipv4(ip) => {
                buf.push(0x01);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.push(0x04);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                if bytes.len() > 255 {
                    return Err(Error::protocol("Domain name too long"));
                }
                buf.push(0x03);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.extend_from_slice(&port.to_be_bytes());
        Ok(buf)
    }

    /// Get bytes length
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 1 + 4 + 2,             // atyp + ip + port
            Address::Ipv6(_) => 1 + 16 + 2,            // atyp + ip + port
            Address::Domain(d) => 1 + 1 + d.len() + 2, // atyp + len + domain + port
        }
    }

    /// Host part as sent to an exit node
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<String> for Address {
    fn from(domain: String) -> Self {
        if let Ok(ip) = domain.parse::<Ipv4Addr>() {
            return Address::Ipv4(ip);
        }
        let trimmed = domain.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = trimmed.parse::<Ipv6Addr>() {
            return Address::Ipv6(ip);
        }
        Address::Domain(domain)
    }
}

/// Stream that replays bytes already pulled into a read buffer before
/// reading from the inner stream again.
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Vec<u8>,
    pos: usize,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            pos: 0,
        }
    }

    pub fn from_buf_reader(reader: BufReader<S>) -> Self
    where
        S: AsyncRead,
    {
        let prefix = reader.buffer().to_vec();
        let inner = reader.into_inner();
        Self::new(inner, prefix)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Receives byte counts while a relay is running
pub trait RelayObserver: Send + Sync + 'static {
    fn on_upload(&self, bytes: u64);
    fn on_download(&self, bytes: u64);
}

/// Relay bytes between a client and a node tunnel until both sides close.
///
/// Each direction runs as its own task. A clean EOF is forwarded as a write
/// shutdown and the other direction keeps draining, so a half-closed client
/// still gets its response. An error in either direction aborts the other.
/// Counts are recorded chunk by chunk and stay exact for an aborted side.
/// Returns `(upload, download)` where upload is client -> node.
pub async fn relay<C, N>(
    client: C,
    node: N,
    observer: Arc<dyn RelayObserver>,
) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    N: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (node_r, node_w) = tokio::io::split(node);

    let upload = Arc::new(AtomicU64::new(0));
    let download = Arc::new(AtomicU64::new(0));

    let mut set = JoinSet::new();
    {
        let observer = observer.clone();
        let upload = upload.clone();
        set.spawn(pump(client_r, node_w, move |n| {
            upload.fetch_add(n, Ordering::Relaxed);
            observer.on_upload(n);
        }));
    }
    {
        let download = download.clone();
        set.spawn(pump(node_r, client_w, move |n| {
            download.fetch_add(n, Ordering::Relaxed);
            observer.on_download(n);
        }));
    }

    let mut failure = None;
    while let Some(joined) = set.join_next().await {
        let err = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) if e.is_cancelled() => continue,
            Err(e) => io::Error::new(io::ErrorKind::Other, e),
        };
        set.abort_all();
        failure.get_or_insert(err);
    }

    let totals = (
        upload.load(Ordering::Relaxed),
        download.load(Ordering::Relaxed),
    );
    match failure {
        Some(e) if totals == (0, 0) => Err(e),
        _ => Ok(totals),
    }
}

async fn pump<R, W, F>(
    mut reader: R,
    mut writer: W,
    on_bytes: F,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        on_bytes(n as u64);
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Resolves once the peer closes its end of `stream`.
///
/// Used while a session is still selecting a node, so that a client that
/// hangs up aborts the in-flight dial. Early pipelined bytes are left unread.
pub async fn wait_closed(stream: &TcpStream) {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending::<()>().await,
    }
}
