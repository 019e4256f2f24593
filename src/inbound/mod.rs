//! Client-facing proxy frontends

mod http;
mod session;
mod socks5;

pub use http::HttpListener;
pub use session::{ClientIdentity, Connected, SessionCore, CLIENT_HANDSHAKE_TIMEOUT};
pub use socks5::Socks5Listener;

use crate::common::net::configure_tcp_stream;
use crate::Result;
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Trait for inbound listeners
#[async_trait]
pub trait InboundListener: Send + Sync {
    /// Get listener name
    fn name(&self) -> &'static str;

    /// Accept clients until `cancel` fires. In-flight sessions keep running.
    async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()>;
}

/// Accept loop shared by the frontends. Each client runs as a tracked task.
pub(crate) async fn accept_loop<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    core: Arc<SessionCore>,
    cancel: CancellationToken,
    handle: F,
) -> Result<()>
where
    F: Fn(Arc<SessionCore>, TcpStream, SocketAddr) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("{} proxy listening on {}", name, addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    configure_tcp_stream(&stream);
                    core.tracker().spawn(handle(core.clone(), stream, peer));
                }
                Err(e) => error!("{} accept error: {}", name, e),
            }
        }
    }

    info!("{} proxy on {} stopped accepting", name, addr);
    Ok(())
}
