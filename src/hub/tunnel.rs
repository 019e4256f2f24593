//! Reverse tunnel acceptor
//!
//! A node answers `open_tunnel` by connecting to the tunnel port and writing a
//! [`TunnelHello`] line. The stream is then handed to whoever is waiting on
//! that tunnel ID.

use super::{NodeHub, TunnelHello};
use crate::common::net::{configure_tcp_stream, PrefixedStream};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

const HELLO_LIMIT: u64 = 1024;

pub(super) async fn serve(hub: Arc<NodeHub>, listener: TcpListener, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("reverse tunnel listener on {}", addr);
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let hub = hub.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept_tunnel(&hub, stream, peer).await {
                            debug!(%peer, error = %e, "tunnel rejected");
                        }
                    });
                }
                Err(e) => error!("tunnel accept error: {}", e),
            }
        }
    }
}

async fn accept_tunnel(hub: &NodeHub, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    configure_tcp_stream(&stream);
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    let mut limited = (&mut reader).take(HELLO_LIMIT);
    let n = tokio::time::timeout(hub.config.handshake_timeout(), limited.read_line(&mut line))
        .await
        .map_err(|_| Error::timeout("tunnel hello timed out"))??;
    if n == 0 || !line.ends_with('\n') {
        return Err(Error::protocol("incomplete tunnel hello"));
    }

    let hello: TunnelHello = serde_json::from_str(line.trim_end())
        .map_err(|e| Error::protocol(format!("bad tunnel hello: {}", e)))?;

    let pending = hub
        .pending_tunnels
        .remove_if(&hello.tunnel_id, |_, p| p.node_id == hello.node_id)
        .map(|(_, p)| p)
        .ok_or_else(|| {
            Error::protocol(format!(
                "unknown tunnel {} from node {}",
                hello.tunnel_id, hello.node_id
            ))
        })?;

    let stream = PrefixedStream::from_buf_reader(reader);
    if pending.tx.send(Box::new(stream)).is_err() {
        // dialer already timed out
        trace!(tunnel_id = %hello.tunnel_id, "late tunnel dropped");
        return Ok(());
    }
    trace!(tunnel_id = %hello.tunnel_id, node_id = %hello.node_id, %peer, "tunnel established");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::pool::TunnelConnector;
    use crate::registry::NodeRegistry;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::OwnedReadHalf;

    async fn read_json(reader: &mut BufReader<OwnedReadHalf>) -> serde_json::Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_open_tunnel_via_reverse_connection() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(90)));
        let hub = Arc::new(NodeHub::new(registry, HubConfig::default()));
        let cancel = CancellationToken::new();

        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control.local_addr().unwrap();
        let tunnels = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_addr = tunnels.local_addr().unwrap();
        tokio::spawn(hub.clone().serve(control, cancel.clone()));
        tokio::spawn(hub.clone().serve_tunnels(tunnels, cancel.clone()));

        let (r, mut w) = TcpStream::connect(control_addr).await.unwrap().into_split();
        let mut reader = BufReader::new(r);
        w.write_all(b"{\"type\":\"register\",\"data\":{\"node_id\":\"n1\",\"country\":\"US\"}}\n")
            .await
            .unwrap();
        read_json(&mut reader).await;

        let node = tokio::spawn(async move {
            let req = read_json(&mut reader).await;
            assert_eq!(req["type"], "open_tunnel");
            let tunnel_id = req["data"]["tunnel_id"].as_str().unwrap().to_string();
            let mut t = TcpStream::connect(tunnel_addr).await.unwrap();
            let hello = format!(
                "{{\"tunnel_id\":\"{}\",\"node_id\":\"n1\"}}\nEARLY",
                tunnel_id
            );
            t.write_all(hello.as_bytes()).await.unwrap();
            (t, w)
        });

        let mut stream = hub.open_tunnel("n1").await.unwrap();
        let mut early = [0u8; 5];
        stream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"EARLY");
        let _ = node.await.unwrap();
        assert!(hub.pending_tunnels.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tunnel_id_rejected() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(90)));
        let hub = Arc::new(NodeHub::new(registry, HubConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut t = TcpStream::connect(addr).await.unwrap();
            t.write_all(b"{\"tunnel_id\":\"nope\",\"node_id\":\"n1\"}\n")
                .await
                .unwrap();
            t
        });
        let (stream, peer) = listener.accept().await.unwrap();
        let err = accept_tunnel(&hub, stream, peer).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        let _ = client.await.unwrap();
    }
}
