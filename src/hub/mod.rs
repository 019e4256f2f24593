//! Node control plane
//!
//! Each exit node holds one long-lived control connection. [`NodeHub`] runs the
//! registration handshake, mirrors heartbeats into the [`NodeRegistry`], and
//! pushes pings, tunnel requests and maintenance commands back to nodes.

mod message;
mod tunnel;

pub use message::{GatewayMessage, NodeCommand, NodeMessage, Registration, TunnelHello};

use crate::common::net::{configure_tcp_stream, BoxedStream};
use crate::config::HubConfig;
use crate::pool::{Prober, TunnelConnector};
use crate::registry::{NodeRegistry, NodeStatus, RegistryEvent, RemovalReason};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const OUTBOUND_QUEUE: usize = 64;

struct NodeHandle {
    conn_id: u64,
    tx: mpsc::Sender<GatewayMessage>,
    cancel: CancellationToken,
}

struct PendingTunnel {
    node_id: String,
    tx: oneshot::Sender<BoxedStream>,
}

/// Removes a pending entry when the waiting side gives up
struct PendingGuard<'a, K: Eq + std::hash::Hash, V> {
    map: &'a DashMap<K, V>,
    key: Option<K>,
}

impl<K: Eq + std::hash::Hash, V> Drop for PendingGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.map.remove(&key);
        }
    }
}

/// Owner of all node control connections
pub struct NodeHub {
    registry: Arc<NodeRegistry>,
    config: HubConfig,
    nodes: DashMap<String, NodeHandle>,
    next_conn_id: AtomicU64,
    next_nonce: AtomicU64,
    pending_pongs: DashMap<u64, oneshot::Sender<()>>,
    pending_tunnels: DashMap<String, PendingTunnel>,
}

impl NodeHub {
    pub fn new(registry: Arc<NodeRegistry>, config: HubConfig) -> Self {
        NodeHub {
            registry,
            config,
            nodes: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            next_nonce: AtomicU64::new(1),
            pending_pongs: DashMap::new(),
            pending_tunnels: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Nodes with an open control connection
    pub fn connected_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Send a maintenance command to one node.
    ///
    /// Drain and resume change registry status before the node hears about it,
    /// so selection stops immediately. Disconnect closes the control connection.
    pub async fn broadcast_command(&self, node_id: &str, command: NodeCommand) -> Result<()> {
        let (tx, cancel) = match self.nodes.get(node_id) {
            Some(h) => (h.tx.clone(), h.cancel.clone()),
            None => {
                return Err(Error::node_unreachable(format!(
                    "node {} is not connected",
                    node_id
                )))
            }
        };

        match command {
            NodeCommand::Drain => {
                self.registry.set_status(node_id, NodeStatus::Draining);
            }
            NodeCommand::Resume => {
                self.registry.set_status(node_id, NodeStatus::Active);
            }
            NodeCommand::Disconnect => {}
        }

        let sent = tx.send(GatewayMessage::Command { command }).await;
        if command == NodeCommand::Disconnect {
            cancel.cancel();
        }
        info!(node_id, %command, "node command issued");
        sent.map_err(|_| Error::node_unreachable(format!("node {} control channel closed", node_id)))
    }

    async fn send(&self, node_id: &str, msg: GatewayMessage) -> Result<()> {
        let tx = match self.nodes.get(node_id) {
            Some(h) => h.tx.clone(),
            None => {
                return Err(Error::node_unreachable(format!(
                    "node {} is not connected",
                    node_id
                )))
            }
        };
        tx.send(msg)
            .await
            .map_err(|_| Error::node_unreachable(format!("node {} control channel closed", node_id)))
    }

    /// Accept control connections until cancelled
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("node control channel listening on {}", addr);
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = self.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_connection(stream, peer, cancel).await {
                                debug!(%peer, error = %e, "node control connection ended");
                            }
                        });
                    }
                    Err(e) => error!("control accept error: {}", e),
                }
            }
        }
        // closes every node connection
        for entry in self.nodes.iter() {
            entry.cancel.cancel();
        }
    }

    /// Disconnect nodes that the registry evicted while their socket stayed open
    pub fn spawn_eviction_watcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(RegistryEvent::Removed { node_id, reason: RemovalReason::Timeout }) => {
                            if let Some(h) = hub.nodes.get(&node_id) {
                                debug!(node_id = %node_id, "closing control connection of evicted node");
                                h.cancel.cancel();
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "hub lagged behind registry events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<()> {
        configure_tcp_stream(&stream);
        let framed = Framed::new(
            stream,
            LinesCodec::new_with_max_length(self.config.max_message_bytes),
        );
        let (mut sink, mut lines) = framed.split();

        let registration = match self.read_registration(&mut lines).await {
            Ok(reg) => reg,
            Err(e) => {
                let reply = GatewayMessage::Error {
                    message: e.to_string(),
                };
                if let Ok(line) = reply.encode() {
                    let _ = sink.send(line).await;
                }
                return Err(e);
            }
        };

        let node_id = registration.node_id.clone();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        let (tx, mut rx) = mpsc::channel::<GatewayMessage>(OUTBOUND_QUEUE);
        let previous = self.nodes.insert(
            node_id.clone(),
            NodeHandle {
                conn_id,
                tx,
                cancel: cancel.clone(),
            },
        );

        // reachable through `nodes` before selection can see it, and only
        // selectable once the ack is on the wire
        let outcome = self
            .registry
            .begin_registration(&node_id, registration.attrs, conn_id);
        if let Some(prev) = previous {
            debug!(node_id = %node_id, old_conn = prev.conn_id, "node reconnected, closing old connection");
            prev.cancel.cancel();
        }

        let ack = GatewayMessage::Ack {
            node_id: node_id.clone(),
        };
        let acked = match ack.encode() {
            Ok(line) => sink.send(line).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = acked {
            self.nodes.remove_if(&node_id, |_, h| h.conn_id == conn_id);
            self.registry.remove_connection(&node_id, conn_id);
            return Err(e);
        }
        self.registry.confirm(&node_id, conn_id);
        info!(node_id = %node_id, %peer, conn_id, ?outcome, "node connected");

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let line = match msg.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "failed to encode control message");
                        continue;
                    }
                };
                if sink.send(line).await.is_err() {
                    writer_cancel.cancel();
                    break;
                }
            }
        });

        let result = self.read_loop(&node_id, conn_id, &mut lines, &cancel).await;

        writer.abort();
        self.nodes.remove_if(&node_id, |_, h| h.conn_id == conn_id);
        if self.registry.remove_connection(&node_id, conn_id) {
            info!(node_id = %node_id, conn_id, "node disconnected");
        }
        result
    }

    async fn read_registration<S>(&self, lines: &mut S) -> Result<Registration>
    where
        S: futures::Stream<Item = std::result::Result<String, tokio_util::codec::LinesCodecError>>
            + Unpin,
    {
        let first = tokio::time::timeout(self.config.handshake_timeout(), lines.next())
            .await
            .map_err(|_| Error::timeout("registration handshake timed out"))?;
        let line = match first {
            Some(line) => line?,
            None => return Err(Error::protocol("connection closed before register")),
        };
        match NodeMessage::parse(&line)? {
            NodeMessage::Register(reg) => {
                reg.validate()?;
                Ok(reg)
            }
            other => Err(Error::protocol(format!(
                "expected register, got {:?}",
                other
            ))),
        }
    }

    async fn read_loop<S>(
        &self,
        node_id: &str,
        conn_id: u64,
        lines: &mut S,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: futures::Stream<Item = std::result::Result<String, tokio_util::codec::LinesCodecError>>
            + Unpin,
    {
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = lines.next() => match next {
                    Some(line) => line?,
                    None => return Ok(()),
                },
            };

            // applied before the next message is read
            match NodeMessage::parse(&line)? {
                NodeMessage::Heartbeat { node_id: id } => {
                    if id != node_id {
                        return Err(Error::protocol(format!(
                            "heartbeat for {} on connection of {}",
                            id, node_id
                        )));
                    }
                    if !self.registry.mark_heartbeat(node_id) {
                        return Err(Error::inconsistency(format!(
                            "node {} no longer registered",
                            node_id
                        )));
                    }
                    trace!(node_id, "heartbeat");
                }
                NodeMessage::Pong { nonce } => {
                    if let Some((_, tx)) = self.pending_pongs.remove(&nonce) {
                        let _ = tx.send(());
                    }
                }
                NodeMessage::Register(reg) => {
                    if reg.node_id != node_id {
                        return Err(Error::protocol("node_id changed on open connection"));
                    }
                    reg.validate()?;
                    self.registry.upsert(node_id, reg.attrs, conn_id);
                    let _ = self
                        .send(
                            node_id,
                            GatewayMessage::Ack {
                                node_id: node_id.to_string(),
                            },
                        )
                        .await;
                }
                NodeMessage::Error { message } => {
                    warn!(node_id, message = %message, "node reported error");
                }
            }
        }
    }

    /// Accept reverse tunnel connections until cancelled
    pub async fn serve_tunnels(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        tunnel::serve(self, listener, cancel).await
    }
}

#[async_trait]
impl Prober for NodeHub {
    async fn probe(&self, node_id: &str) -> Result<Duration> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_pongs.insert(nonce, tx);
        let _guard = PendingGuard {
            map: &self.pending_pongs,
            key: Some(nonce),
        };

        let started = Instant::now();
        self.send(node_id, GatewayMessage::Ping { nonce }).await?;
        rx.await
            .map_err(|_| Error::node_unreachable(format!("node {} dropped ping", node_id)))?;
        Ok(started.elapsed())
    }
}

#[async_trait]
impl TunnelConnector for NodeHub {
    async fn open_tunnel(&self, node_id: &str) -> Result<BoxedStream> {
        let tunnel_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_tunnels.insert(
            tunnel_id.clone(),
            PendingTunnel {
                node_id: node_id.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard {
            map: &self.pending_tunnels,
            key: Some(tunnel_id.clone()),
        };

        self.send(
            node_id,
            GatewayMessage::OpenTunnel {
                tunnel_id: tunnel_id.clone(),
            },
        )
        .await?;
        rx.await
            .map_err(|_| Error::node_unreachable(format!("tunnel {} to {} abandoned", tunnel_id, node_id)))
    }
}
