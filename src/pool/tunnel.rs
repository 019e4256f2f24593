//! Pre-dialed reverse tunnels
//!
//! Exit nodes sit behind NAT, so "dialing" a node means asking it over its
//! control channel to open a connection back to the gateway. That round trip is
//! what this pool hides from the request path.

use super::index::{matches, MatchLevel, NodeIndex};
use super::warm::WarmPool;
use super::{Criteria, Step};
use crate::common::net::{BoxedStream, PrefixedStream};
use crate::config::TunnelPoolConfig;
use crate::registry::{NodeRegistry, RegistryEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Raw byte stream of a reverse tunnel
pub type TunnelStream = BoxedStream;

const ACTIVATION_REPLY_LIMIT: u64 = 4096;

/// Opens reverse tunnels to nodes
#[async_trait]
pub trait TunnelConnector: Send + Sync + 'static {
    /// Ask `node_id` for a new tunnel and wait until it connects back
    async fn open_tunnel(&self, node_id: &str) -> Result<TunnelStream>;
}

/// Where an acquired tunnel came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelSource {
    Idle,
    Warm,
    Index,
}

impl fmt::Display for TunnelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelSource::Idle => "idle",
            TunnelSource::Warm => "warm",
            TunnelSource::Index => "index",
        };
        f.write_str(s)
    }
}

struct InUseGuard(Arc<AtomicUsize>);

impl InUseGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        InUseGuard(counter)
    }
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// An established tunnel to one node, not yet bound to a target.
///
/// Not `Clone`. The pool moves a tunnel out on handoff and one session owns it.
pub struct Tunnel {
    id: String,
    node_id: String,
    stream: TunnelStream,
    created_at: Instant,
    source: TunnelSource,
    in_use: Option<InUseGuard>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Serialize)]
struct ActivateRequest<'a> {
    host: &'a str,
    port: u16,
}

#[derive(Deserialize)]
struct ActivateReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl Tunnel {
    pub fn new(node_id: &str, stream: TunnelStream, source: TunnelSource) -> Self {
        Tunnel {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            stream,
            created_at: Instant::now(),
            source,
            in_use: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn source(&self) -> TunnelSource {
        self.source
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn is_stale(&self, max_idle: Duration) -> bool {
        self.age() >= max_idle
    }

    /// Point the tunnel at `host:port` and wait for the node's verdict.
    ///
    /// On success the returned stream carries raw bytes to the target. Bytes the
    /// node sent right after its reply are replayed first.
    pub async fn activate(self, host: &str, port: u16, timeout: Duration) -> Result<ActiveTunnel> {
        let Tunnel {
            node_id,
            mut stream,
            in_use,
            ..
        } = self;

        let handshake = async {
            let mut line = serde_json::to_vec(&ActivateRequest { host, port })?;
            line.push(b'\n');
            stream.write_all(&line).await?;
            stream.flush().await?;

            let mut reader = BufReader::new(stream);
            let mut reply = String::new();
            let n = (&mut reader)
                .take(ACTIVATION_REPLY_LIMIT)
                .read_line(&mut reply)
                .await?;
            if n == 0 || !reply.ends_with('\n') {
                return Err(Error::node_unreachable("tunnel closed during activation"));
            }
            let reply: ActivateReply = serde_json::from_str(reply.trim_end())
                .map_err(|e| Error::node_unreachable(format!("bad activation reply: {}", e)))?;
            if !reply.ok {
                return Err(Error::target(
                    reply.error.unwrap_or_else(|| "target unreachable".to_string()),
                ));
            }
            Ok::<_, Error>(PrefixedStream::from_buf_reader(reader))
        };

        let stream = match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(Error::Io(e))) => {
                return Err(Error::node_unreachable(format!("tunnel io: {}", e)))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::node_unreachable("tunnel activation timed out")),
        };

        Ok(ActiveTunnel {
            node_id,
            stream: Box::new(stream),
            in_use,
        })
    }
}

/// Tunnel bound to a target
pub struct ActiveTunnel {
    pub node_id: String,
    pub stream: TunnelStream,
    in_use: Option<InUseGuard>,
}

impl fmt::Debug for ActiveTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTunnel")
            .field("node_id", &self.node_id)
            .field("in_use", &self.in_use.is_some())
            .finish()
    }
}

impl ActiveTunnel {
    /// Stream plus a handle that keeps the tunnel counted as in use
    pub fn into_parts(self) -> (TunnelStream, impl Send + 'static) {
        (self.stream, self.in_use)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelPoolStats {
    pub idle: usize,
    pub idle_nodes: usize,
    pub in_use: usize,
    pub dialing: usize,
    pub hits: u64,
    pub misses: u64,
    pub dials_ok: u64,
    pub dials_failed: u64,
    pub expired: u64,
}

struct DialBudget {
    remaining: usize,
    tried: HashSet<String>,
    last_error: Option<Error>,
}

pub struct TunnelPool {
    registry: Arc<NodeRegistry>,
    index: Arc<NodeIndex>,
    warm: Arc<WarmPool>,
    connector: Arc<dyn TunnelConnector>,
    config: TunnelPoolConfig,
    idle: Mutex<HashMap<String, VecDeque<Tunnel>>>,
    in_use: Arc<AtomicUsize>,
    dialing: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    dials_ok: AtomicU64,
    dials_failed: AtomicU64,
    expired: AtomicU64,
}

impl TunnelPool {
    pub fn new(
        index: Arc<NodeIndex>,
        warm: Arc<WarmPool>,
        connector: Arc<dyn TunnelConnector>,
        config: TunnelPoolConfig,
    ) -> Self {
        TunnelPool {
            registry: index.registry().clone(),
            index,
            warm,
            connector,
            config,
            idle: Mutex::new(HashMap::new()),
            in_use: Arc::new(AtomicUsize::new(0)),
            dialing: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            dials_ok: AtomicU64::new(0),
            dials_failed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        self.config.dial_timeout()
    }

    /// Hand out a tunnel matching `criteria`, never one to a node in `exclude`.
    ///
    /// Tries an idle tunnel, then a synchronous dial to a warm node, then a
    /// synchronous dial to any index match. Dials are bounded across distinct
    /// nodes; when the budget runs out the result is `NoAvailableNode`.
    pub async fn acquire(&self, criteria: &Criteria, exclude: &HashSet<String>) -> Result<Tunnel> {
        let mut budget = DialBudget {
            remaining: self.config.max_dial_attempts,
            tried: exclude.clone(),
            last_error: None,
        };

        for source in [TunnelSource::Idle, TunnelSource::Warm, TunnelSource::Index] {
            let step = match source {
                TunnelSource::Idle => self.try_idle(criteria, &budget.tried),
                TunnelSource::Warm => self.try_warm(criteria, &mut budget).await,
                TunnelSource::Index => self.try_index(criteria, &mut budget).await,
            };
            match step {
                Step::Found(mut tunnel) => {
                    tunnel.in_use = Some(InUseGuard::new(self.in_use.clone()));
                    debug!(
                        node_id = %tunnel.node_id,
                        source = %tunnel.source,
                        "tunnel acquired"
                    );
                    return Ok(tunnel);
                }
                Step::Continue(reason) => trace!(%source, reason, "tunnel strategy skipped"),
            }
        }

        match budget.last_error {
            Some(e) => Err(Error::no_available_node(format!("all dial attempts failed: {}", e))),
            None => Err(Error::no_available_node("no matching node")),
        }
    }

    /// Return an unused tunnel after a failed handoff
    pub fn release(&self, mut tunnel: Tunnel) {
        tunnel.in_use = None;
        if tunnel.is_stale(self.config.max_idle()) || !self.registry.is_active(&tunnel.node_id) {
            trace!(node_id = %tunnel.node_id, "released tunnel discarded");
            return;
        }
        tunnel.source = TunnelSource::Idle;
        self.put_idle(tunnel);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(|q| q.len()).sum()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TunnelPoolStats {
        let (idle, idle_nodes) = {
            let idle = self.idle.lock();
            (idle.values().map(|q| q.len()).sum(), idle.len())
        };
        TunnelPoolStats {
            idle,
            idle_nodes,
            in_use: self.in_use_count(),
            dialing: self.dialing.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            dials_ok: self.dials_ok.load(Ordering::Relaxed),
            dials_failed: self.dials_failed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    fn try_idle(&self, criteria: &Criteria, tried: &HashSet<String>) -> Step<Tunnel> {
        let mut candidates: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|n| n.is_active() && !tried.contains(&n.id))
            .filter(|n| match &criteria.sticky_node {
                Some(sticky) => &n.id == sticky,
                None => matches(n, criteria, MatchLevel::Exact),
            })
            .collect();
        candidates.sort_by(|a, b| a.cmp_preference(b));

        let max_idle = self.config.max_idle();
        let mut idle = self.idle.lock();
        for node in candidates {
            let Some(queue) = idle.get_mut(&node.id) else {
                continue;
            };
            while let Some(tunnel) = queue.pop_front() {
                if tunnel.is_stale(max_idle) {
                    self.expired.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if queue.is_empty() {
                    idle.remove(&node.id);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Step::Found(tunnel);
            }
            idle.remove(&node.id);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Step::Continue("no idle tunnel")
    }

    async fn try_warm(&self, criteria: &Criteria, budget: &mut DialBudget) -> Step<Tunnel> {
        if criteria.sticky_node.is_some() {
            return Step::Continue("affinity requested");
        }
        while budget.remaining > 0 {
            let Some(node) = self.warm.pick(criteria, &budget.tried) else {
                return Step::Continue("no warm match");
            };
            if let Some(tunnel) = self.dial_counted(&node.id, TunnelSource::Warm, budget).await {
                return Step::Found(tunnel);
            }
        }
        Step::Continue("dial budget exhausted")
    }

    async fn try_index(&self, criteria: &Criteria, budget: &mut DialBudget) -> Step<Tunnel> {
        while budget.remaining > 0 {
            let Ok(selection) = self.index.select_with(criteria, &budget.tried) else {
                return Step::Continue("no index match");
            };
            if let Some(tunnel) = self
                .dial_counted(&selection.node.id, TunnelSource::Index, budget)
                .await
            {
                return Step::Found(tunnel);
            }
        }
        Step::Continue("dial budget exhausted")
    }

    async fn dial_counted(
        &self,
        node_id: &str,
        source: TunnelSource,
        budget: &mut DialBudget,
    ) -> Option<Tunnel> {
        budget.remaining -= 1;
        budget.tried.insert(node_id.to_string());
        match self.dial(node_id, source).await {
            Ok(tunnel) => Some(tunnel),
            Err(e) => {
                debug!(node_id, %source, error = %e, "tunnel dial failed");
                budget.last_error = Some(e);
                None
            }
        }
    }

    async fn dial(&self, node_id: &str, source: TunnelSource) -> Result<Tunnel> {
        if !self.registry.is_active(node_id) {
            return Err(Error::inconsistency(format!("node {} left before dial", node_id)));
        }
        self.dialing.fetch_add(1, Ordering::Relaxed);
        let res = tokio::time::timeout(self.config.dial_timeout(), self.connector.open_tunnel(node_id)).await;
        self.dialing.fetch_sub(1, Ordering::Relaxed);

        match res {
            Ok(Ok(stream)) => {
                self.dials_ok.fetch_add(1, Ordering::Relaxed);
                Ok(Tunnel::new(node_id, stream, source))
            }
            Ok(Err(e)) => {
                self.dials_failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.dials_failed.fetch_add(1, Ordering::Relaxed);
                Err(Error::node_unreachable(format!("tunnel dial to {} timed out", node_id)))
            }
        }
    }

    fn put_idle(&self, tunnel: Tunnel) {
        let mut idle = self.idle.lock();
        let total: usize = idle.values().map(|q| q.len()).sum();
        if total >= self.config.max_idle_total {
            return;
        }
        let queue = idle.entry(tunnel.node_id.clone()).or_default();
        if queue.len() < self.config.idle_per_node.max(1) {
            queue.push_back(tunnel);
        }
    }

    fn evict_node(&self, node_id: &str) {
        if let Some(q) = self.idle.lock().remove(node_id) {
            trace!(node_id, dropped = q.len(), "idle tunnels dropped");
        }
    }

    /// Drop stale tunnels and tunnels to nodes that are no longer active
    fn evict_unusable(&self) -> usize {
        let max_idle = self.config.max_idle();
        let active: HashSet<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|n| n.is_active())
            .map(|n| n.id)
            .collect();

        let mut dropped = 0;
        let mut idle = self.idle.lock();
        idle.retain(|node_id, queue| {
            if !active.contains(node_id) {
                dropped += queue.len();
                return false;
            }
            let before = queue.len();
            queue.retain(|t| !t.is_stale(max_idle));
            let expired = before - queue.len();
            self.expired.fetch_add(expired as u64, Ordering::Relaxed);
            dropped += expired;
            !queue.is_empty()
        });
        dropped
    }

    /// One fill pass over the warm set. Returns tunnels added.
    pub(crate) async fn fill(&self) -> usize {
        let dropped = self.evict_unusable();

        let plan: Vec<String> = {
            let idle = self.idle.lock();
            let mut budget = self
                .config
                .max_idle_total
                .saturating_sub(idle.values().map(|q| q.len()).sum());
            let mut plan = Vec::new();
            for entry in self.warm.entries() {
                let have = idle.get(&entry.node_id).map(|q| q.len()).unwrap_or(0);
                let need = self.config.idle_per_node.saturating_sub(have).min(budget);
                for _ in 0..need {
                    plan.push(entry.node_id.clone());
                }
                budget -= need;
                if budget == 0 {
                    break;
                }
            }
            plan
        };

        if plan.is_empty() {
            if dropped > 0 {
                trace!(dropped, "tunnel pool evicted");
            }
            return 0;
        }

        let dialed: Vec<Tunnel> = stream::iter(plan)
            .map(|node_id| async move { self.dial(&node_id, TunnelSource::Idle).await })
            .buffer_unordered(self.config.fill_concurrency.max(1))
            .filter_map(|res| async move {
                match res {
                    Ok(t) => Some(t),
                    Err(e) => {
                        trace!(error = %e, "background tunnel dial failed");
                        None
                    }
                }
            })
            .collect()
            .await;

        let added = dialed.len();
        for tunnel in dialed {
            self.put_idle(tunnel);
        }
        debug!(added, dropped, idle = self.idle_count(), "tunnel pool filled");
        added
    }

    /// Start the fill loop
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.fill_interval());
            info!(
                idle_per_node = this.config.idle_per_node,
                max_idle_total = this.config.max_idle_total,
                "tunnel pool started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.fill().await;
                    }
                    event = events.recv() => match event {
                        Ok(RegistryEvent::Removed { node_id, .. }) => this.evict_node(&node_id),
                        Ok(RegistryEvent::Registered { .. }) => {}
                        Err(RecvError::Lagged(n)) => {
                            warn!(skipped = n, "tunnel pool lagged behind registry events");
                            this.evict_unusable();
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            this.idle.lock().clear();
            debug!("tunnel pool stopped");
        })
    }
}
