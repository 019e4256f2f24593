//! Background-probed subset of active nodes
//!
//! A refresh loop samples the index for a diverse set of nodes, probes them
//! concurrently, and publishes the survivors as an immutable snapshot. Request
//! paths only ever clone the current `Arc`, so they never wait on a refresh.

use super::index::{matches, MatchLevel, NodeIndex};
use super::Criteria;
use crate::config::WarmPoolConfig;
use crate::registry::{Node, NodeRegistry, RegistryEvent};
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Liveness check against one node
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Round-trip latency on success
    async fn probe(&self, node_id: &str) -> Result<Duration>;
}

/// A node that passed its most recent probe
#[derive(Debug, Clone)]
pub struct WarmEntry {
    pub node_id: String,
    pub country: String,
    pub asn: u32,
    pub probed_at: Instant,
    pub latency: Duration,
}

#[derive(Default)]
struct WarmSnapshot {
    entries: Vec<WarmEntry>,
    refreshed_at: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmStats {
    pub size: usize,
    pub target_size: usize,
    pub by_country: BTreeMap<String, usize>,
    pub avg_latency_ms: u64,
    pub last_refresh_secs_ago: Option<u64>,
    pub refreshes: u64,
    pub probes_ok: u64,
    pub probes_failed: u64,
    pub hits: u64,
    pub misses: u64,
}

pub struct WarmPool {
    registry: Arc<NodeRegistry>,
    index: Arc<NodeIndex>,
    prober: Arc<dyn Prober>,
    config: WarmPoolConfig,
    snapshot: RwLock<Arc<WarmSnapshot>>,
    refreshes: AtomicU64,
    probes_ok: AtomicU64,
    probes_failed: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl WarmPool {
    pub fn new(index: Arc<NodeIndex>, prober: Arc<dyn Prober>, config: WarmPoolConfig) -> Self {
        WarmPool {
            registry: index.registry().clone(),
            index,
            prober,
            config,
            snapshot: RwLock::new(Arc::new(WarmSnapshot::default())),
            refreshes: AtomicU64::new(0),
            probes_ok: AtomicU64::new(0),
            probes_failed: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn current(&self) -> Arc<WarmSnapshot> {
        self.snapshot.read().clone()
    }

    /// Copy of the published entries
    pub fn entries(&self) -> Vec<WarmEntry> {
        self.current().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.current().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.current().entries.iter().any(|e| e.node_id == node_id)
    }

    /// Least-loaded warm node matching `criteria` exactly.
    ///
    /// Load comes from the registry at call time, not from the snapshot.
    pub fn pick(&self, criteria: &Criteria, exclude: &HashSet<String>) -> Option<Node> {
        let snapshot = self.current();
        let picked = snapshot
            .entries
            .iter()
            .filter(|e| !exclude.contains(&e.node_id))
            .filter_map(|e| self.registry.get(&e.node_id))
            .filter(|n| n.is_active() && matches(n, criteria, MatchLevel::Exact))
            .min_by(|a, b| a.cmp_preference(b));

        if picked.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        picked
    }

    pub fn stats(&self) -> WarmStats {
        let snapshot = self.current();
        let mut by_country = BTreeMap::new();
        let mut latency_total = Duration::ZERO;
        for e in &snapshot.entries {
            *by_country.entry(e.country.clone()).or_insert(0) += 1;
            latency_total += e.latency;
        }
        let avg_latency_ms = if snapshot.entries.is_empty() {
            0
        } else {
            (latency_total / snapshot.entries.len() as u32).as_millis() as u64
        };

        WarmStats {
            size: snapshot.entries.len(),
            target_size: self.config.target_size,
            by_country,
            avg_latency_ms,
            last_refresh_secs_ago: snapshot.refreshed_at.map(|t| t.elapsed().as_secs()),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            probes_ok: self.probes_ok.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Start the refresh loop and the eviction watcher
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.refresh_interval());
            info!(
                target_size = this.config.target_size,
                interval_secs = this.config.refresh_interval_secs,
                "warm pool started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.refresh().await;
                    }
                    event = events.recv() => match event {
                        Ok(RegistryEvent::Removed { node_id, .. }) => this.evict(&node_id),
                        Ok(RegistryEvent::Registered { .. }) => {}
                        Err(RecvError::Lagged(n)) => {
                            warn!(skipped = n, "warm pool lagged behind registry events");
                            this.evict_inactive();
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("warm pool stopped");
        })
    }

    /// One sample/probe/publish cycle. Returns the published size.
    pub(crate) async fn refresh(&self) -> usize {
        let candidates = self.sample();
        if candidates.is_empty() {
            self.publish(Vec::new());
            return 0;
        }

        let timeout = self.config.probe_timeout();
        let prober = self.prober.clone();
        let results: Vec<(Node, Result<Duration>)> = stream::iter(candidates)
            .map(|node| {
                let prober = prober.clone();
                async move {
                    let res = match tokio::time::timeout(timeout, prober.probe(&node.id)).await {
                        Ok(res) => res,
                        Err(e) => Err(e.into()),
                    };
                    (node, res)
                }
            })
            .buffer_unordered(self.config.probe_concurrency.max(1))
            .collect()
            .await;

        let now = Instant::now();
        let mut survivors = Vec::with_capacity(results.len());
        for (node, res) in results {
            match res {
                Ok(latency) => {
                    self.probes_ok.fetch_add(1, Ordering::Relaxed);
                    survivors.push(WarmEntry {
                        node_id: node.id,
                        country: node.attrs.country,
                        asn: node.attrs.asn,
                        probed_at: now,
                        latency,
                    });
                }
                Err(e) => {
                    self.probes_failed.fetch_add(1, Ordering::Relaxed);
                    trace!(node_id = %node.id, error = %e, "warm probe failed");
                }
            }
        }
        // a node can leave while its probe is in flight
        survivors.retain(|e| self.registry.is_active(&e.node_id));
        survivors.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let size = survivors.len();
        self.publish(survivors);
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(size, target = self.config.target_size, "warm pool refreshed");
        size
    }

    /// Diverse sample of active nodes.
    ///
    /// Nodes are bucketed by (country, ASN) and taken round-robin across
    /// buckets in key order, best-ranked first within each bucket, until the
    /// target size is reached.
    fn sample(&self) -> Vec<Node> {
        let ranked = self.index.ranked(&Criteria::new(), MatchLevel::CountryOnly);
        let mut buckets: BTreeMap<(String, u32), Vec<Node>> = BTreeMap::new();
        for node in ranked {
            buckets
                .entry((node.attrs.country.clone(), node.attrs.asn))
                .or_default()
                .push(node);
        }

        let mut queues: Vec<std::vec::IntoIter<Node>> =
            buckets.into_values().map(|v| v.into_iter()).collect();
        let mut sample = Vec::with_capacity(self.config.target_size);
        while sample.len() < self.config.target_size {
            let before = sample.len();
            for queue in queues.iter_mut() {
                if sample.len() >= self.config.target_size {
                    break;
                }
                if let Some(node) = queue.next() {
                    sample.push(node);
                }
            }
            if sample.len() == before {
                break;
            }
        }
        sample
    }

    fn publish(&self, entries: Vec<WarmEntry>) {
        *self.snapshot.write() = Arc::new(WarmSnapshot {
            entries,
            refreshed_at: Some(Instant::now()),
        });
    }

    fn evict(&self, node_id: &str) {
        let mut guard = self.snapshot.write();
        if guard.entries.iter().any(|e| e.node_id == node_id) {
            let entries = guard
                .entries
                .iter()
                .filter(|e| e.node_id != node_id)
                .cloned()
                .collect();
            *guard = Arc::new(WarmSnapshot {
                entries,
                refreshed_at: guard.refreshed_at,
            });
            trace!(node_id, "evicted from warm pool");
        }
    }

    fn evict_inactive(&self) {
        let current = self.current();
        let entries: Vec<WarmEntry> = current
            .entries
            .iter()
            .filter(|e| self.registry.is_active(&e.node_id))
            .cloned()
            .collect();
        *self.snapshot.write() = Arc::new(WarmSnapshot {
            entries,
            refreshed_at: current.refreshed_at,
        });
    }
}
