//! Traffic and outcome metrics
//!
//! Provides:
//! - Total and per-second traffic
//! - Per-outcome session counters
//! - Per-node traffic and session counts
//! - Active session table for the status API

mod tracker;

pub use tracker::{SessionInfo, SessionObserver, SessionPhase, TrackedSession};

use crate::Error;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Terminal outcome of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
    QuotaRejected,
    AuthRejected,
    NoAvailableNode,
    ProtocolError,
}

impl Outcome {
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::AuthFailure(_) => Outcome::AuthRejected,
            Error::QuotaExceeded(_) => Outcome::QuotaRejected,
            Error::NoAvailableNode(_) => Outcome::NoAvailableNode,
            Error::Protocol(_) => Outcome::ProtocolError,
            _ => Outcome::Error,
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Traffic through one node
#[derive(Debug, Default)]
pub struct NodeTraffic {
    upload: AtomicU64,
    download: AtomicU64,
    sessions: AtomicU64,
    failures: AtomicU64,
}

impl NodeTraffic {
    pub fn add_upload(&self, bytes: u64) {
        self.upload.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download.fetch_add(bytes, Ordering::Relaxed);
    }

    fn info(&self, node_id: &str) -> NodeTrafficInfo {
        NodeTrafficInfo {
            node_id: node_id.to_string(),
            upload: self.upload.load(Ordering::Relaxed),
            download: self.download.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

pub struct MetricsCollector {
    sessions: DashMap<String, Arc<TrackedSession>>,
    nodes: DashMap<String, Arc<NodeTraffic>>,
    upload_total: AtomicU64,
    download_total: AtomicU64,
    /// Bytes in the current second
    upload_temp: AtomicU64,
    download_temp: AtomicU64,
    /// Rate observed over the last full second
    upload_rate: AtomicU64,
    download_rate: AtomicU64,
    outcomes: [AtomicU64; 6],
}

impl MetricsCollector {
    pub fn new() -> Self {
        MetricsCollector {
            sessions: DashMap::new(),
            nodes: DashMap::new(),
            upload_total: AtomicU64::new(0),
            download_total: AtomicU64::new(0),
            upload_temp: AtomicU64::new(0),
            download_temp: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            outcomes: Default::default(),
        }
    }

    /// Roll the per-second counters once a second
    pub fn start_ticker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => this.roll(),
                }
            }
        })
    }

    fn roll(&self) {
        self.upload_rate
            .store(self.upload_temp.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.download_rate
            .store(self.download_temp.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Bytes per second (upload, download)
    pub fn now(&self) -> (u64, u64) {
        (
            self.upload_rate.load(Ordering::Relaxed),
            self.download_rate.load(Ordering::Relaxed),
        )
    }

    pub fn total(&self) -> (u64, u64) {
        (
            self.upload_total.load(Ordering::Relaxed),
            self.download_total.load(Ordering::Relaxed),
        )
    }

    pub fn add_upload(&self, bytes: u64) {
        self.upload_total.fetch_add(bytes, Ordering::Relaxed);
        self.upload_temp.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download_total.fetch_add(bytes, Ordering::Relaxed);
        self.download_temp.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn generate_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Start tracking a session
    pub fn track(&self, frontend: &'static str, client: String) -> Arc<TrackedSession> {
        let session = Arc::new(TrackedSession::new(self.generate_id(), frontend, client));
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<TrackedSession>> {
        self.sessions.get(id).map(|r| r.value().clone())
    }

    /// Stop tracking a session
    pub fn close(&self, id: &str) -> Option<Arc<TrackedSession>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Observer that accounts relay bytes to `session` and `node_id`
    pub fn observer(self: &Arc<Self>, session: &Arc<TrackedSession>, node_id: &str) -> SessionObserver {
        SessionObserver::new(self.clone(), session.clone(), self.node(node_id))
    }

    fn node(&self, node_id: &str) -> Arc<NodeTraffic> {
        self.nodes
            .entry(node_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Count a session's terminal outcome, attributing it to a node if one was used
    pub fn record_outcome(&self, outcome: Outcome, node_id: Option<&str>) {
        self.outcomes[outcome.slot()].fetch_add(1, Ordering::Relaxed);
        if let Some(node_id) = node_id {
            let node = self.node(node_id);
            node.sessions.fetch_add(1, Ordering::Relaxed);
            if outcome != Outcome::Success {
                node.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn outcome_count(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome.slot()].load(Ordering::Relaxed)
    }

    pub fn outcomes(&self) -> OutcomeCounts {
        let c = |o: Outcome| self.outcome_count(o);
        OutcomeCounts {
            success: c(Outcome::Success),
            error: c(Outcome::Error),
            quota_rejected: c(Outcome::QuotaRejected),
            auth_rejected: c(Outcome::AuthRejected),
            no_available_node: c(Outcome::NoAvailableNode),
            protocol_error: c(Outcome::ProtocolError),
        }
    }

    pub fn node_traffic(&self, node_id: &str) -> Option<NodeTrafficInfo> {
        self.nodes.get(node_id).map(|n| n.info(node_id))
    }

    /// Forget a node's counters once it leaves the fleet
    pub fn forget_node(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|r| r.value().to_info()).collect();
        sessions.sort_by(|a, b| a.start.cmp(&b.start));
        sessions
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (upload_total, download_total) = self.total();
        let (upload_rate, download_rate) = self.now();
        let mut nodes: Vec<_> = self.nodes.iter().map(|r| r.value().info(r.key())).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        MetricsSnapshot {
            upload_total,
            download_total,
            upload_rate,
            download_rate,
            active_sessions: self.session_count(),
            outcomes: self.outcomes(),
            nodes,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub success: u64,
    pub error: u64,
    pub quota_rejected: u64,
    pub auth_rejected: u64,
    pub no_available_node: u64,
    pub protocol_error: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeTrafficInfo {
    pub node_id: String,
    pub upload: u64,
    pub download: u64,
    pub sessions: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub upload_total: u64,
    pub download_total: u64,
    pub upload_rate: u64,
    pub download_rate: u64,
    pub active_sessions: usize,
    pub outcomes: OutcomeCounts,
    pub nodes: Vec<NodeTrafficInfo>,
}
