//! Authoritative store of connected exit nodes
//!
//! Every lifecycle change goes through [`NodeRegistry`]. Readers take
//! point-in-time copies with [`NodeRegistry::snapshot`] and never hold the lock
//! across an await point.

mod node;

pub use node::{Node, NodeAttributes, NodeInfo, NodeStatus, Protocol};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 1024;

/// Why a node left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Control connection closed or failed
    Disconnected,
    /// No heartbeat within the inactive timeout
    Timeout,
}

/// Lifecycle notifications for derived components
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered { node_id: String },
    Removed { node_id: String, reason: RemovalReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

struct NodeEntry {
    attrs: NodeAttributes,
    status: NodeStatus,
    /// Control connection that owns this entry
    conn_id: u64,
    /// Shared with outstanding leases, survives re-registration
    sessions: Arc<AtomicU32>,
    last_heartbeat: Instant,
    connected_at: Instant,
    connected_at_utc: DateTime<Utc>,
}

/// Node registry
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeEntry>>,
    inactive_timeout: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl NodeRegistry {
    pub fn new(inactive_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        NodeRegistry {
            nodes: RwLock::new(HashMap::new()),
            inactive_timeout,
            events,
        }
    }

    pub fn inactive_timeout(&self) -> Duration {
        self.inactive_timeout
    }

    /// Receive lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Insert or replace a node. Idempotent on node ID.
    ///
    /// Re-registration replaces attributes and marks the node active again but
    /// keeps its session counter, so leases held by running sessions stay valid.
    pub fn upsert(&self, id: &str, attrs: NodeAttributes, conn_id: u64) -> UpsertOutcome {
        let outcome = self.store(id, attrs, conn_id, NodeStatus::Active);
        let _ = self.events.send(RegistryEvent::Registered {
            node_id: id.to_string(),
        });
        outcome
    }

    /// Record a registration that is not acknowledged yet.
    ///
    /// The node stays `Connecting`, and so unselectable, until [`confirm`]
    /// runs for the same connection.
    ///
    /// [`confirm`]: NodeRegistry::confirm
    pub fn begin_registration(
        &self,
        id: &str,
        attrs: NodeAttributes,
        conn_id: u64,
    ) -> UpsertOutcome {
        self.store(id, attrs, conn_id, NodeStatus::Connecting)
    }

    /// Promote a `Connecting` node owned by `conn_id` to `Active`
    pub fn confirm(&self, id: &str, conn_id: u64) -> bool {
        let confirmed = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(id) {
                Some(entry)
                    if entry.conn_id == conn_id && entry.status == NodeStatus::Connecting =>
                {
                    entry.status = NodeStatus::Active;
                    true
                }
                _ => false,
            }
        };
        if confirmed {
            let _ = self.events.send(RegistryEvent::Registered {
                node_id: id.to_string(),
            });
        }
        confirmed
    }

    fn store(
        &self,
        id: &str,
        attrs: NodeAttributes,
        conn_id: u64,
        status: NodeStatus,
    ) -> UpsertOutcome {
        let attrs = attrs.normalized();
        let now = Instant::now();
        let outcome = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(id) {
                Some(entry) => {
                    entry.attrs = attrs;
                    entry.status = status;
                    entry.last_heartbeat = now;
                    if entry.conn_id != conn_id {
                        entry.conn_id = conn_id;
                        entry.connected_at = now;
                        entry.connected_at_utc = Utc::now();
                    }
                    UpsertOutcome::Updated
                }
                None => {
                    nodes.insert(
                        id.to_string(),
                        NodeEntry {
                            attrs,
                            status,
                            conn_id,
                            sessions: Arc::new(AtomicU32::new(0)),
                            last_heartbeat: now,
                            connected_at: now,
                            connected_at_utc: Utc::now(),
                        },
                    );
                    UpsertOutcome::Inserted
                }
            }
        };

        debug!(node_id = %id, conn_id, %status, ?outcome, "node registered");
        outcome
    }

    /// Refresh a node's heartbeat. Returns false for unknown nodes.
    pub fn mark_heartbeat(&self, id: &str) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(id) {
            Some(entry) => {
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a node regardless of which connection owns it
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.nodes.write().remove(id).is_some();
        if removed {
            self.emit_removed(id, RemovalReason::Disconnected);
        }
        removed
    }

    /// Remove a node only if `conn_id` still owns it.
    ///
    /// A stale connection closing after the node re-registered elsewhere must
    /// not evict the newer registration.
    pub fn remove_connection(&self, id: &str, conn_id: u64) -> bool {
        let removed = {
            let mut nodes = self.nodes.write();
            match nodes.get(id) {
                Some(entry) if entry.conn_id == conn_id => nodes.remove(id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.emit_removed(id, RemovalReason::Disconnected);
        }
        removed
    }

    /// Switch a node between `Active` and `Draining`
    pub fn set_status(&self, id: &str, status: NodeStatus) -> bool {
        if !matches!(status, NodeStatus::Active | NodeStatus::Draining) {
            return false;
        }
        let mut nodes = self.nodes.write();
        match nodes.get_mut(id) {
            Some(entry) => {
                entry.status = status;
                info!(node_id = %id, %status, "node status changed");
                true
            }
            None => false,
        }
    }

    /// Copy of one node
    pub fn get(&self, id: &str) -> Option<Node> {
        let now = Instant::now();
        let nodes = self.nodes.read();
        nodes.get(id).map(|e| self.to_node(id, e, now))
    }

    /// Whether `id` is present and selectable right now
    pub fn is_active(&self, id: &str) -> bool {
        self.get(id).map(|n| n.is_active()).unwrap_or(false)
    }

    /// Point-in-time copy of every node.
    ///
    /// Entries whose heartbeat is older than the inactive timeout are reported
    /// `Inactive` even before the sweep evicts them.
    pub fn snapshot(&self) -> Vec<Node> {
        let now = Instant::now();
        let nodes = self.nodes.read();
        nodes
            .iter()
            .map(|(id, e)| self.to_node(id, e, now))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Count a session against a node. The count drops with the lease.
    pub fn acquire_session(&self, id: &str) -> Option<SessionLease> {
        let nodes = self.nodes.read();
        nodes.get(id).map(|e| {
            e.sessions.fetch_add(1, Ordering::AcqRel);
            SessionLease {
                node_id: id.to_string(),
                counter: e.sessions.clone(),
            }
        })
    }

    /// Evict nodes whose heartbeat age is at least `timeout`
    pub fn sweep_inactive(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let removed: Vec<String> = {
            let mut nodes = self.nodes.write();
            let expired: Vec<String> = nodes
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_heartbeat) >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                nodes.remove(id);
            }
            expired
        };

        for id in &removed {
            info!(node_id = %id, "node evicted after heartbeat timeout");
            self.emit_removed(id, RemovalReason::Timeout);
        }
        removed
    }

    /// Run [`sweep_inactive`](Self::sweep_inactive) every `interval` until cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = this.sweep_inactive(this.inactive_timeout);
                        if !removed.is_empty() {
                            debug!(count = removed.len(), remaining = this.len(), "registry sweep");
                        }
                    }
                }
            }
        })
    }

    fn to_node(&self, id: &str, e: &NodeEntry, now: Instant) -> Node {
        let stale = now.saturating_duration_since(e.last_heartbeat) >= self.inactive_timeout;
        Node {
            id: id.to_string(),
            attrs: e.attrs.clone(),
            status: if stale { NodeStatus::Inactive } else { e.status },
            sessions: e.sessions.load(Ordering::Acquire),
            last_heartbeat: e.last_heartbeat,
            connected_at: e.connected_at,
            connected_at_utc: e.connected_at_utc,
        }
    }

    fn emit_removed(&self, id: &str, reason: RemovalReason) {
        let _ = self.events.send(RegistryEvent::Removed {
            node_id: id.to_string(),
            reason,
        });
    }
}

/// One session counted against a node
pub struct SessionLease {
    node_id: String,
    counter: Arc<AtomicU32>,
}

impl SessionLease {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("node_id", &self.node_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn us() -> NodeAttributes {
        NodeAttributes::new("us", "Austin", 7018).with_capacity(10)
    }

    #[tokio::test]
    async fn test_upsert_and_snapshot() {
        let registry = NodeRegistry::new(Duration::from_secs(90));
        assert_eq!(registry.upsert("n1", us(), 1), UpsertOutcome::Inserted);

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].attrs.country, "US");
        assert!(snap[0].is_active());
    }

    #[tokio::test]
    async fn test_reregister_keeps_session_count() {
        let registry = NodeRegistry::new(Duration::from_secs(90));
        registry.upsert("n1", us(), 1);
        let lease_a = registry.acquire_session("n1").unwrap();
        let _lease_b = registry.acquire_session("n1").unwrap();
        assert_eq!(registry.get("n1").unwrap().sessions, 2);

        let changed = NodeAttributes::new("US", "Dallas", 7018).with_capacity(20);
        assert_eq!(registry.upsert("n1", changed, 1), UpsertOutcome::Updated);

        let node = registry.get("n1").unwrap();
        assert_eq!(node.attrs.city, "Dallas");
        assert_eq!(node.attrs.capacity, 20);
        assert_eq!(node.sessions, 2);

        drop(lease_a);
        assert_eq!(registry.get("n1").unwrap().sessions, 1);
    }

    #[tokio::test]
    async fn test_remove_connection_ignores_stale_owner() {
        let registry = NodeRegistry::new(Duration::from_secs(90));
        registry.upsert("n1", us(), 1);
        registry.upsert("n1", us(), 2);

        assert!(!registry.remove_connection("n1", 1));
        assert!(registry.get("n1").is_some());
        assert!(registry.remove_connection("n1", 2));
        assert!(registry.get("n1").is_none());
    }

    #[tokio::test]
    async fn test_removed_node_absent_from_next_snapshot() {
        let registry = NodeRegistry::new(Duration::from_secs(90));
        registry.upsert("n1", us(), 1);
        registry.upsert("n2", us(), 2);
        registry.remove("n1");
        let ids: Vec<_> = registry.snapshot().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["n2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_silent_nodes() {
        let registry = NodeRegistry::new(Duration::from_secs(90));
        registry.upsert("quiet", us(), 1);
        registry.upsert("chatty", us(), 2);

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(30)).await;
            assert!(registry.mark_heartbeat("chatty"));
        }
        // quiet is exactly 90s old
        let removed = registry.sweep_inactive(Duration::from_secs(90));
        assert_eq!(removed, vec!["quiet".to_string()]);
        assert!(registry.get("quiet").is_none());
        assert!(registry.is_active("chatty"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_node_reported_inactive_before_sweep() {
        let registry = NodeRegistry::new(Duration::from_secs(90));
        registry.upsert("n1", us(), 1);
        tokio::time::advance(Duration::from_secs(91)).await;
        let node = registry.get("n1").unwrap();
        assert_eq!(node.status, NodeStatus::Inactive);
        assert!(!registry.is_active("n1"));
    }

    #[tokio::test]
    async fn test_registration_confirmed_by_owner() {
        let registry = NodeRegistry::new(Duration::from_secs(90));
        let mut rx = registry.subscribe();
        registry.begin_registration("n1", us(), 7);
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Connecting);
        assert!(!registry.is_active("n1"));
        assert!(rx.try_recv().is_err());

        assert!(!registry.confirm("n1", 6));
        assert!(registry.confirm("n1", 7));
        assert!(registry.is_active("n1"));
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::Registered {
                node_id: "n1".into()
            }
        );
        // already active
        assert!(!registry.confirm("n1", 7));
    }

    #[tokio::test]
    async fn test_drain_and_resume() {
        let registry = NodeRegistry::new(Duration::from_secs(90));
        registry.upsert("n1", us(), 1);
        assert!(registry.set_status("n1", NodeStatus::Draining));
        assert!(!registry.is_active("n1"));
        assert!(registry.mark_heartbeat("n1"));
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Draining);
        assert!(registry.set_status("n1", NodeStatus::Active));
        assert!(registry.is_active("n1"));
        assert!(!registry.set_status("n1", NodeStatus::Inactive));
    }

    #[tokio::test]
    async fn test_events() {
        let registry = NodeRegistry::new(Duration::from_secs(90));
        let mut rx = registry.subscribe();
        registry.upsert("n1", us(), 1);
        registry.remove("n1");

        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::Registered {
                node_id: "n1".into()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::Removed {
                node_id: "n1".into(),
                reason: RemovalReason::Disconnected
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_upserts() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(90)));
        let mut handles = Vec::new();
        for i in 0..32u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.upsert(&format!("n{}", i % 8), us(), i);
                registry.mark_heartbeat(&format!("n{}", i % 8));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.len(), 8);
    }
}
