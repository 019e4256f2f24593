//! Sticky session bindings

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Binding {
    node_id: String,
    expires_at: Instant,
}

/// Token -> node affinity with a bounded validity window
pub struct StickySessions {
    bindings: DashMap<String, Binding>,
    ttl: Duration,
}

impl StickySessions {
    pub fn new(ttl: Duration) -> Self {
        StickySessions {
            bindings: DashMap::new(),
            ttl,
        }
    }

    /// Node currently bound to `token`. Expired bindings are dropped.
    pub fn resolve(&self, token: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(binding) = self.bindings.get(token) {
            if binding.expires_at > now {
                return Some(binding.node_id.clone());
            }
        }
        self.bindings.remove_if(token, |_, b| b.expires_at <= now);
        None
    }

    /// Bind (or rebind) `token` to `node_id` for another full window
    pub fn bind(&self, token: &str, node_id: &str) {
        let previous = self.bindings.insert(
            token.to_string(),
            Binding {
                node_id: node_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        if let Some(prev) = previous {
            if prev.node_id != node_id {
                debug!(token, from = %prev.node_id, to = %node_id, "sticky session reassigned");
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.bindings.len();
        self.bindings.retain(|_, b| b.expires_at > now);
        before.saturating_sub(self.bindings.len())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn spawn_purger(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let n = this.purge_expired();
                        if n > 0 {
                            debug!(purged = n, "expired sticky sessions");
                        }
                    }
                }
            }
        })
    }
}
