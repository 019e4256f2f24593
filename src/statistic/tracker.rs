//! Per-session tracking

use super::{MetricsCollector, NodeTraffic};
use crate::common::net::RelayObserver;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Where a client session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionPhase {
    Handshaking = 0,
    Authenticating = 1,
    Selecting = 2,
    Relaying = 3,
    Closed = 4,
    Failed = 5,
}

impl SessionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionPhase::Handshaking,
            1 => SessionPhase::Authenticating,
            2 => SessionPhase::Selecting,
            3 => SessionPhase::Relaying,
            4 => SessionPhase::Closed,
            _ => SessionPhase::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Closed | SessionPhase::Failed)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Handshaking => "handshaking",
            SessionPhase::Authenticating => "authenticating",
            SessionPhase::Selecting => "selecting",
            SessionPhase::Relaying => "relaying",
            SessionPhase::Closed => "closed",
            SessionPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A client session as seen by the status surface
pub struct TrackedSession {
    pub id: String,
    /// `http` or `socks5`
    pub frontend: &'static str,
    pub client: String,
    pub start: DateTime<Utc>,
    phase: AtomicU8,
    details: Mutex<SessionDetails>,
    upload: AtomicU64,
    download: AtomicU64,
}

#[derive(Debug, Clone, Default)]
struct SessionDetails {
    customer_id: Option<String>,
    target: Option<String>,
    node_id: Option<String>,
}

impl TrackedSession {
    pub fn new(id: String, frontend: &'static str, client: String) -> Self {
        TrackedSession {
            id,
            frontend,
            client,
            start: Utc::now(),
            phase: AtomicU8::new(SessionPhase::Handshaking as u8),
            details: Mutex::new(SessionDetails::default()),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move to `phase`. Terminal phases are sticky.
    pub fn set_phase(&self, phase: SessionPhase) -> bool {
        self.phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if SessionPhase::from_u8(cur).is_terminal() {
                    None
                } else {
                    Some(phase as u8)
                }
            })
            .is_ok()
    }

    pub fn set_customer(&self, customer_id: &str) {
        self.details.lock().customer_id = Some(customer_id.to_string());
    }

    pub fn set_target(&self, target: String) {
        self.details.lock().target = Some(target);
    }

    pub fn set_node(&self, node_id: &str) {
        self.details.lock().node_id = Some(node_id.to_string());
    }

    pub fn customer_id(&self) -> Option<String> {
        self.details.lock().customer_id.clone()
    }

    pub fn node_id(&self) -> Option<String> {
        self.details.lock().node_id.clone()
    }

    pub fn add_upload(&self, bytes: u64) {
        self.upload.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    pub fn to_info(&self) -> SessionInfo {
        let details = self.details.lock().clone();
        SessionInfo {
            id: self.id.clone(),
            frontend: self.frontend,
            client: self.client.clone(),
            customer_id: details.customer_id,
            target: details.target,
            node_id: details.node_id,
            phase: self.phase(),
            upload: self.upload(),
            download: self.download(),
            start: self.start,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub frontend: &'static str,
    pub client: String,
    pub customer_id: Option<String>,
    pub target: Option<String>,
    pub node_id: Option<String>,
    pub phase: SessionPhase,
    pub upload: u64,
    pub download: u64,
    pub start: DateTime<Utc>,
}

/// Feeds relay byte counts into the session, its node and the global totals
pub struct SessionObserver {
    collector: Arc<MetricsCollector>,
    session: Arc<TrackedSession>,
    node: Arc<NodeTraffic>,
}

impl SessionObserver {
    pub(super) fn new(
        collector: Arc<MetricsCollector>,
        session: Arc<TrackedSession>,
        node: Arc<NodeTraffic>,
    ) -> Self {
        SessionObserver {
            collector,
            session,
            node,
        }
    }
}

impl RelayObserver for SessionObserver {
    fn on_upload(&self, bytes: u64) {
        self.session.add_upload(bytes);
        self.node.add_upload(bytes);
        self.collector.add_upload(bytes);
    }

    fn on_download(&self, bytes: u64) {
        self.session.add_download(bytes);
        self.node.add_download(bytes);
        self.collector.add_download(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_session() {
        let s = TrackedSession::new("s1".into(), "http", "127.0.0.1:5000".into());
        assert_eq!(s.phase(), SessionPhase::Handshaking);
        s.set_customer("acme");
        s.set_target("example.com:443".into());
        s.add_upload(100);
        s.add_download(200);

        let info = s.to_info();
        assert_eq!(info.customer_id.as_deref(), Some("acme"));
        assert_eq!(info.target.as_deref(), Some("example.com:443"));
        assert_eq!(info.upload, 100);
        assert_eq!(info.download, 200);
    }

    #[test]
    fn test_terminal_phase_is_final() {
        let s = TrackedSession::new("s1".into(), "socks5", "127.0.0.1:5000".into());
        assert!(s.set_phase(SessionPhase::Authenticating));
        assert!(s.set_phase(SessionPhase::Failed));
        assert!(!s.set_phase(SessionPhase::Relaying));
        assert_eq!(s.phase(), SessionPhase::Failed);
    }

    #[test]
    fn test_phase_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SessionPhase::Selecting).unwrap(),
            "\"selecting\""
        );
    }
}
