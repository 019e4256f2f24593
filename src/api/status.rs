//! Gateway-wide status, metrics and sessions

use super::AppState;
use crate::pool::{TunnelPoolStats, WarmStats};
use crate::registry::NodeStatus;
use crate::statistic::{MetricsSnapshot, OutcomeCounts, SessionInfo};
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct FleetStatus {
    pub nodes: usize,
    pub connecting: usize,
    pub active: usize,
    pub draining: usize,
    pub inactive: usize,
    pub connected: usize,
}

#[derive(Debug, Serialize)]
pub struct TrafficStatus {
    pub upload_total: u64,
    pub download_total: u64,
    pub upload_rate: u64,
    pub download_rate: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub fleet: FleetStatus,
    pub warm_pool: WarmStats,
    pub tunnel_pool: TunnelPoolStats,
    pub traffic: TrafficStatus,
    pub outcomes: OutcomeCounts,
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.registry.snapshot();
    let count = |s: NodeStatus| snapshot.iter().filter(|n| n.status == s).count();
    let (upload_total, download_total) = state.metrics.total();
    let (upload_rate, download_rate) = state.metrics.now();

    Json(StatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        fleet: FleetStatus {
            nodes: snapshot.len(),
            connecting: count(NodeStatus::Connecting),
            active: count(NodeStatus::Active),
            draining: count(NodeStatus::Draining),
            inactive: count(NodeStatus::Inactive),
            connected: state.hub.connected_count(),
        },
        warm_pool: state.warm.stats(),
        tunnel_pool: state.tunnels.stats(),
        traffic: TrafficStatus {
            upload_total,
            download_total,
            upload_rate,
            download_rate,
            active_sessions: state.metrics.session_count(),
        },
        outcomes: state.metrics.outcomes(),
    })
}

/// GET /metrics
pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// GET /sessions - sessions currently open
pub async fn get_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.metrics.sessions())
}

#[cfg(test)]
mod tests {
    use super::super::create_router;
    use super::super::tests::{get_json, state};
    use crate::registry::{NodeAttributes, NodeStatus};
    use crate::statistic::Outcome;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_status_counts() {
        let state = state("");
        state.registry.upsert("n1", NodeAttributes::new("US", "", 1), 1);
        state.registry.upsert("n2", NodeAttributes::new("US", "", 1), 2);
        state.registry.set_status("n2", NodeStatus::Draining);
        state.registry.begin_registration("n3", NodeAttributes::new("DE", "", 1), 3);
        state.metrics.add_upload(10);
        state.metrics.record_outcome(Outcome::Success, Some("n1"));
        let router = create_router(state);

        let (status, body) = get_json(router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fleet"]["nodes"], 3);
        assert_eq!(body["fleet"]["connecting"], 1);
        assert_eq!(body["fleet"]["active"], 1);
        assert_eq!(body["fleet"]["draining"], 1);
        assert_eq!(body["tunnel_pool"]["idle"], 0);
        assert_eq!(body["warm_pool"]["size"], 0);
        assert_eq!(body["traffic"]["upload_total"], 10);
        assert_eq!(body["outcomes"]["success"], 1);
    }

    #[tokio::test]
    async fn test_sessions_and_metrics() {
        let state = state("");
        let session = state.metrics.track("http", "127.0.0.1:1".into());
        session.set_target("example.com:443".into());
        let router = create_router(state);

        let (_, body) = get_json(router.clone(), "/sessions").await;
        assert_eq!(body[0]["target"], "example.com:443");
        assert_eq!(body[0]["phase"], "handshaking");

        let (_, body) = get_json(router, "/metrics").await;
        assert_eq!(body["active_sessions"], 1);
    }
}
