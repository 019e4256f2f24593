//! Operational status API
//!
//! Read-mostly JSON view of the fleet and the gateway, plus per-node
//! maintenance commands. Protected by a Bearer secret when one is configured.

mod auth;
mod common;
mod nodes;
mod status;

pub use auth::auth_middleware;
pub use common::{ApiError, ApiResult};

use crate::hub::NodeHub;
use crate::pool::{TunnelPool, WarmPool};
use crate::registry::NodeRegistry;
use crate::statistic::MetricsCollector;
use crate::{Result, VERSION};

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// API secret; empty disables auth
    pub secret: String,
    pub registry: Arc<NodeRegistry>,
    pub hub: Arc<NodeHub>,
    pub warm: Arc<WarmPool>,
    pub tunnels: Arc<TunnelPool>,
    pub metrics: Arc<MetricsCollector>,
    pub started_at: Instant,
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(hello))
        .route("/version", get(version))
        .route("/status", get(status::get_status))
        .route("/metrics", get(status::get_metrics))
        .route("/sessions", get(status::get_sessions))
        .route("/nodes", get(nodes::get_nodes))
        .route("/nodes/:id", get(nodes::get_node))
        .route("/nodes/:id/command", post(nodes::post_command))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the status API on a bound listener until `cancel` fires
pub async fn start_server(state: AppState, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    let router = create_router(state);
    info!("status API listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn hello() -> Json<Value> {
    Json(json!({ "hello": "nodegate" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": VERSION }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{HubConfig, TunnelPoolConfig, WarmPoolConfig};
    use crate::pool::NodeIndex;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    pub(crate) fn state(secret: &str) -> AppState {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(90)));
        let hub = Arc::new(NodeHub::new(registry.clone(), HubConfig::default()));
        let index = Arc::new(NodeIndex::new(registry.clone()));
        let warm = Arc::new(WarmPool::new(
            index.clone(),
            hub.clone(),
            WarmPoolConfig::default(),
        ));
        let tunnels = Arc::new(TunnelPool::new(
            index,
            warm.clone(),
            hub.clone(),
            TunnelPoolConfig::default(),
        ));
        AppState {
            secret: secret.to_string(),
            registry,
            hub,
            warm,
            tunnels,
            metrics: Arc::new(MetricsCollector::new()),
            started_at: Instant::now(),
        }
    }

    pub(crate) async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let resp = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_hello() {
        let response = hello().await;
        assert_eq!(response.0["hello"], "nodegate");
    }

    #[tokio::test]
    async fn test_version() {
        let (status, body) = get_json(create_router(state("")), "/version").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], VERSION);
    }

    #[tokio::test]
    async fn test_secret_required() {
        let router = create_router(state("s3cret"));
        let (status, _) = get_json(router.clone(), "/status").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // public paths stay open
        let (status, _) = get_json(router.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);

        let resp = router
            .oneshot(
                Request::get("/status")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
