//! Node endpoints

use super::common::{ApiError, ApiResult, CommandRequest, NodesParams};
use super::AppState;
use crate::registry::{Node, NodeInfo};
use crate::statistic::NodeTrafficInfo;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: NodeInfo,
    pub warm: bool,
    pub connected: bool,
    pub traffic: Option<NodeTrafficInfo>,
}

fn view(state: &AppState, node: &Node, now: Instant) -> NodeView {
    NodeView {
        node: node.info(now),
        warm: state.warm.contains(&node.id),
        connected: state.hub.is_connected(&node.id),
        traffic: state.metrics.node_traffic(&node.id),
    }
}

/// GET /nodes - every registered node with its load
pub async fn get_nodes(
    State(state): State<AppState>,
    Query(params): Query<NodesParams>,
) -> Json<Vec<NodeView>> {
    let now = Instant::now();
    let country = params.country.map(|c| c.to_ascii_uppercase());
    let mut nodes: Vec<NodeView> = state
        .registry
        .snapshot()
        .iter()
        .filter(|n| country.as_deref().map_or(true, |c| n.attrs.country == c))
        .filter(|n| params.status.map_or(true, |s| n.status == s))
        .map(|n| view(&state, n, now))
        .collect();
    nodes.sort_by(|a, b| a.node.id.cmp(&b.node.id));
    Json(nodes)
}

/// GET /nodes/:id
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeView>> {
    let node = state.registry.get(&id).ok_or_else(|| ApiError::not_found("Node"))?;
    Ok(Json(view(&state, &node, Instant::now())))
}

/// POST /nodes/:id/command - drain, resume or disconnect one node
pub async fn post_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> ApiResult<StatusCode> {
    if state.registry.get(&id).is_none() {
        return Err(ApiError::not_found("Node"));
    }
    state
        .hub
        .broadcast_command(&id, req.command)
        .await
        .map_err(|e| ApiError::from_error(&e))?;
    Ok(StatusCode::NO_CONTENT)
}
