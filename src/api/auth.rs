//! Bearer-secret middleware for the status API

use super::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Paths served without a token
const PUBLIC_PATHS: &[&str] = &["/", "/version"];

/// Require `Authorization: Bearer <secret>` unless the secret is empty or the
/// path is public.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.secret.is_empty() {
        return Ok(next.run(req).await);
    }

    let path = req.uri().path();
    if PUBLIC_PATHS.iter().any(|p| *p == path) {
        return Ok(next.run(req).await);
    }

    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = token {
        if constant_time_eq(token.trim().as_bytes(), state.secret.as_bytes()) {
            return Ok(next.run(req).await);
        }
    }

    debug!(path, "status API auth failed");
    Err(StatusCode::UNAUTHORIZED)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
