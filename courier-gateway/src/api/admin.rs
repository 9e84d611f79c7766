use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

use crate::UserId;
use crate::extract::AdminAuth;
use crate::http::{ApiSuccess, HttpError};
use crate::service::GatewayState;

pub fn make_router<S>(state: GatewayState) -> Router<S> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/metrics", get(metrics))
        .route("/token", post(issue_token))
        .with_state(state)
}

pub(super) async fn list_sessions(
    State(state): State<GatewayState>,
    _admin: AdminAuth,
) -> Result<ApiSuccess, HttpError> {
    let sessions: Vec<_> = state.registry.list().iter().map(|s| s.status_json()).collect();

    let bindings = state
        .registry
        .store()
        .list_mappings()
        .await
        .map_err(crate::error::GatewayError::Store)?;

    Ok(ApiSuccess::ok(json!({
        "sessions": sessions,
        "bindings": bindings,
    })))
}

pub(super) async fn metrics(State(state): State<GatewayState>, _admin: AdminAuth) -> Result<ApiSuccess, HttpError> {
    let pool = state.coordinator.pool();

    let workers: serde_json::Map<String, serde_json::Value> = pool
        .worker_metrics()
        .into_iter()
        .map(|(user_id, metrics)| {
            (
                user_id.to_string(),
                serde_json::to_value(metrics).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();

    Ok(ApiSuccess::ok(json!({
        "pool": pool.metrics(),
        "workers": workers,
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct IssueTokenRequest {
    user_id: String,
    #[serde(default = "default_ttl_secs")]
    ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

/// Mints a tenant auth token; handed to callers that cannot hold the API
/// key.
pub(super) async fn issue_token(
    State(state): State<GatewayState>,
    _admin: AdminAuth,
    Json(request): Json<IssueTokenRequest>,
) -> Result<ApiSuccess, HttpError> {
    if request.user_id.is_empty() {
        return Err(HttpError::bad_request().msg("user_id must not be empty"));
    }

    let token = state.auth.issue_token(
        &UserId::from(request.user_id.as_str()),
        Duration::from_secs(request.ttl_secs),
    );

    Ok(ApiSuccess::ok(json!({
        "user_id": request.user_id,
        "token": token,
        "ttl_secs": request.ttl_secs,
    })))
}
