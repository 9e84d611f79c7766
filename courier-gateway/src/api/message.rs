use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::routing::post;
use serde_json::Value;

use super::{PriorityParam, task_budget};
use crate::dispatch::task::CommandKind;
use crate::extract::TenantAuth;
use crate::http::{ApiSuccess, HttpError};
use crate::service::GatewayState;

pub fn make_router<S>(state: GatewayState) -> Router<S> {
    Router::new()
        .route("/text", post(send_text))
        .route("/media", post(send_media))
        .route("/location", post(send_location))
        .route("/contact", post(send_contact))
        .route("/react", post(react))
        .route("/revoke", post(revoke))
        .route("/read", post(mark_read))
        .with_state(state)
}

/// All message endpoints share one shape: the JSON body is the task payload,
/// validated by the façade on the worker.
async fn submit(
    state: GatewayState,
    user_id: crate::UserId,
    command: CommandKind,
    priority: Option<crate::dispatch::task::Priority>,
    payload: Value,
) -> Result<ApiSuccess, HttpError> {
    let data = state
        .coordinator
        .scheduler()
        .execute(user_id, command, payload, priority, task_budget(&state))
        .await?;

    Ok(ApiSuccess::ok(data))
}

pub(super) async fn send_text(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    submit(state, user_id, CommandKind::SendText, params.priority, payload).await
}

pub(super) async fn send_media(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    submit(state, user_id, CommandKind::SendMedia, params.priority, payload).await
}

pub(super) async fn send_location(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    submit(state, user_id, CommandKind::SendLocation, params.priority, payload).await
}

pub(super) async fn send_contact(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    submit(state, user_id, CommandKind::SendContact, params.priority, payload).await
}

pub(super) async fn react(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    submit(state, user_id, CommandKind::React, params.priority, payload).await
}

pub(super) async fn revoke(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    submit(state, user_id, CommandKind::Revoke, params.priority, payload).await
}

pub(super) async fn mark_read(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    submit(state, user_id, CommandKind::MarkRead, params.priority, payload).await
}
