use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use serde_json::{Value, json};

use super::{PriorityParam, task_budget};
use crate::dispatch::task::CommandKind;
use crate::extract::TenantAuth;
use crate::http::{ApiSuccess, HttpError};
use crate::service::GatewayState;

pub fn make_router<S>(state: GatewayState) -> Router<S> {
    Router::new()
        .route("/follow", post(follow))
        .route("/unfollow", post(unfollow))
        .route("/{jid}", get(channel_info))
        .route("/{jid}/mute", post(mute))
        .with_state(state)
}

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

pub(super) async fn follow(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    submit(state, user_id, CommandKind::FollowChannel, params.priority, payload).await
}

pub(super) async fn unfollow(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    submit(state, user_id, CommandKind::UnfollowChannel, params.priority, payload).await
}

pub(super) async fn channel_info(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Path(jid): Path<String>,
) -> Result<ApiSuccess, HttpError> {
    submit(
        state,
        user_id,
        CommandKind::ChannelInfo,
        params.priority,
        json!({"jid": jid}),
    )
    .await
}

pub(super) async fn mute(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Path(jid): Path<String>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    let mut payload = if payload.is_object() { payload } else { json!({}) };
    payload["jid"] = Value::String(jid);

    submit(state, user_id, CommandKind::MuteChannel, params.priority, payload).await
}
