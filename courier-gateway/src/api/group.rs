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
        .route("/", post(create_group))
        .route("/join", post(join_with_link))
        .route("/{jid}", get(group_info).patch(update_meta))
        .route("/{jid}/participants", post(update_participants))
        .route("/{jid}/leave", post(leave_group))
        .route("/{jid}/invite", get(invite_link))
        .with_state(state)
}

async fn submit(
    state: GatewayState,
    user_id: crate::UserId,
    command: CommandKind,
    priority: Option<crate::dispatch::task::Priority>,
    payload: Value,
) -> Result<Value, HttpError> {
    let data = state
        .coordinator
        .scheduler()
        .execute(user_id, command, payload, priority, task_budget(&state))
        .await?;

    Ok(data)
}

/// Merges the path-extracted jid into the body payload.
fn with_jid(mut payload: Value, jid: String) -> Value {
    if !payload.is_object() {
        payload = json!({});
    }

    payload["jid"] = Value::String(jid);
    payload
}

pub(super) async fn create_group(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(state, user_id, CommandKind::CreateGroup, params.priority, payload).await?;
    Ok(ApiSuccess::created(data))
}

pub(super) async fn group_info(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Path(jid): Path<String>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(
        state,
        user_id,
        CommandKind::GroupInfo,
        params.priority,
        json!({"jid": jid}),
    )
    .await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn update_participants(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Path(jid): Path<String>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(
        state,
        user_id,
        CommandKind::UpdateParticipants,
        params.priority,
        with_jid(payload, jid),
    )
    .await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn update_meta(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Path(jid): Path<String>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(
        state,
        user_id,
        CommandKind::UpdateGroupMeta,
        params.priority,
        with_jid(payload, jid),
    )
    .await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn leave_group(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Path(jid): Path<String>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(
        state,
        user_id,
        CommandKind::LeaveGroup,
        params.priority,
        json!({"jid": jid}),
    )
    .await?;
    Ok(ApiSuccess::ok(data))
}

#[derive(Debug, serde::Deserialize)]
pub(super) struct InviteParams {
    #[serde(default)]
    reset: bool,
    #[serde(default)]
    priority: Option<crate::dispatch::task::Priority>,
}

pub(super) async fn invite_link(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<InviteParams>,
    Path(jid): Path<String>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(
        state,
        user_id,
        CommandKind::InviteLink,
        params.priority,
        json!({"jid": jid, "reset": params.reset}),
    )
    .await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn join_with_link(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(state, user_id, CommandKind::JoinWithLink, params.priority, payload).await?;
    Ok(ApiSuccess::ok(data))
}
