use axum::Router;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use serde_json::Value;

use super::{PriorityParam, task_budget};
use crate::dispatch::task::CommandKind;
use crate::extract::TenantAuth;
use crate::http::{ApiSuccess, HttpError};
use crate::service::GatewayState;

pub fn make_router<S>(state: GatewayState) -> Router<S> {
    Router::new()
        .route("/", post(create_session).get(get_session).delete(delete_session))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/reset", post(reset))
        .route("/logout", post(logout))
        .route("/pair", get(super::pairing::open_pairing_sse))
        .with_state(state)
}

async fn run_command(
    state: &GatewayState,
    user_id: crate::UserId,
    command: CommandKind,
    priority: Option<crate::dispatch::task::Priority>,
) -> Result<Value, HttpError> {
    let data = state
        .coordinator
        .scheduler()
        .execute(user_id, command, Value::Null, priority, task_budget(state))
        .await?;

    Ok(data)
}

pub(super) async fn create_session(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
) -> Result<ApiSuccess, HttpError> {
    let data = run_command(&state, user_id, CommandKind::CreateSession, params.priority).await?;
    Ok(ApiSuccess::created(data))
}

pub(super) async fn get_session(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
) -> Result<ApiSuccess, HttpError> {
    let data = run_command(&state, user_id, CommandKind::SessionStatus, params.priority).await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn connect(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
) -> Result<ApiSuccess, HttpError> {
    let data = run_command(&state, user_id, CommandKind::Connect, params.priority).await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn disconnect(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
) -> Result<ApiSuccess, HttpError> {
    let data = run_command(&state, user_id, CommandKind::Disconnect, params.priority).await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn reset(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
) -> Result<ApiSuccess, HttpError> {
    let data = run_command(&state, user_id, CommandKind::Reset, params.priority).await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn logout(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
) -> Result<ApiSuccess, HttpError> {
    let data = run_command(&state, user_id, CommandKind::Logout, params.priority).await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn delete_session(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
) -> Result<ApiSuccess, HttpError> {
    let data = run_command(&state, user_id, CommandKind::DeleteSession, params.priority).await?;
    Ok(ApiSuccess::ok(data))
}
