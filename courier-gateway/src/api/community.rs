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
        .route("/", post(create_community))
        .route("/{jid}", get(community_info))
        .route("/{jid}/groups", post(link_group).get(linked_groups))
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

pub(super) async fn create_community(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Json(payload): Json<Value>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(state, user_id, CommandKind::CreateCommunity, params.priority, payload).await?;
    Ok(ApiSuccess::created(data))
}

pub(super) async fn community_info(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Path(jid): Path<String>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(
        state,
        user_id,
        CommandKind::CommunityInfo,
        params.priority,
        json!({"jid": jid}),
    )
    .await?;
    Ok(ApiSuccess::ok(data))
}

#[derive(Debug, serde::Deserialize)]
struct LinkBody {
    group: String,
    #[serde(default = "default_link_action")]
    action: String,
}

fn default_link_action() -> String {
    "link".to_owned()
}

pub(super) async fn link_group(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Path(jid): Path<String>,
    Json(body): Json<LinkBody>,
) -> Result<ApiSuccess, HttpError> {
    let command = match body.action.as_str() {
        "link" => CommandKind::LinkGroup,
        "unlink" => CommandKind::UnlinkGroup,
        other => {
            debug!(action = other, "Rejected community link action");
            return Err(HttpError::bad_request().msg("action must be link or unlink"));
        }
    };

    let data = submit(
        state,
        user_id,
        command,
        params.priority,
        json!({"community": jid, "group": body.group}),
    )
    .await?;
    Ok(ApiSuccess::ok(data))
}

pub(super) async fn linked_groups(
    State(state): State<GatewayState>,
    TenantAuth(user_id): TenantAuth,
    Query(params): Query<PriorityParam>,
    Path(jid): Path<String>,
) -> Result<ApiSuccess, HttpError> {
    let data = submit(
        state,
        user_id,
        CommandKind::LinkedGroups,
        params.priority,
        json!({"jid": jid}),
    )
    .await?;
    Ok(ApiSuccess::ok(data))
}
