pub mod admin;
pub mod channel;
pub mod community;
pub mod group;
pub mod health;
pub mod message;
pub mod pairing;
pub mod session;

use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::task::Priority;
use crate::service::GatewayState;

pub fn make_router<S>(state: GatewayState) -> axum::Router<S> {
    axum::Router::new()
        .route("/health", axum::routing::get(health::get_health))
        .nest("/session", session::make_router(state.clone()))
        .nest("/message", message::make_router(state.clone()))
        .nest("/group", group::make_router(state.clone()))
        .nest("/community", community::make_router(state.clone()))
        .nest("/channel", channel::make_router(state.clone()))
        .nest("/admin", admin::make_router(state.clone()))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Optional `?priority=<lane>` override accepted by command endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct PriorityParam {
    #[serde(default)]
    pub(crate) priority: Option<Priority>,
}

/// Budget for one HTTP-originated task; also becomes its deadline.
pub(crate) fn task_budget(state: &GatewayState) -> Duration {
    state.conf.worker.task_timeout
}
