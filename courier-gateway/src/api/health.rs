use axum::extract::State;
use serde_json::json;

use crate::http::ApiSuccess;
use crate::service::{GatewayState, SERVICE_NAME};

/// Liveness plus a little identity, no auth required.
pub(super) async fn get_health(State(state): State<GatewayState>) -> ApiSuccess {
    ApiSuccess::ok(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.list().len(),
        "event_broker_connected": state.publisher.is_connected(),
    }))
}
