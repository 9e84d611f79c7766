use axum::http::StatusCode;

use crate::UserId;
use crate::upstream::UpstreamError;

/// Stable failure kinds surfaced across the control plane, the scheduler and
/// the event plane.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no session for user {0}")]
    NotFound(UserId),
    #[error("user {0} is not authenticated")]
    NotAuthenticated(UserId),
    #[error("user {0} is not connected")]
    NotConnected(UserId),
    #[error("a pairing is already in progress for user {0}")]
    PairingInProgress(UserId),
    #[error("user {0} is already paired and connected")]
    PairingConflict(UserId),
    #[error("timed out waiting for the upstream transport")]
    ConnectionTimeout,
    #[error("deadline exceeded before the task could be dispatched")]
    DeadlineExceeded,
    #[error("retry budget exhausted: {0}")]
    MaxRetriesExceeded(String),
    #[error("worker task queue is full")]
    QueueFull,
    #[error("worker pool is at capacity")]
    PoolFull,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] device_store::StoreError),
    #[error("validation failure: {0}")]
    Validation(String),
}

impl GatewayError {
    /// Machine-readable code mirrored into the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::NotAuthenticated(_) => "NotAuthenticated",
            GatewayError::NotConnected(_) => "NotConnected",
            GatewayError::PairingInProgress(_) => "PairingInProgress",
            GatewayError::PairingConflict(_) => "PairingConflict",
            GatewayError::ConnectionTimeout => "ConnectionTimeout",
            GatewayError::DeadlineExceeded => "DeadlineExceeded",
            GatewayError::MaxRetriesExceeded(_) => "MaxRetriesExceeded",
            GatewayError::QueueFull => "QueueFull",
            GatewayError::PoolFull => "PoolFull",
            GatewayError::Upstream(_) => "UpstreamFailure",
            GatewayError::Store(_) => "StoreFailure",
            GatewayError::Validation(_) => "ValidationFailure",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::PairingInProgress(_) | GatewayError::PairingConflict(_) => StatusCode::CONFLICT,
            GatewayError::Validation(_) | GatewayError::DeadlineExceeded => StatusCode::BAD_REQUEST,
            GatewayError::NotAuthenticated(_) | GatewayError::NotConnected(_) => StatusCode::CONFLICT,
            GatewayError::QueueFull | GatewayError::PoolFull => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ConnectionTimeout
            | GatewayError::MaxRetriesExceeded(_)
            | GatewayError::Upstream(_)
            | GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::NotFound(UserId::from("u")).code(), "NotFound");
        assert_eq!(GatewayError::QueueFull.code(), "QueueFull");
        assert_eq!(
            GatewayError::MaxRetriesExceeded("queue full".to_owned()).code(),
            "MaxRetriesExceeded"
        );
    }

    #[test]
    fn status_mapping_matches_the_control_plane_contract() {
        assert_eq!(GatewayError::NotFound(UserId::from("u")).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::PairingInProgress(UserId::from("u")).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            GatewayError::Validation("missing field".to_owned()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
