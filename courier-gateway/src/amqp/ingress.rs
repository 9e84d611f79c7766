//! Handlers for the ingress queues: each decodes a command payload and
//! submits it to the scheduler as a regular task.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::consumer::{IngressError, IngressHandler};
use crate::UserId;
use crate::dispatch::scheduler::SchedulerHandle;
use crate::dispatch::task::CommandKind;
use crate::error::GatewayError;

/// Best-effort tenant extraction from an arbitrary payload, for error
/// events about deliveries that failed to decode properly.
fn best_effort_user(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;

    ["sessionId", "session_id", "userId", "user_id"]
        .iter()
        .find_map(|key| value.get(key).and_then(|v| v.as_str()).map(str::to_owned))
}

fn decode<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, IngressError> {
    serde_json::from_slice(body).map_err(|e| IngressError::NonRetryable {
        reason: format!("invalid payload: {e}"),
        user_id: best_effort_user(body),
    })
}

/// Handler failures fall into two buckets: caller mistakes are poison
/// (acked + error event), infrastructure trouble is retryable.
fn task_error(error: GatewayError, user_id: &str) -> IngressError {
    match error {
        GatewayError::Validation(_) | GatewayError::DeadlineExceeded => IngressError::NonRetryable {
            reason: error.to_string(),
            user_id: Some(user_id.to_owned()),
        },
        other => IngressError::Retryable(anyhow::Error::new(other)),
    }
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    #[serde(alias = "sessionId", alias = "session_id", alias = "userId")]
    user_id: String,
    to: String,
    message: String,
}

pub struct SendMessageHandler {
    scheduler: SchedulerHandle,
    budget: Duration,
}

impl SendMessageHandler {
    pub fn new(scheduler: SchedulerHandle, budget: Duration) -> Self {
        Self { scheduler, budget }
    }
}

#[async_trait]
impl IngressHandler for SendMessageHandler {
    fn name(&self) -> &'static str {
        "send-message"
    }

    async fn handle(&self, _routing_key: &str, body: &[u8]) -> Result<(), IngressError> {
        let payload: SendMessagePayload = decode(body)?;

        if payload.user_id.is_empty() {
            return Err(IngressError::NonRetryable {
                reason: "user id must not be empty".to_owned(),
                user_id: None,
            });
        }

        self.scheduler
            .execute(
                UserId::from(payload.user_id.as_str()),
                CommandKind::SendText,
                json!({"to": payload.to, "message": payload.message}),
                None,
                self.budget,
            )
            .await
            .map(|_| ())
            .map_err(|e| task_error(e, &payload.user_id))
    }
}

#[derive(Debug, Deserialize)]
struct SendMediaPayload {
    #[serde(alias = "sessionId", alias = "session_id", alias = "userId")]
    user_id: String,
    to: String,
    media_type: String,
    data: String,
    mime: String,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
}

pub struct SendMediaHandler {
    scheduler: SchedulerHandle,
    budget: Duration,
}

impl SendMediaHandler {
    pub fn new(scheduler: SchedulerHandle, budget: Duration) -> Self {
        Self { scheduler, budget }
    }
}

#[async_trait]
impl IngressHandler for SendMediaHandler {
    fn name(&self) -> &'static str {
        "send-media"
    }

    async fn handle(&self, _routing_key: &str, body: &[u8]) -> Result<(), IngressError> {
        let payload: SendMediaPayload = decode(body)?;

        self.scheduler
            .execute(
                UserId::from(payload.user_id.as_str()),
                CommandKind::SendMedia,
                json!({
                    "to": payload.to,
                    "media_type": payload.media_type,
                    "data": payload.data,
                    "mime": payload.mime,
                    "caption": payload.caption,
                    "file_name": payload.file_name,
                }),
                None,
                self.budget,
            )
            .await
            .map(|_| ())
            .map_err(|e| task_error(e, &payload.user_id))
    }
}

#[derive(Debug, Deserialize)]
struct MarkReadPayload {
    #[serde(alias = "sessionId", alias = "session_id", alias = "userId")]
    user_id: String,
    chat: String,
    message_ids: Vec<String>,
}

pub struct MarkReadHandler {
    scheduler: SchedulerHandle,
    budget: Duration,
}

impl MarkReadHandler {
    pub fn new(scheduler: SchedulerHandle, budget: Duration) -> Self {
        Self { scheduler, budget }
    }
}

#[async_trait]
impl IngressHandler for MarkReadHandler {
    fn name(&self) -> &'static str {
        "mark-read"
    }

    async fn handle(&self, _routing_key: &str, body: &[u8]) -> Result<(), IngressError> {
        let payload: MarkReadPayload = decode(body)?;

        self.scheduler
            .execute(
                UserId::from(payload.user_id.as_str()),
                CommandKind::MarkRead,
                json!({"chat": payload.chat, "message_ids": payload.message_ids}),
                None,
                self.budget,
            )
            .await
            .map(|_| ())
            .map_err(|e| task_error(e, &payload.user_id))
    }
}
