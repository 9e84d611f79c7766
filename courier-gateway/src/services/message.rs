use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{bounded, ready_client};
use crate::UserId;
use crate::error::GatewayError;
use crate::session::SessionRegistry;
use crate::upstream::{MediaKind, OutgoingContent, SendReceipt};

#[derive(Debug, Deserialize)]
pub struct SendTextRequest {
    pub to: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMediaRequest {
    pub to: String,
    pub media_type: MediaKind,
    /// Base64-encoded media bytes.
    pub data: String,
    pub mime: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendLocationRequest {
    pub to: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendContactRequest {
    pub to: String,
    pub display_name: String,
    pub vcard: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    pub chat: String,
    pub message_id: String,
    /// Empty string removes a previous reaction.
    #[serde(default)]
    pub emoji: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub chat: String,
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub chat: String,
    pub message_ids: Vec<String>,
}

#[async_trait]
pub trait MessageOps: Send + Sync {
    async fn send_text(&self, user_id: &UserId, req: SendTextRequest) -> Result<Value, GatewayError>;
    async fn send_media(&self, user_id: &UserId, req: SendMediaRequest) -> Result<Value, GatewayError>;
    async fn send_location(&self, user_id: &UserId, req: SendLocationRequest) -> Result<Value, GatewayError>;
    async fn send_contact(&self, user_id: &UserId, req: SendContactRequest) -> Result<Value, GatewayError>;
    async fn react(&self, user_id: &UserId, req: ReactRequest) -> Result<Value, GatewayError>;
    async fn revoke(&self, user_id: &UserId, req: RevokeRequest) -> Result<Value, GatewayError>;
    async fn mark_read(&self, user_id: &UserId, req: MarkReadRequest) -> Result<Value, GatewayError>;
}

pub struct MessageService {
    registry: Arc<SessionRegistry>,
    call_timeout: Duration,
}

impl MessageService {
    pub fn new(registry: Arc<SessionRegistry>, call_timeout: Duration) -> Self {
        Self { registry, call_timeout }
    }
}

fn receipt_json(receipt: &SendReceipt) -> Value {
    json!({
        "message_id": receipt.id,
        "timestamp": receipt.timestamp.unix_timestamp(),
    })
}

fn non_empty(value: &str, field: &str) -> Result<(), GatewayError> {
    if value.is_empty() {
        return Err(GatewayError::Validation(format!("{field} must not be empty")));
    }

    Ok(())
}

#[async_trait]
impl MessageOps for MessageService {
    async fn send_text(&self, user_id: &UserId, req: SendTextRequest) -> Result<Value, GatewayError> {
        non_empty(&req.to, "to")?;
        non_empty(&req.message, "message")?;

        let client = ready_client(&self.registry, user_id)?;

        let receipt = bounded(
            self.call_timeout,
            client.send_message(&req.to, OutgoingContent::Text { body: req.message }),
        )
        .await?;

        Ok(receipt_json(&receipt))
    }

    async fn send_media(&self, user_id: &UserId, req: SendMediaRequest) -> Result<Value, GatewayError> {
        non_empty(&req.to, "to")?;
        non_empty(&req.mime, "mime")?;

        let bytes = BASE64
            .decode(req.data.as_bytes())
            .map_err(|e| GatewayError::Validation(format!("data is not valid base64: {e}")))?;

        if bytes.is_empty() {
            return Err(GatewayError::Validation("data must not be empty".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;

        let content = OutgoingContent::Media {
            kind: req.media_type,
            bytes: bytes::Bytes::from(bytes),
            mime: req.mime,
            caption: req.caption,
            file_name: req.file_name,
        };

        let receipt = bounded(self.call_timeout, client.send_message(&req.to, content)).await?;

        Ok(receipt_json(&receipt))
    }

    async fn send_location(&self, user_id: &UserId, req: SendLocationRequest) -> Result<Value, GatewayError> {
        non_empty(&req.to, "to")?;

        if !(-90.0..=90.0).contains(&req.latitude) || !(-180.0..=180.0).contains(&req.longitude) {
            return Err(GatewayError::Validation("coordinates out of range".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;

        let content = OutgoingContent::Location {
            latitude: req.latitude,
            longitude: req.longitude,
            name: req.name,
        };

        let receipt = bounded(self.call_timeout, client.send_message(&req.to, content)).await?;

        Ok(receipt_json(&receipt))
    }

    async fn send_contact(&self, user_id: &UserId, req: SendContactRequest) -> Result<Value, GatewayError> {
        non_empty(&req.to, "to")?;
        non_empty(&req.vcard, "vcard")?;

        let client = ready_client(&self.registry, user_id)?;

        let content = OutgoingContent::Contact {
            display_name: req.display_name,
            vcard: req.vcard,
        };

        let receipt = bounded(self.call_timeout, client.send_message(&req.to, content)).await?;

        Ok(receipt_json(&receipt))
    }

    async fn react(&self, user_id: &UserId, req: ReactRequest) -> Result<Value, GatewayError> {
        non_empty(&req.chat, "chat")?;
        non_empty(&req.message_id, "message_id")?;

        let client = ready_client(&self.registry, user_id)?;

        let receipt = bounded(self.call_timeout, client.react(&req.chat, &req.message_id, &req.emoji)).await?;

        Ok(receipt_json(&receipt))
    }

    async fn revoke(&self, user_id: &UserId, req: RevokeRequest) -> Result<Value, GatewayError> {
        non_empty(&req.chat, "chat")?;
        non_empty(&req.message_id, "message_id")?;

        let client = ready_client(&self.registry, user_id)?;

        let receipt = bounded(self.call_timeout, client.revoke(&req.chat, &req.message_id)).await?;

        Ok(receipt_json(&receipt))
    }

    async fn mark_read(&self, user_id: &UserId, req: MarkReadRequest) -> Result<Value, GatewayError> {
        non_empty(&req.chat, "chat")?;

        if req.message_ids.is_empty() {
            return Err(GatewayError::Validation("message_ids must not be empty".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;

        bounded(self.call_timeout, client.mark_read(&req.chat, &req.message_ids)).await?;

        Ok(json!({"read": req.message_ids.len()}))
    }
}
