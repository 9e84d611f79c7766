use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{bounded, ready_client};
use crate::UserId;
use crate::error::GatewayError;
use crate::session::SessionRegistry;

#[derive(Debug, Deserialize)]
pub struct MuteChannelRequest {
    pub jid: String,
    #[serde(default = "default_mute")]
    pub mute: bool,
}

fn default_mute() -> bool {
    true
}

#[async_trait]
pub trait ChannelOps: Send + Sync {
    async fn follow(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError>;
    async fn unfollow(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError>;
    async fn channel_info(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError>;
    async fn mute(&self, user_id: &UserId, req: MuteChannelRequest) -> Result<Value, GatewayError>;
}

pub struct ChannelService {
    registry: Arc<SessionRegistry>,
    call_timeout: Duration,
}

impl ChannelService {
    pub fn new(registry: Arc<SessionRegistry>, call_timeout: Duration) -> Self {
        Self { registry, call_timeout }
    }

    fn require_jid(jid: &str) -> Result<(), GatewayError> {
        if jid.is_empty() {
            return Err(GatewayError::Validation("jid must not be empty".to_owned()));
        }

        Ok(())
    }
}

#[async_trait]
impl ChannelOps for ChannelService {
    async fn follow(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError> {
        Self::require_jid(jid)?;

        let client = ready_client(&self.registry, user_id)?;
        bounded(self.call_timeout, client.follow_channel(jid, true)).await?;

        Ok(json!({"jid": jid, "following": true}))
    }

    async fn unfollow(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError> {
        Self::require_jid(jid)?;

        let client = ready_client(&self.registry, user_id)?;
        bounded(self.call_timeout, client.follow_channel(jid, false)).await?;

        Ok(json!({"jid": jid, "following": false}))
    }

    async fn channel_info(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError> {
        Self::require_jid(jid)?;

        let client = ready_client(&self.registry, user_id)?;
        let snapshot = bounded(self.call_timeout, client.channel_info(jid)).await?;

        Ok(serde_json::to_value(&snapshot).unwrap_or(Value::Null))
    }

    async fn mute(&self, user_id: &UserId, req: MuteChannelRequest) -> Result<Value, GatewayError> {
        Self::require_jid(&req.jid)?;

        let client = ready_client(&self.registry, user_id)?;
        bounded(self.call_timeout, client.mute_channel(&req.jid, req.mute)).await?;

        Ok(json!({"jid": req.jid, "muted": req.mute}))
    }
}
