use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{bounded, ready_client};
use crate::UserId;
use crate::error::GatewayError;
use crate::session::SessionRegistry;
use crate::upstream::{GroupMetaPatch, GroupSnapshot, ParticipantAction};

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub participants: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateParticipantsRequest {
    pub jid: String,
    pub action: ParticipantAction,
    pub participants: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateGroupMetaRequest {
    pub jid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub announce: Option<bool>,
    #[serde(default)]
    pub locked: Option<bool>,
    #[serde(default)]
    pub ephemeral_secs: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct InviteLinkRequest {
    pub jid: String,
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Deserialize)]
pub struct JoinWithLinkRequest {
    pub code: String,
}

#[async_trait]
pub trait GroupOps: Send + Sync {
    async fn create_group(&self, user_id: &UserId, req: CreateGroupRequest) -> Result<Value, GatewayError>;
    async fn group_info(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError>;
    async fn update_participants(&self, user_id: &UserId, req: UpdateParticipantsRequest)
    -> Result<Value, GatewayError>;
    async fn update_meta(&self, user_id: &UserId, req: UpdateGroupMetaRequest) -> Result<Value, GatewayError>;
    async fn leave_group(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError>;
    async fn invite_link(&self, user_id: &UserId, req: InviteLinkRequest) -> Result<Value, GatewayError>;
    async fn join_with_link(&self, user_id: &UserId, req: JoinWithLinkRequest) -> Result<Value, GatewayError>;
}

pub struct GroupService {
    registry: Arc<SessionRegistry>,
    call_timeout: Duration,
}

impl GroupService {
    pub fn new(registry: Arc<SessionRegistry>, call_timeout: Duration) -> Self {
        Self { registry, call_timeout }
    }
}

fn snapshot_json(snapshot: &GroupSnapshot) -> Value {
    serde_json::to_value(snapshot).unwrap_or(Value::Null)
}

fn require_jid(jid: &str) -> Result<(), GatewayError> {
    if jid.is_empty() {
        return Err(GatewayError::Validation("jid must not be empty".to_owned()));
    }

    Ok(())
}

#[async_trait]
impl GroupOps for GroupService {
    async fn create_group(&self, user_id: &UserId, req: CreateGroupRequest) -> Result<Value, GatewayError> {
        if req.name.is_empty() {
            return Err(GatewayError::Validation("name must not be empty".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;

        let snapshot = bounded(self.call_timeout, client.create_group(&req.name, &req.participants)).await?;

        Ok(snapshot_json(&snapshot))
    }

    async fn group_info(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError> {
        require_jid(jid)?;

        let client = ready_client(&self.registry, user_id)?;
        let snapshot = bounded(self.call_timeout, client.group_info(jid)).await?;

        Ok(snapshot_json(&snapshot))
    }

    async fn update_participants(
        &self,
        user_id: &UserId,
        req: UpdateParticipantsRequest,
    ) -> Result<Value, GatewayError> {
        require_jid(&req.jid)?;

        if req.participants.is_empty() {
            return Err(GatewayError::Validation("participants must not be empty".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;

        let updated = bounded(
            self.call_timeout,
            client.update_participants(&req.jid, req.action, &req.participants),
        )
        .await?;

        Ok(json!({"jid": req.jid, "updated": updated}))
    }

    async fn update_meta(&self, user_id: &UserId, req: UpdateGroupMetaRequest) -> Result<Value, GatewayError> {
        require_jid(&req.jid)?;

        let patch = GroupMetaPatch {
            name: req.name,
            topic: req.topic,
            announce: req.announce,
            locked: req.locked,
            ephemeral_secs: req.ephemeral_secs,
        };

        if patch.name.is_none()
            && patch.topic.is_none()
            && patch.announce.is_none()
            && patch.locked.is_none()
            && patch.ephemeral_secs.is_none()
        {
            return Err(GatewayError::Validation("nothing to update".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;

        bounded(self.call_timeout, client.set_group_meta(&req.jid, patch)).await?;

        Ok(json!({"jid": req.jid, "updated": true}))
    }

    async fn leave_group(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError> {
        require_jid(jid)?;

        let client = ready_client(&self.registry, user_id)?;
        bounded(self.call_timeout, client.leave_group(jid)).await?;

        Ok(json!({"jid": jid, "left": true}))
    }

    async fn invite_link(&self, user_id: &UserId, req: InviteLinkRequest) -> Result<Value, GatewayError> {
        require_jid(&req.jid)?;

        let client = ready_client(&self.registry, user_id)?;
        let link = bounded(self.call_timeout, client.invite_link(&req.jid, req.reset)).await?;

        Ok(json!({"jid": req.jid, "invite_link": link}))
    }

    async fn join_with_link(&self, user_id: &UserId, req: JoinWithLinkRequest) -> Result<Value, GatewayError> {
        if req.code.is_empty() {
            return Err(GatewayError::Validation("code must not be empty".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;
        let jid = bounded(self.call_timeout, client.join_with_link(&req.code)).await?;

        Ok(json!({"jid": jid, "joined": true}))
    }
}
