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
pub struct CreateCommunityRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkGroupRequest {
    pub community: String,
    pub group: String,
}

#[async_trait]
pub trait CommunityOps: Send + Sync {
    async fn create_community(&self, user_id: &UserId, req: CreateCommunityRequest) -> Result<Value, GatewayError>;
    async fn community_info(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError>;
    async fn link_group(&self, user_id: &UserId, req: LinkGroupRequest, link: bool) -> Result<Value, GatewayError>;
    async fn linked_groups(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError>;
}

pub struct CommunityService {
    registry: Arc<SessionRegistry>,
    call_timeout: Duration,
}

impl CommunityService {
    pub fn new(registry: Arc<SessionRegistry>, call_timeout: Duration) -> Self {
        Self { registry, call_timeout }
    }
}

#[async_trait]
impl CommunityOps for CommunityService {
    async fn create_community(&self, user_id: &UserId, req: CreateCommunityRequest) -> Result<Value, GatewayError> {
        if req.name.is_empty() {
            return Err(GatewayError::Validation("name must not be empty".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;

        let snapshot = bounded(self.call_timeout, client.create_community(&req.name, &req.description)).await?;

        Ok(serde_json::to_value(&snapshot).unwrap_or(Value::Null))
    }

    async fn community_info(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError> {
        if jid.is_empty() {
            return Err(GatewayError::Validation("jid must not be empty".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;
        let snapshot = bounded(self.call_timeout, client.community_info(jid)).await?;

        Ok(serde_json::to_value(&snapshot).unwrap_or(Value::Null))
    }

    async fn link_group(&self, user_id: &UserId, req: LinkGroupRequest, link: bool) -> Result<Value, GatewayError> {
        if req.community.is_empty() || req.group.is_empty() {
            return Err(GatewayError::Validation(
                "community and group must not be empty".to_owned(),
            ));
        }

        let client = ready_client(&self.registry, user_id)?;

        bounded(self.call_timeout, client.link_group(&req.community, &req.group, link)).await?;

        Ok(json!({"community": req.community, "group": req.group, "linked": link}))
    }

    async fn linked_groups(&self, user_id: &UserId, jid: &str) -> Result<Value, GatewayError> {
        if jid.is_empty() {
            return Err(GatewayError::Validation("jid must not be empty".to_owned()));
        }

        let client = ready_client(&self.registry, user_id)?;
        let groups = bounded(self.call_timeout, client.linked_groups(jid)).await?;

        Ok(json!({"community": jid, "groups": groups}))
    }
}
