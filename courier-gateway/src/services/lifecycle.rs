use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::UserId;
use crate::error::GatewayError;
use crate::session::SessionRegistry;

/// Session lifecycle surface dispatched by the worker. Everything forwards
/// to the registry so there is exactly one cleanup path per operation.
#[async_trait]
pub trait LifecycleOps: Send + Sync {
    async fn create(&self, user_id: &UserId) -> Result<Value, GatewayError>;
    async fn status(&self, user_id: &UserId) -> Result<Value, GatewayError>;
    async fn connect(&self, user_id: &UserId) -> Result<Value, GatewayError>;
    async fn disconnect(&self, user_id: &UserId) -> Result<Value, GatewayError>;
    async fn logout(&self, user_id: &UserId) -> Result<Value, GatewayError>;
    async fn reset(&self, user_id: &UserId) -> Result<Value, GatewayError>;
    async fn delete(&self, user_id: &UserId) -> Result<Value, GatewayError>;
}

pub struct LifecycleService {
    registry: Arc<SessionRegistry>,
}

impl LifecycleService {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl LifecycleOps for LifecycleService {
    async fn create(&self, user_id: &UserId) -> Result<Value, GatewayError> {
        let session = self.registry.create(user_id).await?;
        Ok(session.status_json())
    }

    async fn status(&self, user_id: &UserId) -> Result<Value, GatewayError> {
        let session = self
            .registry
            .get(user_id)
            .ok_or_else(|| GatewayError::NotFound(user_id.clone()))?;

        Ok(session.status_json())
    }

    async fn connect(&self, user_id: &UserId) -> Result<Value, GatewayError> {
        self.registry.connect(user_id).await?;

        let session = self
            .registry
            .get(user_id)
            .ok_or_else(|| GatewayError::NotFound(user_id.clone()))?;

        Ok(session.status_json())
    }

    async fn disconnect(&self, user_id: &UserId) -> Result<Value, GatewayError> {
        self.registry.disconnect(user_id).await?;
        Ok(json!({"disconnected": true}))
    }

    async fn logout(&self, user_id: &UserId) -> Result<Value, GatewayError> {
        self.registry.logout(user_id).await?;
        Ok(json!({"logged_out": true}))
    }

    async fn reset(&self, user_id: &UserId) -> Result<Value, GatewayError> {
        self.registry.reset(user_id).await?;
        Ok(json!({"reset": true}))
    }

    async fn delete(&self, user_id: &UserId) -> Result<Value, GatewayError> {
        self.registry.delete(user_id).await?;
        Ok(json!({"deleted": true}))
    }
}
