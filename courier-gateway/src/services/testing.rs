//! Scripted façade stubs shared by the dispatch-layer tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{
    ChannelOps, CommunityOps, CreateCommunityRequest, CreateGroupRequest, GroupOps, InviteLinkRequest,
    JoinWithLinkRequest, LifecycleOps, LinkGroupRequest, MarkReadRequest, MessageOps, MuteChannelRequest,
    ReactRequest, RevokeRequest, SendContactRequest, SendLocationRequest, SendMediaRequest, SendTextRequest,
    ServiceSet, UpdateGroupMetaRequest, UpdateParticipantsRequest,
};
use crate::UserId;
use crate::error::GatewayError;

/// Records every dispatched call, optionally slowing message sends down so
/// tests can observe queue behavior.
#[derive(Clone, Default)]
pub(crate) struct ScriptedServices {
    log: Arc<Mutex<Vec<String>>>,
    send_delay: Duration,
    fail_lifecycle: bool,
}

impl ScriptedServices {
    pub(crate) fn with_delay(send_delay: Duration) -> Self {
        Self {
            send_delay,
            ..Self::default()
        }
    }

    pub(crate) fn failing_lifecycle() -> Self {
        Self {
            fail_lifecycle: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.log.lock().push(call.into());
    }
}

pub(crate) fn stubbed_services(script: &ScriptedServices) -> Arc<ServiceSet> {
    let script = script.clone();

    Arc::new(ServiceSet {
        lifecycle: Arc::new(script.clone()),
        message: Arc::new(script.clone()),
        group: Arc::new(script.clone()),
        community: Arc::new(script.clone()),
        channel: Arc::new(script),
    })
}

#[async_trait]
impl LifecycleOps for ScriptedServices {
    async fn create(&self, user_id: &UserId) -> Result<Value, GatewayError> {
        if self.fail_lifecycle {
            return Err(GatewayError::NotFound(user_id.clone()));
        }

        self.record("create_session");
        Ok(json!({"created": true}))
    }

    async fn status(&self, user_id: &UserId) -> Result<Value, GatewayError> {
        if self.fail_lifecycle {
            return Err(GatewayError::NotFound(user_id.clone()));
        }

        self.record("session_status");
        Ok(json!({"connected": false}))
    }

    async fn connect(&self, _user_id: &UserId) -> Result<Value, GatewayError> {
        self.record("connect");
        Ok(json!({"connected": true}))
    }

    async fn disconnect(&self, _user_id: &UserId) -> Result<Value, GatewayError> {
        self.record("disconnect");
        Ok(json!({"disconnected": true}))
    }

    async fn logout(&self, _user_id: &UserId) -> Result<Value, GatewayError> {
        self.record("logout");
        Ok(Value::Null)
    }

    async fn reset(&self, _user_id: &UserId) -> Result<Value, GatewayError> {
        self.record("reset");
        Ok(Value::Null)
    }

    async fn delete(&self, _user_id: &UserId) -> Result<Value, GatewayError> {
        self.record("delete_session");
        Ok(Value::Null)
    }
}

#[async_trait]
impl MessageOps for ScriptedServices {
    async fn send_text(&self, _user_id: &UserId, req: SendTextRequest) -> Result<Value, GatewayError> {
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }

        self.record(format!("send_text:{}", req.message));
        Ok(json!({"message_id": "STUB"}))
    }

    async fn send_media(&self, _user_id: &UserId, _req: SendMediaRequest) -> Result<Value, GatewayError> {
        self.record("send_media");
        Ok(Value::Null)
    }

    async fn send_location(&self, _user_id: &UserId, _req: SendLocationRequest) -> Result<Value, GatewayError> {
        self.record("send_location");
        Ok(Value::Null)
    }

    async fn send_contact(&self, _user_id: &UserId, _req: SendContactRequest) -> Result<Value, GatewayError> {
        self.record("send_contact");
        Ok(Value::Null)
    }

    async fn react(&self, _user_id: &UserId, _req: ReactRequest) -> Result<Value, GatewayError> {
        self.record("react");
        Ok(Value::Null)
    }

    async fn revoke(&self, _user_id: &UserId, _req: RevokeRequest) -> Result<Value, GatewayError> {
        self.record("revoke");
        Ok(Value::Null)
    }

    async fn mark_read(&self, _user_id: &UserId, _req: MarkReadRequest) -> Result<Value, GatewayError> {
        self.record("mark_read");
        Ok(Value::Null)
    }
}

#[async_trait]
impl GroupOps for ScriptedServices {
    async fn create_group(&self, _user_id: &UserId, _req: CreateGroupRequest) -> Result<Value, GatewayError> {
        self.record("create_group");
        Ok(Value::Null)
    }

    async fn group_info(&self, _user_id: &UserId, jid: &str) -> Result<Value, GatewayError> {
        self.record(format!("group_info:{jid}"));
        Ok(Value::Null)
    }

    async fn update_participants(
        &self,
        _user_id: &UserId,
        _req: UpdateParticipantsRequest,
    ) -> Result<Value, GatewayError> {
        self.record("update_participants");
        Ok(Value::Null)
    }

    async fn update_meta(&self, _user_id: &UserId, _req: UpdateGroupMetaRequest) -> Result<Value, GatewayError> {
        self.record("update_group_meta");
        Ok(Value::Null)
    }

    async fn leave_group(&self, _user_id: &UserId, _jid: &str) -> Result<Value, GatewayError> {
        self.record("leave_group");
        Ok(Value::Null)
    }

    async fn invite_link(&self, _user_id: &UserId, _req: InviteLinkRequest) -> Result<Value, GatewayError> {
        self.record("invite_link");
        Ok(Value::Null)
    }

    async fn join_with_link(&self, _user_id: &UserId, _req: JoinWithLinkRequest) -> Result<Value, GatewayError> {
        self.record("join_with_link");
        Ok(Value::Null)
    }
}

#[async_trait]
impl CommunityOps for ScriptedServices {
    async fn create_community(&self, _user_id: &UserId, _req: CreateCommunityRequest) -> Result<Value, GatewayError> {
        self.record("create_community");
        Ok(Value::Null)
    }

    async fn community_info(&self, _user_id: &UserId, _jid: &str) -> Result<Value, GatewayError> {
        self.record("community_info");
        Ok(Value::Null)
    }

    async fn link_group(&self, _user_id: &UserId, _req: LinkGroupRequest, link: bool) -> Result<Value, GatewayError> {
        self.record(if link { "link_group" } else { "unlink_group" });
        Ok(Value::Null)
    }

    async fn linked_groups(&self, _user_id: &UserId, _jid: &str) -> Result<Value, GatewayError> {
        self.record("linked_groups");
        Ok(Value::Null)
    }
}

#[async_trait]
impl ChannelOps for ScriptedServices {
    async fn follow(&self, _user_id: &UserId, _jid: &str) -> Result<Value, GatewayError> {
        self.record("follow_channel");
        Ok(Value::Null)
    }

    async fn unfollow(&self, _user_id: &UserId, _jid: &str) -> Result<Value, GatewayError> {
        self.record("unfollow_channel");
        Ok(Value::Null)
    }

    async fn channel_info(&self, _user_id: &UserId, _jid: &str) -> Result<Value, GatewayError> {
        self.record("channel_info");
        Ok(Value::Null)
    }

    async fn mute(&self, _user_id: &UserId, _req: MuteChannelRequest) -> Result<Value, GatewayError> {
        self.record("mute_channel");
        Ok(Value::Null)
    }
}
