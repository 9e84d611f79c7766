//! Service façades over the protocol client.
//!
//! The worker's dispatch table talks to these trait objects, never to the
//! client directly, so tests can stub each surface independently.

pub mod channel;
pub mod community;
pub mod group;
pub mod lifecycle;
pub mod message;
#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::UserId;
use crate::error::GatewayError;
use crate::session::SessionRegistry;
use crate::upstream::{DynClient, UpstreamError};

pub use channel::{ChannelOps, ChannelService, MuteChannelRequest};
pub use community::{CommunityOps, CommunityService, CreateCommunityRequest, LinkGroupRequest};
pub use group::{
    CreateGroupRequest, GroupOps, GroupService, InviteLinkRequest, JoinWithLinkRequest, UpdateGroupMetaRequest,
    UpdateParticipantsRequest,
};
pub use lifecycle::{LifecycleOps, LifecycleService};
pub use message::{
    MarkReadRequest, MessageOps, MessageService, ReactRequest, RevokeRequest, SendContactRequest, SendLocationRequest,
    SendMediaRequest, SendTextRequest,
};

/// The façades a worker dispatches into.
pub struct ServiceSet {
    pub lifecycle: Arc<dyn LifecycleOps>,
    pub message: Arc<dyn MessageOps>,
    pub group: Arc<dyn GroupOps>,
    pub community: Arc<dyn CommunityOps>,
    pub channel: Arc<dyn ChannelOps>,
}

impl ServiceSet {
    /// Production wiring: every façade drives the given registry's sessions.
    pub fn over_registry(registry: Arc<SessionRegistry>, call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            lifecycle: Arc::new(LifecycleService::new(Arc::clone(&registry))),
            message: Arc::new(MessageService::new(Arc::clone(&registry), call_timeout)),
            group: Arc::new(GroupService::new(Arc::clone(&registry), call_timeout)),
            community: Arc::new(CommunityService::new(Arc::clone(&registry), call_timeout)),
            channel: Arc::new(ChannelService::new(registry, call_timeout)),
        })
    }
}

/// Resolves the tenant's client, refusing unauthenticated or disconnected
/// sessions.
pub(crate) fn ready_client(registry: &SessionRegistry, user_id: &UserId) -> Result<DynClient, GatewayError> {
    let session = registry
        .get(user_id)
        .ok_or_else(|| GatewayError::NotFound(user_id.clone()))?;

    if !session.is_authenticated() {
        return Err(GatewayError::NotAuthenticated(user_id.clone()));
    }

    if !session.is_connected() {
        return Err(GatewayError::NotConnected(user_id.clone()));
    }

    session.touch();

    Ok(session.client())
}

/// Bounds one protocol call; the worker's serialization guarantee means a
/// stuck upstream call would otherwise wedge the whole tenant.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, UpstreamError>>,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(GatewayError::Upstream),
        Err(_elapsed) => Err(GatewayError::Upstream(UpstreamError::Transport(format!(
            "call timed out after {}s",
            timeout.as_secs()
        )))),
    }
}
