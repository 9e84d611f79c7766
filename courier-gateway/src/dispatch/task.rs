use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::UserId;
use crate::error::GatewayError;

/// Scheduler lanes, drained strictly highest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const COUNT: usize = 4;

    /// Lane index, 0 = low.
    pub fn lane(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

/// Closed taxonomy of commands a worker can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    // Session lifecycle
    CreateSession,
    SessionStatus,
    Connect,
    Disconnect,
    Logout,
    Reset,
    DeleteSession,
    // Messaging
    SendText,
    SendMedia,
    SendLocation,
    SendContact,
    React,
    Revoke,
    MarkRead,
    // Groups
    CreateGroup,
    GroupInfo,
    UpdateParticipants,
    UpdateGroupMeta,
    LeaveGroup,
    InviteLink,
    JoinWithLink,
    // Communities
    CreateCommunity,
    CommunityInfo,
    LinkGroup,
    UnlinkGroup,
    LinkedGroups,
    // Channels
    FollowChannel,
    UnfollowChannel,
    ChannelInfo,
    MuteChannel,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::CreateSession => "create_session",
            CommandKind::SessionStatus => "session_status",
            CommandKind::Connect => "connect",
            CommandKind::Disconnect => "disconnect",
            CommandKind::Logout => "logout",
            CommandKind::Reset => "reset",
            CommandKind::DeleteSession => "delete_session",
            CommandKind::SendText => "send_text",
            CommandKind::SendMedia => "send_media",
            CommandKind::SendLocation => "send_location",
            CommandKind::SendContact => "send_contact",
            CommandKind::React => "react",
            CommandKind::Revoke => "revoke",
            CommandKind::MarkRead => "mark_read",
            CommandKind::CreateGroup => "create_group",
            CommandKind::GroupInfo => "group_info",
            CommandKind::UpdateParticipants => "update_participants",
            CommandKind::UpdateGroupMeta => "update_group_meta",
            CommandKind::LeaveGroup => "leave_group",
            CommandKind::InviteLink => "invite_link",
            CommandKind::JoinWithLink => "join_with_link",
            CommandKind::CreateCommunity => "create_community",
            CommandKind::CommunityInfo => "community_info",
            CommandKind::LinkGroup => "link_group",
            CommandKind::UnlinkGroup => "unlink_group",
            CommandKind::LinkedGroups => "linked_groups",
            CommandKind::FollowChannel => "follow_channel",
            CommandKind::UnfollowChannel => "unfollow_channel",
            CommandKind::ChannelInfo => "channel_info",
            CommandKind::MuteChannel => "mute_channel",
        }
    }

    /// Default lane when the caller does not pick one.
    pub fn default_priority(self) -> Priority {
        match self {
            CommandKind::CreateSession
            | CommandKind::Connect
            | CommandKind::Disconnect
            | CommandKind::Logout
            | CommandKind::Reset
            | CommandKind::DeleteSession => Priority::High,
            _ => Priority::Normal,
        }
    }
}

impl core::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work routed to the owning tenant's worker.
///
/// Immutable after scheduling, except for `retries` which the scheduler bumps
/// on queue-full reschedules.
#[derive(Debug, TypedBuilder)]
pub struct Task {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub user_id: UserId,
    pub command: CommandKind,
    #[builder(default = Priority::Normal)]
    pub priority: Priority,
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub response_chan: Option<oneshot::Sender<TaskResponse>>,
    #[builder(default, setter(strip_option))]
    pub deadline: Option<OffsetDateTime>,
    #[builder(default = 0, setter(skip))]
    pub retries: u32,
    #[builder(default = 3)]
    pub max_retries: u32,
    #[builder(default = OffsetDateTime::now_utc(), setter(skip))]
    pub created_at: OffsetDateTime,
}

impl Task {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.id.is_nil() {
            return Err(GatewayError::Validation("task id must not be nil".to_owned()));
        }

        if self.user_id.is_empty() {
            return Err(GatewayError::Validation("user id must not be empty".to_owned()));
        }

        Ok(())
    }

    pub fn deadline_elapsed(&self, now: OffsetDateTime) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Sends the final response. Returns `false` when the consumer already
    /// went away (fire-and-forget tasks count as delivered).
    pub fn respond(&mut self, result: Result<serde_json::Value, GatewayError>, duration: Duration) -> bool {
        let Some(chan) = self.response_chan.take() else {
            return true;
        };

        let response = TaskResponse {
            task_id: self.id,
            result,
            duration,
        };

        if chan.send(response).is_err() {
            debug!(task.id = %self.id, "Response consumer is gone");
            return false;
        }

        true
    }
}

/// Produced by the worker (or the scheduler on short-circuit); consumed
/// exactly once.
#[derive(Debug)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub result: Result<serde_json::Value, GatewayError>,
    pub duration: Duration,
}
