use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::UserId;

/// Closed taxonomy of classified events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    ConnectionUpdate,
    GroupMembersAdded,
    GroupMembersRemoved,
    GroupMembersPromoted,
    GroupMembersDemoted,
    GroupName,
    GroupTopic,
    GroupAnnounce,
    GroupLocked,
    GroupEphemeral,
    GroupMembershipApproval,
    GroupMemberAddMode,
    GroupDeleted,
    GroupLinkEnabled,
    GroupLinkDisabled,
    GroupInviteLinkChanged,
    Qr,
    Unknown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::ConnectionUpdate => "connection.update",
            EventKind::GroupMembersAdded => "group.members.added",
            EventKind::GroupMembersRemoved => "group.members.removed",
            EventKind::GroupMembersPromoted => "group.members.promoted",
            EventKind::GroupMembersDemoted => "group.members.demoted",
            EventKind::GroupName => "group.name",
            EventKind::GroupTopic => "group.topic",
            EventKind::GroupAnnounce => "group.announce",
            EventKind::GroupLocked => "group.locked",
            EventKind::GroupEphemeral => "group.ephemeral",
            EventKind::GroupMembershipApproval => "group.membership.approval",
            EventKind::GroupMemberAddMode => "group.member.add.mode",
            EventKind::GroupDeleted => "group.deleted",
            EventKind::GroupLinkEnabled => "group.link.enabled",
            EventKind::GroupLinkDisabled => "group.link.disabled",
            EventKind::GroupInviteLinkChanged => "group.invite.link.changed",
            EventKind::Qr => "qr",
            EventKind::Unknown => "unknown",
        }
    }

    /// Routing key on the egress topic exchange.
    pub fn routing_key(self) -> String {
        format!("events.{}", self.as_str())
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw upstream event after taxonomy assignment and enrichment.
#[derive(Debug, Clone)]
pub struct ClassifiedEvent {
    pub user_id: UserId,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
    pub payload: serde_json::Value,
}

impl ClassifiedEvent {
    pub fn new(user_id: UserId, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            user_id,
            kind,
            timestamp: OffsetDateTime::now_utc(),
            payload,
        }
    }

    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            user_id: self.user_id.as_str().to_owned(),
            event_type: self.kind.as_str().to_owned(),
            payload: self.payload.clone(),
            timestamp_ms: i64::try_from(self.timestamp.unix_timestamp_nanos() / 1_000_000).unwrap_or(0),
        }
    }
}

/// Message body published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub user_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case(EventKind::Message, "events.message")]
    #[case(EventKind::ConnectionUpdate, "events.connection.update")]
    #[case(EventKind::GroupMembersAdded, "events.group.members.added")]
    #[case(EventKind::GroupMemberAddMode, "events.group.member.add.mode")]
    #[case(EventKind::GroupInviteLinkChanged, "events.group.invite.link.changed")]
    #[case(EventKind::Qr, "events.qr")]
    #[case(EventKind::Unknown, "events.unknown")]
    fn routing_keys_are_namespaced(#[case] kind: EventKind, #[case] expected: &str) {
        assert_eq!(kind.routing_key(), expected);
    }

    #[test]
    fn envelope_round_trips_as_json() {
        let event = ClassifiedEvent::new(
            UserId::from("alice"),
            EventKind::Qr,
            serde_json::json!({"code": "LOOP-1234"}),
        );

        let body = serde_json::to_vec(&event.envelope()).expect("serialize");
        let decoded: EventEnvelope = serde_json::from_slice(&body).expect("deserialize");

        assert_eq!(decoded.user_id, "alice");
        assert_eq!(decoded.event_type, "qr");
        assert_eq!(decoded.payload["code"], "LOOP-1234");
        assert!(decoded.timestamp_ms > 0);
    }
}
