//! Seam to the upstream chat protocol.
//!
//! The gateway never speaks the wire protocol itself: sessions hold a
//! [`ProtocolClient`] obtained from a [`ClientConnector`], and every domain
//! operation goes through these traits. The only built-in driver is the
//! in-process [`loopback`] one; a real driver lives in its own crate and
//! implements the same traits.

pub mod loopback;

use core::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;

pub type DynClient = Arc<dyn ProtocolClient>;
pub type DynConnector = Arc<dyn ClientConnector>;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport is not connected")]
    NotConnected,
    #[error("upstream transport failure: {0}")]
    Transport(String),
    #[error("upstream protocol failure: {0}")]
    Protocol(String),
}

/// Credential-bearing handle issued by the upstream protocol on successful
/// pairing. Shaped like `<account>.<agent>:<device>@<server>`; the gateway
/// treats it as opaque apart from the sanity check in `from_str`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceIdentity {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.contains('@') {
            return Err(UpstreamError::Protocol(format!("malformed device identity: {s:?}")));
        }

        Ok(Self(s.to_owned()))
    }
}

/// Raw events yielded by the protocol client, before classification.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// Post-handshake: the session is authenticated and live.
    Connected,
    Disconnected,
    /// The device was unlinked remotely; the identity is gone for good.
    LoggedOut,
    PairingCode { code: String },
    Message(MessageEvent),
    GroupChange(GroupChangeEvent),
    /// Anything the driver does not model.
    Raw { kind: String, payload: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: String,
    pub chat: String,
    pub sender: String,
    pub timestamp_ms: i64,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Conversation { text: String },
    ExtendedText { text: String },
    Image { caption: Option<String>, mime: String },
    Video { caption: Option<String>, mime: String },
    Audio { mime: String, seconds: Option<u32> },
    Document { file_name: String, caption: Option<String>, mime: String },
    Other { raw_type: String },
}

/// A raw group-info change. The driver populates whichever fields the
/// upstream notification carried; the classifier picks the dominant one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupChangeEvent {
    pub group: String,
    pub participants: Option<ParticipantsChange>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub announce: Option<bool>,
    pub locked: Option<bool>,
    pub ephemeral_secs: Option<u32>,
    pub membership_approval: Option<bool>,
    pub member_add_mode: Option<String>,
    pub deleted: Option<bool>,
    pub link: Option<GroupLinkChange>,
    pub invite_link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantsChange {
    pub action: ParticipantAction,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum GroupLinkChange {
    Enabled { community: String },
    Disabled { community: String },
}

/// Yielded over the channel returned by [`ProtocolClient::begin_pairing`].
#[derive(Debug, Clone)]
pub enum PairingArtifact {
    Code(String),
    Paired,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendReceipt {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub enum OutgoingContent {
    Text { body: String },
    Media {
        kind: MediaKind,
        bytes: bytes::Bytes,
        mime: String,
        caption: Option<String>,
        file_name: Option<String>,
    },
    Location { latitude: f64, longitude: f64, name: Option<String> },
    Contact { display_name: String, vcard: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

#[derive(Debug, Clone, Default)]
pub struct GroupMetaPatch {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub announce: Option<bool>,
    pub locked: Option<bool>,
    pub ephemeral_secs: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub jid: String,
    pub name: String,
    pub topic: Option<String>,
    pub owner: Option<String>,
    pub participants: Vec<GroupParticipant>,
    pub announce: bool,
    pub locked: bool,
    pub is_community: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub jid: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub jid: String,
    pub name: String,
    pub following: bool,
    pub muted: bool,
}

/// One authenticated (or pending) upstream protocol client.
///
/// Implementations must be cheap to share behind an `Arc` and safe to call
/// from multiple tasks; the gateway still funnels all session-mutating calls
/// through the owning worker.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Installs the sink receiving every event this client yields. Replaces
    /// any previously installed sink.
    fn set_event_sink(&self, sink: mpsc::Sender<UpstreamEvent>);

    fn is_transport_connected(&self) -> bool;

    /// Whether this client carries a paired device identity.
    fn is_authenticated(&self) -> bool;

    fn device_identity(&self) -> Option<DeviceIdentity>;

    /// Establishes the transport; resolves once it is ready.
    async fn connect(&self) -> Result<(), UpstreamError>;

    async fn disconnect(&self);

    /// Upstream logout; unlinks the device identity remotely.
    async fn logout(&self) -> Result<(), UpstreamError>;

    /// Starts the scan-to-pair handshake; pairing codes and the terminal
    /// confirmation arrive on the returned channel.
    async fn begin_pairing(&self) -> Result<mpsc::Receiver<PairingArtifact>, UpstreamError>;

    // Messaging

    async fn send_message(&self, to: &str, content: OutgoingContent) -> Result<SendReceipt, UpstreamError>;

    async fn react(&self, chat: &str, message_id: &str, emoji: &str) -> Result<SendReceipt, UpstreamError>;

    async fn revoke(&self, chat: &str, message_id: &str) -> Result<SendReceipt, UpstreamError>;

    async fn mark_read(&self, chat: &str, message_ids: &[String]) -> Result<(), UpstreamError>;

    // Groups

    async fn create_group(&self, name: &str, participants: &[String]) -> Result<GroupSnapshot, UpstreamError>;

    async fn group_info(&self, jid: &str) -> Result<GroupSnapshot, UpstreamError>;

    async fn update_participants(
        &self,
        jid: &str,
        action: ParticipantAction,
        participants: &[String],
    ) -> Result<Vec<String>, UpstreamError>;

    async fn set_group_meta(&self, jid: &str, patch: GroupMetaPatch) -> Result<(), UpstreamError>;

    async fn leave_group(&self, jid: &str) -> Result<(), UpstreamError>;

    async fn invite_link(&self, jid: &str, reset: bool) -> Result<String, UpstreamError>;

    async fn join_with_link(&self, code: &str) -> Result<String, UpstreamError>;

    // Communities

    async fn create_community(&self, name: &str, description: &str) -> Result<GroupSnapshot, UpstreamError>;

    async fn community_info(&self, jid: &str) -> Result<GroupSnapshot, UpstreamError>;

    async fn link_group(&self, community: &str, group: &str, link: bool) -> Result<(), UpstreamError>;

    async fn linked_groups(&self, community: &str) -> Result<Vec<GroupSnapshot>, UpstreamError>;

    // Channels

    async fn follow_channel(&self, jid: &str, follow: bool) -> Result<(), UpstreamError>;

    async fn channel_info(&self, jid: &str) -> Result<ChannelSnapshot, UpstreamError>;

    async fn mute_channel(&self, jid: &str, mute: bool) -> Result<(), UpstreamError>;
}

/// Produces protocol clients, either reattached to a persisted identity or
/// freshly provisioned for pairing.
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn attach(&self, identity: &DeviceIdentity) -> Result<DynClient, UpstreamError>;

    async fn provision(&self) -> Result<DynClient, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_identity_rejects_garbage() {
        assert!("".parse::<DeviceIdentity>().is_err());
        assert!("no-at-sign".parse::<DeviceIdentity>().is_err());
        assert!("123.0:1@s.courier.net".parse::<DeviceIdentity>().is_ok());
    }
}
