//! In-process protocol driver.
//!
//! Behaves like a well-behaved upstream: pairing yields codes and completes
//! on "scan" (immediately when `auto_pair` is on, or when a test calls
//! [`LoopbackClient::complete_pairing`]), domain calls succeed against
//! in-memory state, and lifecycle transitions surface as events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    ChannelSnapshot, ClientConnector, DeviceIdentity, DynClient, GroupMetaPatch, GroupParticipant, GroupSnapshot,
    OutgoingContent, PairingArtifact, ParticipantAction, ProtocolClient, SendReceipt, UpstreamError, UpstreamEvent,
};

pub struct LoopbackConnector {
    auto_pair: bool,
    clients: Mutex<Vec<Arc<LoopbackClient>>>,
}

impl LoopbackConnector {
    pub fn new(auto_pair: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_pair,
            clients: Mutex::new(Vec::new()),
        })
    }

    /// Every client handed out so far, newest last. Test hook.
    pub fn clients(&self) -> Vec<Arc<LoopbackClient>> {
        self.clients.lock().clone()
    }

    fn register(&self, client: Arc<LoopbackClient>) -> DynClient {
        self.clients.lock().push(Arc::clone(&client));
        client
    }
}

#[async_trait]
impl ClientConnector for LoopbackConnector {
    async fn attach(&self, identity: &DeviceIdentity) -> Result<DynClient, UpstreamError> {
        Ok(self.register(LoopbackClient::new(Some(identity.clone()), self.auto_pair)))
    }

    async fn provision(&self) -> Result<DynClient, UpstreamError> {
        Ok(self.register(LoopbackClient::new(None, self.auto_pair)))
    }
}

pub struct LoopbackClient {
    this: Weak<Self>,
    auto_pair: bool,
    identity: Mutex<Option<DeviceIdentity>>,
    transport_up: AtomicBool,
    sink: Mutex<Option<mpsc::Sender<UpstreamEvent>>>,
    pairing_tx: Mutex<Option<mpsc::Sender<PairingArtifact>>>,
    groups: Mutex<HashMap<String, GroupSnapshot>>,
    invite_codes: Mutex<HashMap<String, String>>,
    channels: Mutex<HashMap<String, ChannelSnapshot>>,
    community_links: Mutex<HashMap<String, Vec<String>>>,
}

impl LoopbackClient {
    fn new(identity: Option<DeviceIdentity>, auto_pair: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            auto_pair,
            identity: Mutex::new(identity),
            transport_up: AtomicBool::new(false),
            sink: Mutex::new(None),
            pairing_tx: Mutex::new(None),
            groups: Mutex::new(HashMap::new()),
            invite_codes: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            community_links: Mutex::new(HashMap::new()),
        })
    }

    fn emit(&self, event: UpstreamEvent) {
        let sink = self.sink.lock().clone();

        if let Some(sink) = sink {
            if sink.try_send(event).is_err() {
                warn!("loopback event sink is full or gone; event dropped");
            }
        }
    }

    fn require_ready(&self) -> Result<(), UpstreamError> {
        if !self.transport_up.load(Ordering::SeqCst) {
            return Err(UpstreamError::NotConnected);
        }

        if self.identity.lock().is_none() {
            return Err(UpstreamError::Protocol("no device identity paired".to_owned()));
        }

        Ok(())
    }

    /// Simulates the out-of-band scan: mints an identity, confirms the
    /// pairing channel and brings the authenticated transport up.
    pub fn complete_pairing(&self) {
        {
            let mut identity = self.identity.lock();

            if identity.is_none() {
                let minted = format!("{}.0:1@loopback", short_id());
                *identity = minted.parse::<DeviceIdentity>().ok();
            }
        }

        if let Some(tx) = self.pairing_tx.lock().clone() {
            let _ = tx.try_send(PairingArtifact::Paired);
        }

        self.transport_up.store(true, Ordering::SeqCst);
        self.emit(UpstreamEvent::Connected);
    }

    fn receipt() -> SendReceipt {
        SendReceipt {
            id: short_id().to_uppercase(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    fn set_event_sink(&self, sink: mpsc::Sender<UpstreamEvent>) {
        *self.sink.lock() = Some(sink);
    }

    fn is_transport_connected(&self) -> bool {
        self.transport_up.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        self.identity.lock().is_some()
    }

    fn device_identity(&self) -> Option<DeviceIdentity> {
        self.identity.lock().clone()
    }

    async fn connect(&self) -> Result<(), UpstreamError> {
        if self.transport_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.is_authenticated() {
            self.emit(UpstreamEvent::Connected);
        }

        Ok(())
    }

    async fn disconnect(&self) {
        if self.transport_up.swap(false, Ordering::SeqCst) {
            self.emit(UpstreamEvent::Disconnected);
        }
    }

    async fn logout(&self) -> Result<(), UpstreamError> {
        *self.identity.lock() = None;
        self.transport_up.store(false, Ordering::SeqCst);
        self.emit(UpstreamEvent::LoggedOut);
        Ok(())
    }

    async fn begin_pairing(&self) -> Result<mpsc::Receiver<PairingArtifact>, UpstreamError> {
        let (tx, rx) = mpsc::channel(8);

        let code = format!("LOOP-{}", short_id().to_uppercase());
        let _ = tx.try_send(PairingArtifact::Code(code.clone()));
        self.emit(UpstreamEvent::PairingCode { code });

        *self.pairing_tx.lock() = Some(tx);

        if self.auto_pair {
            if let Some(this) = self.this.upgrade() {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    this.complete_pairing();
                });
            }
        }

        Ok(rx)
    }

    async fn send_message(&self, to: &str, _content: OutgoingContent) -> Result<SendReceipt, UpstreamError> {
        self.require_ready()?;

        if to.is_empty() {
            return Err(UpstreamError::Protocol("empty recipient".to_owned()));
        }

        Ok(Self::receipt())
    }

    async fn react(&self, _chat: &str, _message_id: &str, _emoji: &str) -> Result<SendReceipt, UpstreamError> {
        self.require_ready()?;
        Ok(Self::receipt())
    }

    async fn revoke(&self, _chat: &str, _message_id: &str) -> Result<SendReceipt, UpstreamError> {
        self.require_ready()?;
        Ok(Self::receipt())
    }

    async fn mark_read(&self, _chat: &str, _message_ids: &[String]) -> Result<(), UpstreamError> {
        self.require_ready()
    }

    async fn create_group(&self, name: &str, participants: &[String]) -> Result<GroupSnapshot, UpstreamError> {
        self.require_ready()?;

        let snapshot = GroupSnapshot {
            jid: format!("{}@group.loopback", short_id()),
            name: name.to_owned(),
            topic: None,
            owner: self.identity.lock().as_ref().map(|id| id.to_string()),
            participants: participants
                .iter()
                .map(|jid| GroupParticipant {
                    jid: jid.clone(),
                    is_admin: false,
                })
                .collect(),
            announce: false,
            locked: false,
            is_community: false,
            created_at_ms: now_ms(),
        };

        self.groups.lock().insert(snapshot.jid.clone(), snapshot.clone());

        Ok(snapshot)
    }

    async fn group_info(&self, jid: &str) -> Result<GroupSnapshot, UpstreamError> {
        self.require_ready()?;

        self.groups
            .lock()
            .get(jid)
            .cloned()
            .ok_or_else(|| UpstreamError::Protocol(format!("unknown group {jid}")))
    }

    async fn update_participants(
        &self,
        jid: &str,
        action: ParticipantAction,
        participants: &[String],
    ) -> Result<Vec<String>, UpstreamError> {
        self.require_ready()?;

        let mut groups = self.groups.lock();
        let group = groups
            .get_mut(jid)
            .ok_or_else(|| UpstreamError::Protocol(format!("unknown group {jid}")))?;

        for jid in participants {
            match action {
                ParticipantAction::Add => {
                    if !group.participants.iter().any(|p| &p.jid == jid) {
                        group.participants.push(GroupParticipant {
                            jid: jid.clone(),
                            is_admin: false,
                        });
                    }
                }
                ParticipantAction::Remove => group.participants.retain(|p| &p.jid != jid),
                ParticipantAction::Promote => {
                    if let Some(p) = group.participants.iter_mut().find(|p| &p.jid == jid) {
                        p.is_admin = true;
                    }
                }
                ParticipantAction::Demote => {
                    if let Some(p) = group.participants.iter_mut().find(|p| &p.jid == jid) {
                        p.is_admin = false;
                    }
                }
            }
        }

        Ok(participants.to_vec())
    }

    async fn set_group_meta(&self, jid: &str, patch: GroupMetaPatch) -> Result<(), UpstreamError> {
        self.require_ready()?;

        let mut groups = self.groups.lock();
        let group = groups
            .get_mut(jid)
            .ok_or_else(|| UpstreamError::Protocol(format!("unknown group {jid}")))?;

        if let Some(name) = patch.name {
            group.name = name;
        }
        if let Some(topic) = patch.topic {
            group.topic = Some(topic);
        }
        if let Some(announce) = patch.announce {
            group.announce = announce;
        }
        if let Some(locked) = patch.locked {
            group.locked = locked;
        }

        Ok(())
    }

    async fn leave_group(&self, jid: &str) -> Result<(), UpstreamError> {
        self.require_ready()?;
        self.groups.lock().remove(jid);
        Ok(())
    }

    async fn invite_link(&self, jid: &str, reset: bool) -> Result<String, UpstreamError> {
        self.require_ready()?;

        if !self.groups.lock().contains_key(jid) {
            return Err(UpstreamError::Protocol(format!("unknown group {jid}")));
        }

        let mut codes = self.invite_codes.lock();
        let code = codes
            .entry(jid.to_owned())
            .or_insert_with(|| format!("INV-{}", short_id()));

        if reset {
            *code = format!("INV-{}", short_id());
        }

        Ok(format!("https://chat.loopback/invite/{code}"))
    }

    async fn join_with_link(&self, code: &str) -> Result<String, UpstreamError> {
        self.require_ready()?;

        if code.is_empty() {
            return Err(UpstreamError::Protocol("empty invite code".to_owned()));
        }

        let snapshot = GroupSnapshot {
            jid: format!("{}@group.loopback", short_id()),
            name: "joined group".to_owned(),
            topic: None,
            owner: None,
            participants: Vec::new(),
            announce: false,
            locked: false,
            is_community: false,
            created_at_ms: now_ms(),
        };

        let jid = snapshot.jid.clone();
        self.groups.lock().insert(jid.clone(), snapshot);

        Ok(jid)
    }

    async fn create_community(&self, name: &str, description: &str) -> Result<GroupSnapshot, UpstreamError> {
        self.require_ready()?;

        let snapshot = GroupSnapshot {
            jid: format!("{}@community.loopback", short_id()),
            name: name.to_owned(),
            topic: (!description.is_empty()).then(|| description.to_owned()),
            owner: self.identity.lock().as_ref().map(|id| id.to_string()),
            participants: Vec::new(),
            announce: false,
            locked: false,
            is_community: true,
            created_at_ms: now_ms(),
        };

        self.groups.lock().insert(snapshot.jid.clone(), snapshot.clone());

        Ok(snapshot)
    }

    async fn community_info(&self, jid: &str) -> Result<GroupSnapshot, UpstreamError> {
        self.require_ready()?;

        self.groups
            .lock()
            .get(jid)
            .filter(|g| g.is_community)
            .cloned()
            .ok_or_else(|| UpstreamError::Protocol(format!("unknown community {jid}")))
    }

    async fn link_group(&self, community: &str, group: &str, link: bool) -> Result<(), UpstreamError> {
        self.require_ready()?;

        let mut links = self.community_links.lock();
        let entry = links.entry(community.to_owned()).or_default();

        if link {
            if !entry.iter().any(|g| g == group) {
                entry.push(group.to_owned());
            }
        } else {
            entry.retain(|g| g != group);
        }

        Ok(())
    }

    async fn linked_groups(&self, community: &str) -> Result<Vec<GroupSnapshot>, UpstreamError> {
        self.require_ready()?;

        let links = self.community_links.lock();
        let groups = self.groups.lock();

        Ok(links
            .get(community)
            .map(|jids| jids.iter().filter_map(|jid| groups.get(jid).cloned()).collect())
            .unwrap_or_default())
    }

    async fn follow_channel(&self, jid: &str, follow: bool) -> Result<(), UpstreamError> {
        self.require_ready()?;

        let mut channels = self.channels.lock();
        let entry = channels.entry(jid.to_owned()).or_insert_with(|| ChannelSnapshot {
            jid: jid.to_owned(),
            name: jid.split('@').next().unwrap_or(jid).to_owned(),
            following: false,
            muted: false,
        });
        entry.following = follow;

        Ok(())
    }

    async fn channel_info(&self, jid: &str) -> Result<ChannelSnapshot, UpstreamError> {
        self.require_ready()?;

        Ok(self.channels.lock().get(jid).cloned().unwrap_or_else(|| ChannelSnapshot {
            jid: jid.to_owned(),
            name: jid.split('@').next().unwrap_or(jid).to_owned(),
            following: false,
            muted: false,
        }))
    }

    async fn mute_channel(&self, jid: &str, mute: bool) -> Result<(), UpstreamError> {
        self.require_ready()?;

        let mut channels = self.channels.lock();
        let entry = channels.entry(jid.to_owned()).or_insert_with(|| ChannelSnapshot {
            jid: jid.to_owned(),
            name: jid.split('@').next().unwrap_or(jid).to_owned(),
            following: false,
            muted: false,
        });
        entry.muted = mute;

        Ok(())
    }
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_owned()
}

fn now_ms() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provisioned_client_is_unauthenticated() {
        let connector = LoopbackConnector::new(false);
        let client = connector.provision().await.expect("provision");

        assert!(!client.is_authenticated());
        assert!(client.device_identity().is_none());
    }

    #[tokio::test]
    async fn pairing_yields_code_then_paired_on_scan() {
        let connector = LoopbackConnector::new(false);
        let _ = connector.provision().await.expect("provision");
        let client = connector.clients().pop().expect("client");

        let mut rx = client.begin_pairing().await.expect("begin pairing");

        match rx.recv().await {
            Some(PairingArtifact::Code(code)) => assert!(code.starts_with("LOOP-")),
            other => panic!("expected a pairing code, got {other:?}"),
        }

        client.complete_pairing();

        match rx.recv().await {
            Some(PairingArtifact::Paired) => {}
            other => panic!("expected pairing confirmation, got {other:?}"),
        }

        assert!(client.is_authenticated());
        assert!(client.is_transport_connected());
    }

    #[tokio::test]
    async fn domain_calls_require_a_paired_transport() {
        let connector = LoopbackConnector::new(false);
        let client = connector.provision().await.expect("provision");

        let err = client
            .send_message("+15551234567", OutgoingContent::Text { body: "hi".to_owned() })
            .await
            .expect_err("must refuse while unpaired");

        assert!(matches!(err, UpstreamError::NotConnected));
    }
}
