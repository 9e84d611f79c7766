//! C3: runs on each session's upstream event stream.
//!
//! Updates session state, persists the tenant → device binding on first
//! authenticated connect, classifies raw events into the closed taxonomy,
//! then hands the result to the event publisher and the tenant's worker.
//! Events of one tenant are processed strictly in arrival order; publish
//! failures are logged and never block progress.

use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_task::ChildTask;
use device_store::DynDeviceStore;
use serde_json::json;
use tokio::sync::mpsc;

use crate::UserId;
use crate::amqp::EventPublisher;
use crate::dispatch::pool::WorkerPool;
use crate::events::{ClassifiedEvent, EventKind};
use crate::session::{Session, SessionEventSink, SessionRegistry};
use crate::upstream::{GroupChangeEvent, MessageContent, MessageEvent, ParticipantAction, UpstreamEvent};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Classifier {
    this: Weak<Self>,
    registry: Arc<SessionRegistry>,
    store: DynDeviceStore,
    publisher: Arc<EventPublisher>,
    pool: Arc<WorkerPool>,
}

impl Classifier {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: DynDeviceStore,
        publisher: Arc<EventPublisher>,
        pool: Arc<WorkerPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry,
            store,
            publisher,
            pool,
        })
    }

    pub async fn handle_event(&self, session: &Arc<Session>, event: UpstreamEvent) {
        session.touch();
        let user_id = session.user_id().clone();
        let logged_out = matches!(&event, UpstreamEvent::LoggedOut);

        match &event {
            UpstreamEvent::Connected => self.on_connected(session, &user_id).await,
            UpstreamEvent::Disconnected => {
                session.set_connected(false);
                debug!(user.id = %user_id, "Session disconnected");
            }
            UpstreamEvent::LoggedOut => {
                info!(user.id = %user_id, "Device was logged out upstream; re-provisioning");
                session.set_connected(false);
            }
            _ => {}
        }

        let classified = classify(user_id.clone(), event);

        match tokio::time::timeout(PUBLISH_TIMEOUT, self.publisher.publish_event(&classified)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(
                    user.id = %classified.user_id,
                    event.kind = %classified.kind,
                    error = format!("{error:#}"),
                    "Event publish failed"
                );
            }
            Err(_elapsed) => {
                warn!(
                    user.id = %classified.user_id,
                    event.kind = %classified.kind,
                    "Event publish timed out"
                );
            }
        }

        self.pool.send_event(classified);

        // Last step on purpose: the reset replaces this session's event pump
        // (the task running this code), so nothing useful may come after it.
        if logged_out {
            if let Err(error) = self.registry.reset(&user_id).await {
                error!(
                    user.id = %user_id,
                    error = format!("{error:#}"),
                    "Failed to re-provision after upstream logout"
                );
            }
        }
    }

    async fn on_connected(&self, session: &Arc<Session>, user_id: &UserId) {
        let Some(identity) = session.client().device_identity() else {
            warn!(user.id = %user_id, "Connected event without a device identity; ignoring");
            return;
        };

        let first_auth = session.device_identity().is_none();

        session.set_device_identity(Some(identity.clone()));
        session.set_connected(true);

        if first_auth {
            info!(user.id = %user_id, device = %identity, "Session authenticated");
        }

        // Idempotent upsert; a failure costs only the next restart a
        // re-pairing, so the event still propagates.
        if let Err(error) = self.store.save_mapping(user_id.as_str(), identity.as_str()).await {
            error!(
                user.id = %user_id,
                error = format!("{error:#}"),
                "Failed to persist the device binding"
            );
        }
    }
}

impl SessionEventSink for Classifier {
    fn attach(&self, session: Arc<Session>, mut events: mpsc::Receiver<UpstreamEvent>) -> ChildTask<()> {
        let Some(this) = self.this.upgrade() else {
            return ChildTask::spawn(async {});
        };

        ChildTask::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_event(&session, event).await;
            }
        })
    }
}

/// Pure taxonomy assignment and enrichment.
pub fn classify(user_id: UserId, event: UpstreamEvent) -> ClassifiedEvent {
    match event {
        UpstreamEvent::Connected => ClassifiedEvent::new(
            user_id,
            EventKind::ConnectionUpdate,
            json!({"status": "connected"}),
        ),
        UpstreamEvent::Disconnected => ClassifiedEvent::new(
            user_id,
            EventKind::ConnectionUpdate,
            json!({"status": "disconnected"}),
        ),
        UpstreamEvent::LoggedOut => ClassifiedEvent::new(
            user_id,
            EventKind::ConnectionUpdate,
            json!({"status": "logged_out"}),
        ),
        UpstreamEvent::PairingCode { code } => ClassifiedEvent::new(user_id, EventKind::Qr, json!({"code": code})),
        UpstreamEvent::Message(message) => classify_message(user_id, message),
        UpstreamEvent::GroupChange(change) => classify_group_change(user_id, change),
        UpstreamEvent::Raw { kind, payload } => ClassifiedEvent::new(
            user_id,
            EventKind::Unknown,
            json!({"raw_type": kind, "payload": payload}),
        ),
    }
}

fn classify_message(user_id: UserId, message: MessageEvent) -> ClassifiedEvent {
    let text = extract_text(&message.content);

    let raw_type = match &message.content {
        MessageContent::Other { raw_type } => Some(raw_type.clone()),
        _ => None,
    };

    ClassifiedEvent::new(
        user_id,
        EventKind::Message,
        json!({
            "id": message.id,
            "chat": message.chat,
            "sender": message.sender,
            "timestamp_ms": message.timestamp_ms,
            "text": text,
            "raw_type": raw_type,
            "content": message.content,
        }),
    )
}

/// Best-effort text extraction across the known message variants.
fn extract_text(content: &MessageContent) -> Option<String> {
    match content {
        MessageContent::Conversation { text } | MessageContent::ExtendedText { text } => Some(text.clone()),
        MessageContent::Image { caption, .. }
        | MessageContent::Video { caption, .. }
        | MessageContent::Document { caption, .. } => caption.clone(),
        MessageContent::Audio { .. } | MessageContent::Other { .. } => None,
    }
}

/// The first populated field wins, in this order: member-change > name >
/// topic > announce > locked > ephemeral > approval > member-add-mode >
/// delete > link > invite-link.
fn classify_group_change(user_id: UserId, change: GroupChangeEvent) -> ClassifiedEvent {
    let group = change.group.clone();

    if let Some(participants) = change.participants {
        let kind = match participants.action {
            ParticipantAction::Add => EventKind::GroupMembersAdded,
            ParticipantAction::Remove => EventKind::GroupMembersRemoved,
            ParticipantAction::Promote => EventKind::GroupMembersPromoted,
            ParticipantAction::Demote => EventKind::GroupMembersDemoted,
        };

        return ClassifiedEvent::new(
            user_id,
            kind,
            json!({"group": group, "participants": participants.participants}),
        );
    }

    if let Some(name) = change.name {
        return ClassifiedEvent::new(user_id, EventKind::GroupName, json!({"group": group, "name": name}));
    }

    if let Some(topic) = change.topic {
        return ClassifiedEvent::new(user_id, EventKind::GroupTopic, json!({"group": group, "topic": topic}));
    }

    if let Some(announce) = change.announce {
        return ClassifiedEvent::new(
            user_id,
            EventKind::GroupAnnounce,
            json!({"group": group, "announce": announce}),
        );
    }

    if let Some(locked) = change.locked {
        return ClassifiedEvent::new(user_id, EventKind::GroupLocked, json!({"group": group, "locked": locked}));
    }

    if let Some(expiration) = change.ephemeral_secs {
        return ClassifiedEvent::new(
            user_id,
            EventKind::GroupEphemeral,
            json!({"group": group, "expiration_secs": expiration}),
        );
    }

    if let Some(approval) = change.membership_approval {
        return ClassifiedEvent::new(
            user_id,
            EventKind::GroupMembershipApproval,
            json!({"group": group, "membership_approval": approval}),
        );
    }

    if let Some(mode) = change.member_add_mode {
        return ClassifiedEvent::new(
            user_id,
            EventKind::GroupMemberAddMode,
            json!({"group": group, "member_add_mode": mode}),
        );
    }

    if change.deleted.unwrap_or(false) {
        return ClassifiedEvent::new(user_id, EventKind::GroupDeleted, json!({"group": group}));
    }

    if let Some(link) = change.link {
        return match link {
            crate::upstream::GroupLinkChange::Enabled { community } => ClassifiedEvent::new(
                user_id,
                EventKind::GroupLinkEnabled,
                json!({"group": group, "community": community}),
            ),
            crate::upstream::GroupLinkChange::Disabled { community } => ClassifiedEvent::new(
                user_id,
                EventKind::GroupLinkDisabled,
                json!({"group": group, "community": community}),
            ),
        };
    }

    if let Some(invite_link) = change.invite_link {
        return ClassifiedEvent::new(
            user_id,
            EventKind::GroupInviteLinkChanged,
            json!({"group": group, "invite_link": invite_link}),
        );
    }

    ClassifiedEvent::new(
        user_id,
        EventKind::Unknown,
        json!({"raw_type": "group_change", "group": group}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConf, WorkerConf};
    use crate::coordinator::HandlerRegistry;
    use crate::services::ServiceSet;
    use crate::test_support::MemoryStore;
    use crate::upstream::loopback::LoopbackConnector;
    use crate::upstream::{GroupLinkChange, ParticipantsChange};

    use device_store::DeviceStore as _;

    fn user() -> UserId {
        UserId::from("alice")
    }

    fn group_change(mutate: impl FnOnce(&mut GroupChangeEvent)) -> UpstreamEvent {
        let mut change = GroupChangeEvent {
            group: "g1@group".to_owned(),
            ..Default::default()
        };
        mutate(&mut change);
        UpstreamEvent::GroupChange(change)
    }

    #[test]
    fn every_known_raw_event_classifies_to_a_known_kind() {
        let cases: Vec<(UpstreamEvent, EventKind)> = vec![
            (UpstreamEvent::Connected, EventKind::ConnectionUpdate),
            (UpstreamEvent::Disconnected, EventKind::ConnectionUpdate),
            (UpstreamEvent::LoggedOut, EventKind::ConnectionUpdate),
            (
                UpstreamEvent::PairingCode {
                    code: "LOOP-1".to_owned(),
                },
                EventKind::Qr,
            ),
            (
                UpstreamEvent::Message(MessageEvent {
                    id: "m1".to_owned(),
                    chat: "c@chat".to_owned(),
                    sender: "s@chat".to_owned(),
                    timestamp_ms: 1,
                    content: MessageContent::Conversation {
                        text: "hi".to_owned(),
                    },
                }),
                EventKind::Message,
            ),
            (
                group_change(|c| {
                    c.participants = Some(ParticipantsChange {
                        action: ParticipantAction::Add,
                        participants: vec!["p@chat".to_owned()],
                    });
                }),
                EventKind::GroupMembersAdded,
            ),
            (
                group_change(|c| {
                    c.participants = Some(ParticipantsChange {
                        action: ParticipantAction::Demote,
                        participants: vec!["p@chat".to_owned()],
                    });
                }),
                EventKind::GroupMembersDemoted,
            ),
            (group_change(|c| c.name = Some("n".to_owned())), EventKind::GroupName),
            (group_change(|c| c.topic = Some("t".to_owned())), EventKind::GroupTopic),
            (group_change(|c| c.announce = Some(true)), EventKind::GroupAnnounce),
            (group_change(|c| c.locked = Some(true)), EventKind::GroupLocked),
            (group_change(|c| c.ephemeral_secs = Some(86400)), EventKind::GroupEphemeral),
            (
                group_change(|c| c.membership_approval = Some(true)),
                EventKind::GroupMembershipApproval,
            ),
            (
                group_change(|c| c.member_add_mode = Some("admin_add".to_owned())),
                EventKind::GroupMemberAddMode,
            ),
            (group_change(|c| c.deleted = Some(true)), EventKind::GroupDeleted),
            (
                group_change(|c| {
                    c.link = Some(GroupLinkChange::Enabled {
                        community: "comm@community".to_owned(),
                    });
                }),
                EventKind::GroupLinkEnabled,
            ),
            (
                group_change(|c| {
                    c.link = Some(GroupLinkChange::Disabled {
                        community: "comm@community".to_owned(),
                    });
                }),
                EventKind::GroupLinkDisabled,
            ),
            (
                group_change(|c| c.invite_link = Some("https://invite".to_owned())),
                EventKind::GroupInviteLinkChanged,
            ),
        ];

        for (event, expected) in cases {
            let classified = classify(user(), event);
            assert_eq!(classified.kind, expected);
            assert_ne!(classified.kind, EventKind::Unknown);
        }
    }

    #[test]
    fn unknown_raw_events_stay_unknown_with_a_label() {
        let classified = classify(
            user(),
            UpstreamEvent::Raw {
                kind: "call.offer".to_owned(),
                payload: json!({"x": 1}),
            },
        );

        assert_eq!(classified.kind, EventKind::Unknown);
        assert_eq!(classified.payload["raw_type"], "call.offer");
    }

    #[test]
    fn member_change_takes_precedence_over_everything_else() {
        let classified = classify(
            user(),
            group_change(|c| {
                c.participants = Some(ParticipantsChange {
                    action: ParticipantAction::Remove,
                    participants: vec!["p@chat".to_owned()],
                });
                c.name = Some("renamed".to_owned());
                c.topic = Some("retitled".to_owned());
                c.invite_link = Some("https://invite".to_owned());
            }),
        );

        assert_eq!(classified.kind, EventKind::GroupMembersRemoved);
    }

    #[test]
    fn name_beats_topic_and_later_fields() {
        let classified = classify(
            user(),
            group_change(|c| {
                c.name = Some("renamed".to_owned());
                c.topic = Some("retitled".to_owned());
                c.deleted = Some(true);
            }),
        );

        assert_eq!(classified.kind, EventKind::GroupName);
    }

    #[test]
    fn message_text_is_extracted_best_effort() {
        let image = classify(
            user(),
            UpstreamEvent::Message(MessageEvent {
                id: "m1".to_owned(),
                chat: "c@chat".to_owned(),
                sender: "s@chat".to_owned(),
                timestamp_ms: 1,
                content: MessageContent::Image {
                    caption: Some("look".to_owned()),
                    mime: "image/jpeg".to_owned(),
                },
            }),
        );

        assert_eq!(image.payload["text"], "look");

        let other = classify(
            user(),
            UpstreamEvent::Message(MessageEvent {
                id: "m2".to_owned(),
                chat: "c@chat".to_owned(),
                sender: "s@chat".to_owned(),
                timestamp_ms: 2,
                content: MessageContent::Other {
                    raw_type: "poll_update".to_owned(),
                },
            }),
        );

        assert_eq!(other.kind, EventKind::Message);
        assert_eq!(other.payload["raw_type"], "poll_update");
        assert!(other.payload["text"].is_null());
    }

    #[tokio::test]
    async fn first_connected_event_persists_the_binding() {
        let store = Arc::new(MemoryStore::default());
        let connector = LoopbackConnector::new(false);
        let registry = SessionRegistry::new(Arc::clone(&store) as DynDeviceStore, connector.clone());

        let services = ServiceSet::over_registry(Arc::clone(&registry), Duration::from_secs(5));
        let pool = WorkerPool::new(
            services,
            Arc::new(HandlerRegistry::new()),
            WorkerConf {
                task_queue_size: 8,
                event_queue_size: 8,
                task_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(1800),
            },
            PoolConf {
                healthcheck_interval: Duration::from_secs(30),
                cleanup_interval: Duration::from_secs(300),
                max_workers_per_tenant: 3,
            },
        );
        let publisher = EventPublisher::new("amqp://127.0.0.1:1@invalid", "courier.events");

        let classifier = Classifier::new(
            Arc::clone(&registry),
            Arc::clone(&store) as DynDeviceStore,
            publisher,
            pool,
        );
        registry.install_event_sink(classifier.clone());

        let alice = user();
        let session = registry.create(&alice).await.expect("create");

        // Simulate the scan completing on the loopback client.
        let client = connector.clients().pop().expect("client");
        client.complete_pairing();

        // The pump runs on the runtime; give it a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(session.is_connected());
        assert!(session.is_authenticated());

        let mapping = store
            .get_mapping("alice")
            .await
            .expect("get")
            .expect("binding persisted");

        assert_eq!(
            mapping.device_jid,
            session.device_identity().expect("identity").to_string()
        );
    }
}
