use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use courier_task::ChildTask;
use device_store::DynDeviceStore;
use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::UserId;
use crate::error::GatewayError;
use crate::upstream::{DeviceIdentity, DynClient, DynConnector, UpstreamEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_SINK_DEPTH: usize = 256;

/// The gateway's handle to one tenant's upstream protocol client.
///
/// `connected` reflects the stable post-handshake state, not transport-level
/// connectedness; the invariant `connected ⇒ device_identity present` holds
/// because only the classifier flips it, after authentication.
pub struct Session {
    user_id: UserId,
    created_at: OffsetDateTime,
    connected: AtomicBool,
    last_active: AtomicI64,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    client: DynClient,
    device_identity: Option<DeviceIdentity>,
    event_pump: Option<ChildTask<()>>,
}

impl Session {
    fn new(user_id: UserId, client: DynClient) -> Arc<Self> {
        let device_identity = client.device_identity();
        let now = OffsetDateTime::now_utc();

        Arc::new(Self {
            user_id,
            created_at: now,
            connected: AtomicBool::new(false),
            last_active: AtomicI64::new(now.unix_timestamp()),
            inner: Mutex::new(SessionInner {
                client,
                device_identity,
                event_pump: None,
            }),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        self.last_active
            .store(OffsetDateTime::now_utc().unix_timestamp(), Ordering::SeqCst);
    }

    pub fn last_active(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.last_active.load(Ordering::SeqCst))
            .unwrap_or_else(|_| OffsetDateTime::UNIX_EPOCH)
    }

    /// Cheap clone of the client handle; never hold the session lock across
    /// a protocol call.
    pub fn client(&self) -> DynClient {
        Arc::clone(&self.inner.lock().client)
    }

    pub fn device_identity(&self) -> Option<DeviceIdentity> {
        self.inner.lock().device_identity.clone()
    }

    pub fn set_device_identity(&self, identity: Option<DeviceIdentity>) {
        self.inner.lock().device_identity = identity;
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().device_identity.is_some()
    }

    fn install_pump(&self, pump: Option<ChildTask<()>>) {
        self.inner.lock().event_pump = pump;
    }

    /// Structural replacement: swaps in a freshly provisioned client, drops
    /// the previous event pump and clears the authenticated state.
    fn swap_client(&self, client: DynClient, pump: Option<ChildTask<()>>) {
        let mut inner = self.inner.lock();
        inner.client = client;
        inner.device_identity = None;
        inner.event_pump = pump;
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "user_id": self.user_id,
            "connected": self.is_connected(),
            "authenticated": self.is_authenticated(),
            "device_identity": self.device_identity().map(|id| id.to_string()),
            "created_at": self.created_at.unix_timestamp(),
            "last_active": self.last_active().unix_timestamp(),
        })
    }
}

/// Consumes the per-session upstream event stream. Implemented by the
/// classifier; injected after construction to break the registry ↔
/// classifier cycle.
pub trait SessionEventSink: Send + Sync + 'static {
    fn attach(&self, session: Arc<Session>, events: mpsc::Receiver<UpstreamEvent>) -> ChildTask<()>;
}

/// C1: owns the `tenant → session` map and the binding persistence around
/// session creation and teardown.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<UserId, Arc<Session>>>,
    store: DynDeviceStore,
    connector: DynConnector,
    event_sink: OnceLock<Arc<dyn SessionEventSink>>,
}

impl SessionRegistry {
    pub fn new(store: DynDeviceStore, connector: DynConnector) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            connector,
            event_sink: OnceLock::new(),
        })
    }

    /// Must be called once during wiring, before any session is created.
    pub fn install_event_sink(&self, sink: Arc<dyn SessionEventSink>) {
        if self.event_sink.set(sink).is_err() {
            warn!("Session event sink was already installed");
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<Arc<Session>> {
        self.sessions.read().get(user_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Returns the existing session or creates one, reattaching to the
    /// persisted device identity when possible. A stale binding is deleted
    /// and replaced by a fresh provisioning, so failures self-heal across
    /// calls.
    pub async fn create(&self, user_id: &UserId) -> Result<Arc<Session>, GatewayError> {
        if let Some(session) = self.get(user_id) {
            return Ok(session);
        }

        let client = self.client_for(user_id).await?;

        let session = Session::new(user_id.clone(), client);
        self.attach_events(&session);

        let mut sessions = self.sessions.write();

        if let Some(existing) = sessions.get(user_id) {
            // Lost the creation race; the freshly provisioned client is
            // dropped along with `session`.
            return Ok(Arc::clone(existing));
        }

        sessions.insert(user_id.clone(), Arc::clone(&session));
        info!(user.id = %user_id, reattached = session.is_authenticated(), "Session created");

        Ok(session)
    }

    async fn client_for(&self, user_id: &UserId) -> Result<DynClient, GatewayError> {
        match self.store.get_mapping(user_id.as_str()).await? {
            Some(mapping) => match mapping.device_jid.parse::<DeviceIdentity>() {
                Ok(identity) => match self.connector.attach(&identity).await {
                    Ok(client) => Ok(client),
                    Err(error) => {
                        warn!(
                            user.id = %user_id,
                            error = format!("{error:#}"),
                            "Stored device identity no longer attaches; provisioning fresh"
                        );
                        self.store.delete_mapping(user_id.as_str()).await?;
                        Ok(self.connector.provision().await?)
                    }
                },
                Err(error) => {
                    warn!(
                        user.id = %user_id,
                        error = format!("{error:#}"),
                        "Persisted device identity is unparsable; provisioning fresh"
                    );
                    self.store.delete_mapping(user_id.as_str()).await?;
                    Ok(self.connector.provision().await?)
                }
            },
            None => Ok(self.connector.provision().await?),
        }
    }

    fn attach_events(&self, session: &Arc<Session>) {
        let Some(sink) = self.event_sink.get() else {
            debug!(user.id = %session.user_id(), "No event sink installed; upstream events will not be classified");
            return;
        };

        let (tx, rx) = mpsc::channel(EVENT_SINK_DEPTH);
        session.client().set_event_sink(tx);
        session.install_pump(Some(sink.attach(Arc::clone(session), rx)));
    }

    /// Idempotent. Waits up to 10 s for the transport to come up.
    pub async fn connect(&self, user_id: &UserId) -> Result<(), GatewayError> {
        let session = self.create(user_id).await?;
        let client = session.client();

        if client.is_transport_connected() {
            if client.is_authenticated() {
                session.set_connected(true);
            }
            return Ok(());
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, client.connect()).await {
            Ok(Ok(())) => {
                if client.is_authenticated() {
                    session.set_connected(true);
                }
                Ok(())
            }
            Ok(Err(error)) => Err(GatewayError::Upstream(error)),
            Err(_elapsed) => Err(GatewayError::ConnectionTimeout),
        }
    }

    /// Idempotent. Leaves the persisted binding in place.
    pub async fn disconnect(&self, user_id: &UserId) -> Result<(), GatewayError> {
        let session = self.get(user_id).ok_or_else(|| GatewayError::NotFound(user_id.clone()))?;

        session.client().disconnect().await;
        session.set_connected(false);

        Ok(())
    }

    /// Tears down the current client, forgets the persisted binding and
    /// provisions a fresh identity so the tenant can pair again.
    pub async fn reset(&self, user_id: &UserId) -> Result<(), GatewayError> {
        let session = self.get(user_id).ok_or_else(|| GatewayError::NotFound(user_id.clone()))?;

        session.client().disconnect().await;
        self.store.delete_mapping(user_id.as_str()).await?;

        let client = self.connector.provision().await?;

        let pump = self.event_sink.get().map(|sink| {
            let (tx, rx) = mpsc::channel(EVENT_SINK_DEPTH);
            client.set_event_sink(tx);
            sink.attach(Arc::clone(&session), rx)
        });

        session.swap_client(client, pump);
        info!(user.id = %user_id, "Session reset onto a fresh identity");

        Ok(())
    }

    /// Upstream logout followed by local teardown and binding removal.
    pub async fn logout(&self, user_id: &UserId) -> Result<(), GatewayError> {
        let session = self.get(user_id).ok_or_else(|| GatewayError::NotFound(user_id.clone()))?;

        if session.is_connected() && session.is_authenticated() {
            if let Err(error) = session.client().logout().await {
                warn!(user.id = %user_id, error = format!("{error:#}"), "Upstream logout failed; proceeding with local teardown");
            }
        }

        session.client().disconnect().await;
        self.sessions.write().remove(user_id);
        self.store.delete_mapping(user_id.as_str()).await?;

        Ok(())
    }

    /// Local-only removal: drops the session and the binding without calling
    /// the upstream logout.
    pub async fn delete(&self, user_id: &UserId) -> Result<(), GatewayError> {
        let session = self.get(user_id).ok_or_else(|| GatewayError::NotFound(user_id.clone()))?;

        session.client().disconnect().await;
        self.sessions.write().remove(user_id);
        self.store.delete_mapping(user_id.as_str()).await?;

        Ok(())
    }

    /// Disconnects every session and empties the map. Worker teardown is the
    /// pool's job.
    pub async fn close(&self) {
        let sessions: Vec<_> = {
            let mut map = self.sessions.write();
            map.drain().map(|(_, session)| session).collect()
        };

        for session in sessions {
            session.client().disconnect().await;
            session.set_connected(false);
        }
    }

    pub fn store(&self) -> &DynDeviceStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;
    use crate::upstream::loopback::LoopbackConnector;

    use device_store::DeviceStore as _;

    fn registry() -> (Arc<SessionRegistry>, Arc<MemoryStore>, Arc<LoopbackConnector>) {
        let store = Arc::new(MemoryStore::default());
        let connector = LoopbackConnector::new(false);
        let registry = SessionRegistry::new(
            Arc::clone(&store) as DynDeviceStore,
            Arc::clone(&connector) as DynConnector,
        );
        (registry, store, connector)
    }

    #[tokio::test]
    async fn create_is_idempotent_and_returns_the_same_instance() {
        let (registry, _store, _connector) = registry();
        let alice = UserId::from("alice");

        let first = registry.create(&alice).await.expect("create");
        let second = registry.create(&alice).await.expect("create again");

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn create_reattaches_to_a_persisted_identity() {
        let (registry, store, _connector) = registry();
        let alice = UserId::from("alice");

        store
            .save_mapping("alice", "777.0:1@loopback")
            .await
            .expect("seed binding");

        let session = registry.create(&alice).await.expect("create");

        assert!(session.is_authenticated());
        assert_eq!(
            session.device_identity().expect("identity").as_str(),
            "777.0:1@loopback"
        );
    }

    #[tokio::test]
    async fn create_heals_an_unparsable_binding() {
        let (registry, store, _connector) = registry();
        let alice = UserId::from("alice");

        store.save_mapping("alice", "garbage").await.expect("seed binding");

        let session = registry.create(&alice).await.expect("create");

        assert!(!session.is_authenticated());
        assert!(store.get_mapping("alice").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn disconnect_without_session_is_not_found() {
        let (registry, _store, _connector) = registry();

        let err = registry.disconnect(&UserId::from("ghost")).await.expect_err("error");
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (registry, _store, _connector) = registry();
        let alice = UserId::from("alice");

        registry.create(&alice).await.expect("create");
        registry.disconnect(&alice).await.expect("first disconnect");
        registry.disconnect(&alice).await.expect("second disconnect");
    }

    #[tokio::test]
    async fn reset_clears_identity_and_binding() {
        let (registry, store, _connector) = registry();
        let alice = UserId::from("alice");

        store
            .save_mapping("alice", "777.0:1@loopback")
            .await
            .expect("seed binding");

        let session = registry.create(&alice).await.expect("create");
        assert!(session.is_authenticated());

        registry.reset(&alice).await.expect("reset");

        assert!(!session.is_authenticated());
        assert!(!session.is_connected());
        assert!(store.get_mapping("alice").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn logout_removes_the_session_and_binding() {
        let (registry, store, _connector) = registry();
        let alice = UserId::from("alice");

        store
            .save_mapping("alice", "777.0:1@loopback")
            .await
            .expect("seed binding");

        registry.create(&alice).await.expect("create");
        registry.connect(&alice).await.expect("connect");
        registry.logout(&alice).await.expect("logout");

        assert!(registry.get(&alice).is_none());
        assert!(store.get_mapping("alice").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn connect_marks_authenticated_sessions_connected() {
        let (registry, store, _connector) = registry();
        let alice = UserId::from("alice");

        store
            .save_mapping("alice", "777.0:1@loopback")
            .await
            .expect("seed binding");

        registry.connect(&alice).await.expect("connect");

        let session = registry.get(&alice).expect("session");
        assert!(session.is_connected());
    }
}
