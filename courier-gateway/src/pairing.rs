//! C2: drives the scan-to-pair handshake and streams it to the caller.
//!
//! At most one pairing is in flight per tenant, enforced by a single-permit
//! semaphore per tenant; entries are removed once the stream terminates so
//! the map stays bounded. Abnormal termination (timeout, cancellation,
//! connect exhaustion) resets the session so no half-open connection leaks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};

use crate::UserId;
use crate::error::GatewayError;
use crate::session::{Session, SessionRegistry};
use crate::upstream::{DynClient, PairingArtifact, UpstreamError};

const CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_GAP: Duration = Duration::from_secs(2);
const SUCCESS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const STREAM_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    Code(String),
    Success,
    Timeout,
    Error(String),
}

type SlotMap = Arc<Mutex<HashMap<UserId, Arc<Semaphore>>>>;

pub struct PairingCoordinator {
    registry: Arc<SessionRegistry>,
    slots: SlotMap,
    timeout: Duration,
}

impl PairingCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            slots: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        })
    }

    /// Opens the pairing stream for a tenant.
    ///
    /// Refuses with `PairingConflict` when the tenant is already paired and
    /// connected, and with `PairingInProgress` when another stream is open.
    pub async fn open_pairing(&self, user_id: &UserId) -> Result<mpsc::Receiver<PairingEvent>, GatewayError> {
        let session = self.registry.create(user_id).await?;

        if session.is_authenticated() && session.is_connected() {
            return Err(GatewayError::PairingConflict(user_id.clone()));
        }

        let permit = {
            let mut slots = self.slots.lock();
            let slot = slots
                .entry(user_id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)));

            Arc::clone(slot)
                .try_acquire_owned()
                .map_err(|_| GatewayError::PairingInProgress(user_id.clone()))?
        };

        // A leftover transport or identity from an earlier life is stale
        // state; start from a clean client.
        if session.is_authenticated() || session.client().is_transport_connected() {
            self.registry.reset(user_id).await?;
        }

        let client = session.client();
        let artifacts = client.begin_pairing().await.map_err(GatewayError::Upstream)?;

        let (tx, rx) = mpsc::channel(STREAM_DEPTH);

        let registry = Arc::clone(&self.registry);
        let slots = Arc::clone(&self.slots);
        let user_id = user_id.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let clean_exit = drive_pairing(&session, client, artifacts, &tx, timeout).await;

            if !clean_exit {
                if let Err(error) = registry.reset(&user_id).await {
                    warn!(user.id = %user_id, error = format!("{error:#}"), "Failed to reset after pairing ended abnormally");
                }
            }

            // Release the slot and drop the map entry under the same lock
            // so a new pairing never races a half-released slot.
            let mut slots = slots.lock();
            drop(permit);
            slots.remove(&user_id);

            debug!(user.id = %user_id, clean_exit, "Pairing stream terminated");
        });

        Ok(rx)
    }
}

/// Runs one pairing attempt to its terminal event. Returns `true` when the
/// pairing succeeded (no reset needed).
async fn drive_pairing(
    session: &Arc<Session>,
    client: DynClient,
    mut artifacts: mpsc::Receiver<PairingArtifact>,
    tx: &mpsc::Sender<PairingEvent>,
    timeout: Duration,
) -> bool {
    let overall = tokio::time::sleep(timeout);
    tokio::pin!(overall);

    let connect = connect_with_retries(client);
    tokio::pin!(connect);
    let mut connecting = true;

    let mut poll = tokio::time::interval_at(
        tokio::time::Instant::now() + SUCCESS_POLL_INTERVAL,
        SUCCESS_POLL_INTERVAL,
    );

    let mut artifacts_open = true;

    loop {
        tokio::select! {
            artifact = artifacts.recv(), if artifacts_open => {
                match artifact {
                    Some(PairingArtifact::Code(code)) => {
                        if tx.send(PairingEvent::Code(code)).await.is_err() {
                            return false;
                        }
                    }
                    Some(PairingArtifact::Paired) => {
                        let _ = tx.send(PairingEvent::Success).await;
                        return true;
                    }
                    None => {
                        // Channel ended without a terminal artifact; the
                        // out-of-band poll still decides the outcome.
                        artifacts_open = false;
                    }
                }
            }
            result = &mut connect, if connecting => {
                connecting = false;

                if let Err(error) = result {
                    let _ = tx.send(PairingEvent::Error(format!("connect retries exhausted: {error}"))).await;
                    return false;
                }
            }
            _ = poll.tick() => {
                if session.is_authenticated() && session.is_connected() {
                    let _ = tx.send(PairingEvent::Success).await;
                    return true;
                }
            }
            () = &mut overall => {
                let _ = tx.send(PairingEvent::Timeout).await;
                return false;
            }
            () = tx.closed() => {
                debug!(user.id = %session.user_id(), "Pairing caller went away");
                return false;
            }
        }
    }
}

async fn connect_with_retries(client: DynClient) -> Result<(), UpstreamError> {
    let mut last_error = None;

    for attempt in 1..=CONNECT_RETRIES {
        match client.connect().await {
            Ok(()) => return Ok(()),
            Err(error) => {
                warn!(attempt, %error, "Pairing connect attempt failed");
                last_error = Some(error);

                if attempt < CONNECT_RETRIES {
                    tokio::time::sleep(CONNECT_RETRY_GAP).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or(UpstreamError::NotConnected))
}
