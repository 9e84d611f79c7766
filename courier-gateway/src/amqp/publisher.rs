use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_task::{ShutdownSignal, Task as ServiceTask};
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};

use crate::events::{ClassifiedEvent, EventEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event broker is not connected")]
    NotConnected,
    #[error(transparent)]
    Broker(#[from] lapin::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

struct BrokerLink {
    _connection: lapin::Connection,
    channel: lapin::Channel,
}

/// C8: reliable topic-exchange publisher.
///
/// Durable exchange, persistent JSON messages under `events.<event_type>`.
/// While the broker is away, `publish_*` fails fast with [`PublishError::NotConnected`]
/// and the reconnect task re-establishes the link with a 1→5 s ramp.
pub struct EventPublisher {
    url: String,
    exchange: String,
    link: tokio::sync::Mutex<Option<BrokerLink>>,
    is_connected: Arc<AtomicBool>,
}

impl EventPublisher {
    pub fn new(url: impl Into<String>, exchange: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            exchange: exchange.into(),
            link: tokio::sync::Mutex::new(None),
            is_connected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub(crate) async fn establish(&self) -> Result<(), lapin::Error> {
        let connection = lapin::Connection::connect(&self.url, lapin::ConnectionProperties::default()).await?;

        {
            let is_connected = Arc::clone(&self.is_connected);
            connection.on_error(move |error| {
                warn!(error = %error, "Event broker connection errored");
                is_connected.store(false, Ordering::SeqCst);
            });
        }

        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        *self.link.lock().await = Some(BrokerLink {
            _connection: connection,
            channel,
        });
        self.is_connected.store(true, Ordering::SeqCst);

        info!(exchange = %self.exchange, "Connected to the event broker");

        Ok(())
    }

    /// Publishes a classified event under its taxonomy routing key.
    pub async fn publish_event(&self, event: &ClassifiedEvent) -> Result<(), PublishError> {
        self.publish_envelope(&event.kind.routing_key(), &event.envelope()).await
    }

    /// Publishes an envelope under an explicit routing key (used for
    /// consumer error events).
    pub async fn publish_envelope(&self, routing_key: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        let body = serde_json::to_vec(envelope)?;

        let guard = self.link.lock().await;
        let Some(link) = guard.as_ref() else {
            return Err(PublishError::NotConnected);
        };

        let result = link
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2), // persistent
            )
            .await;

        if let Err(error) = result {
            self.is_connected.store(false, Ordering::SeqCst);
            return Err(PublishError::Broker(error));
        }

        Ok(())
    }
}

/// Background reconnect loop: 1 s, 2 s, 3 s, 4 s, 5 s, then steady-state
/// every 5 s.
pub struct PublisherReconnectTask {
    pub publisher: Arc<EventPublisher>,
}

#[async_trait]
impl ServiceTask for PublisherReconnectTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "event publisher reconnect";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let mut attempt: u64 = 0;

        loop {
            let delay = if self.publisher.is_connected() {
                attempt = 0;
                Duration::from_secs(5)
            } else {
                match self.publisher.establish().await {
                    Ok(()) => {
                        attempt = 0;
                        Duration::from_secs(5)
                    }
                    Err(error) => {
                        attempt += 1;
                        let backoff = Duration::from_secs(attempt.min(5));
                        warn!(
                            error = %error,
                            attempt,
                            backoff_s = backoff.as_secs(),
                            "Event broker connection failed; will retry"
                        );
                        backoff
                    }
                }
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown_signal.wait() => break,
            }
        }

        Ok(())
    }
}
