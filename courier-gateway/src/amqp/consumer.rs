use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_task::{ShutdownSignal, Task as ServiceTask};
use futures::StreamExt as _;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use serde_json::json;
use time::OffsetDateTime;

use super::publisher::EventPublisher;
use super::UNKNOWN_SESSION;
use crate::events::EventEnvelope;

/// How an ingress handler failed, which decides the delivery's fate.
#[derive(Debug)]
pub enum IngressError {
    /// Transient; the delivery is nacked with requeue so it is retried.
    Retryable(anyhow::Error),
    /// Poison pill; the delivery is acked and an error event is published
    /// out-of-band instead of looping through the queue forever.
    NonRetryable {
        reason: String,
        user_id: Option<String>,
    },
}

#[async_trait]
pub trait IngressHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, routing_key: &str, body: &[u8]) -> Result<(), IngressError>;
}

#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub queue: String,
    pub routing_key: String,
}

/// C9: topic-exchange consumer with one durable queue per logical action,
/// prefetch-bounded, manual ack.
pub struct EventConsumer {
    url: String,
    exchange: String,
    prefetch: u16,
    bindings: Vec<QueueBinding>,
    handlers: Vec<(String, Arc<dyn IngressHandler>)>,
    publisher: Arc<EventPublisher>,
}

impl EventConsumer {
    pub fn new(
        url: impl Into<String>,
        exchange: impl Into<String>,
        prefetch: u16,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            url: url.into(),
            exchange: exchange.into(),
            prefetch,
            bindings: Vec::new(),
            handlers: Vec::new(),
            publisher,
        }
    }

    pub fn bind(&mut self, queue: impl Into<String>, routing_key: impl Into<String>) {
        self.bindings.push(QueueBinding {
            queue: queue.into(),
            routing_key: routing_key.into(),
        });
    }

    /// Registers a handler for a routing-key pattern. `"*"` registers the
    /// wildcard fallback consulted when nothing else matches.
    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn IngressHandler>) {
        self.handlers.push((pattern.into(), handler));
    }

    fn select_handler(&self, routing_key: &str) -> Option<&Arc<dyn IngressHandler>> {
        self.handlers
            .iter()
            .find(|(pattern, _)| pattern != "*" && topic_matches(pattern, routing_key))
            .or_else(|| self.handlers.iter().find(|(pattern, _)| pattern == "*"))
            .map(|(_, handler)| handler)
    }

    /// Runs one broker session until the stream breaks or shutdown is
    /// requested. `Ok(true)` means shutdown.
    async fn consume_session(&self, shutdown_signal: &mut ShutdownSignal) -> Result<bool, lapin::Error> {
        let connection = lapin::Connection::connect(&self.url, lapin::ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel.basic_qos(self.prefetch, BasicQosOptions::default()).await?;

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

        let mut consumers = Vec::new();

        for binding in &self.bindings {
            channel
                .queue_declare(
                    &binding.queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            channel
                .queue_bind(
                    &binding.queue,
                    &self.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            let consumer = channel
                .basic_consume(
                    &binding.queue,
                    &format!("courier-{}", binding.queue),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            info!(queue = %binding.queue, routing_key = %binding.routing_key, "Consuming queue");
            consumers.push(consumer);
        }

        let mut merged = futures::stream::select_all(consumers);

        loop {
            tokio::select! {
                delivery = merged.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.process_delivery(delivery).await,
                        Some(Err(error)) => {
                            error!(%error, "Consumer delivery error; will reconnect");
                            return Err(error);
                        }
                        None => {
                            warn!("Consumer stream ended; will reconnect");
                            return Ok(false);
                        }
                    }
                }
                () = shutdown_signal.wait() => return Ok(true),
            }
        }
    }

    async fn process_delivery(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key.as_str().to_owned();

        let Some(handler) = self.select_handler(&routing_key) else {
            warn!(%routing_key, "No handler for delivery; acking");
            ack(&delivery).await;
            return;
        };

        match handler.handle(&routing_key, &delivery.data).await {
            Ok(()) => ack(&delivery).await,
            Err(IngressError::Retryable(error)) => {
                warn!(
                    %routing_key,
                    handler = handler.name(),
                    error = format!("{error:#}"),
                    "Ingress handler failed; requeueing delivery"
                );

                if let Err(error) = delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                {
                    error!(%error, "Failed to nack delivery");
                }
            }
            Err(IngressError::NonRetryable { reason, user_id }) => {
                warn!(
                    %routing_key,
                    handler = handler.name(),
                    reason,
                    "Poison delivery; acking and emitting an error event"
                );

                ack(&delivery).await;

                let (error_key, envelope) = error_event(&routing_key, &reason, user_id, &delivery.data);

                if let Err(error) = self.publisher.publish_envelope(&error_key, &envelope).await {
                    warn!(error = format!("{error:#}"), "Failed to publish ingress error event");
                }
            }
        }
    }
}

async fn ack(delivery: &Delivery) {
    if let Err(error) = delivery.ack(BasicAckOptions::default()).await {
        error!(%error, "Failed to ack delivery");
    }
}

/// Builds the `<logical_event>-error` event for a poison delivery, falling
/// back to the sentinel tenant when none could be extracted.
fn error_event(routing_key: &str, reason: &str, user_id: Option<String>, raw: &[u8]) -> (String, EventEnvelope) {
    let error_key = format!("{routing_key}-error");
    let logical = routing_key.strip_prefix("events.").unwrap_or(routing_key);

    let envelope = EventEnvelope {
        user_id: user_id.unwrap_or_else(|| UNKNOWN_SESSION.to_owned()),
        event_type: format!("{logical}-error"),
        payload: json!({
            "reason": reason,
            "raw": String::from_utf8_lossy(raw),
        }),
        timestamp_ms: i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(0),
    };

    (error_key, envelope)
}

/// AMQP topic matching: `*` is one word, `#` is zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&word), Some(&key_word)) if word == key_word => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();

    matches(&pattern, &key)
}

#[async_trait]
impl ServiceTask for EventConsumer {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "event consumer";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let mut attempt: u64 = 0;

        loop {
            match self.consume_session(&mut shutdown_signal).await {
                Ok(true) => return Ok(()),
                Ok(false) => attempt = 0,
                Err(error) => {
                    attempt += 1;
                    warn!(%error, attempt, "Consumer session failed");
                }
            }

            let backoff = Duration::from_secs(attempt.clamp(1, 5));

            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = shutdown_signal.wait() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_matching_covers_star_and_hash() {
        assert!(topic_matches("events.send-message", "events.send-message"));
        assert!(topic_matches("events.*", "events.send-message"));
        assert!(!topic_matches("events.*", "events.group.created"));
        assert!(topic_matches("events.#", "events.group.created"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("events.send-message", "events.send-media"));
    }

    #[test]
    fn poison_error_event_uses_the_sentinel_session() {
        let (key, envelope) = error_event("events.send-message", "invalid JSON", None, b"{not json");

        assert_eq!(key, "events.send-message-error");
        assert_eq!(envelope.event_type, "send-message-error");
        assert_eq!(envelope.user_id, UNKNOWN_SESSION);
        assert_eq!(envelope.payload["raw"], "{not json");
    }

    #[test]
    fn poison_error_event_keeps_an_extracted_session() {
        let (_, envelope) = error_event("events.send-message", "missing field", Some("alice".to_owned()), b"{}");
        assert_eq!(envelope.user_id, "alice");
    }

    struct NamedHandler(&'static str);

    #[async_trait]
    impl IngressHandler for NamedHandler {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn handle(&self, _routing_key: &str, _body: &[u8]) -> Result<(), IngressError> {
            Ok(())
        }
    }

    #[test]
    fn first_matching_handler_wins_and_wildcard_is_the_fallback() {
        let publisher = EventPublisher::new("amqp://127.0.0.1", "courier.events");
        let mut consumer = EventConsumer::new("amqp://127.0.0.1", "courier.events", 10, publisher);

        consumer.register("events.send-message", Arc::new(NamedHandler("send-message")));
        consumer.register("events.send-media", Arc::new(NamedHandler("send-media")));
        consumer.register("*", Arc::new(NamedHandler("wildcard")));

        assert_eq!(
            consumer.select_handler("events.send-message").map(|h| h.name()),
            Some("send-message")
        );
        assert_eq!(
            consumer.select_handler("events.send-media").map(|h| h.name()),
            Some("send-media")
        );
        assert_eq!(
            consumer.select_handler("events.something-else").map(|h| h.name()),
            Some("wildcard")
        );
    }

    #[test]
    fn no_handler_when_nothing_matches_and_no_wildcard() {
        let publisher = EventPublisher::new("amqp://127.0.0.1", "courier.events");
        let mut consumer = EventConsumer::new("amqp://127.0.0.1", "courier.events", 10, publisher);

        consumer.register("events.send-message", Arc::new(NamedHandler("send-message")));

        assert!(consumer.select_handler("events.other").is_none());
    }
}
