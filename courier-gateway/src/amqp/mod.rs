//! AMQP event plane: a reconnecting topic-exchange publisher (egress) and a
//! queue-per-action consumer (ingress).

pub mod consumer;
pub mod ingress;
pub mod publisher;

pub use consumer::{EventConsumer, IngressError, IngressHandler, QueueBinding};
pub use publisher::{EventPublisher, PublishError, PublisherReconnectTask};

/// Sentinel tenant id used when an ingress payload is too broken to name
/// one.
pub const UNKNOWN_SESSION: &str = "unknown-session";
