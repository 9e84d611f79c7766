#[macro_use]
extern crate tracing;

pub mod amqp;
pub mod api;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod extract;
pub mod http;
pub mod log;
pub mod pairing;
pub mod service;
pub mod services;
pub mod session;
pub mod token;
pub mod upstream;

#[cfg(test)]
pub(crate) mod test_support;

use core::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one tenant of the gateway; each tenant owns exactly one
/// upstream session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
