//! Persistence seam for the tenant → device-identity binding.
//!
//! The gateway reattaches returning tenants to their paired upstream device
//! by looking up this mapping at session creation. Writes are idempotent
//! upserts: `created_at` is set on first insert and `updated_at` on every
//! subsequent write.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type DynDeviceStore = Arc<dyn DeviceStore>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("corrupted row for user {user_id}: {reason}")]
    Corrupted { user_id: String, reason: String },
}

impl StoreError {
    pub fn backend(e: impl std::fmt::Display) -> Self {
        Self::Backend(e.to_string())
    }
}

/// One row of `user_device_mapping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub user_id: String,
    pub device_jid: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Performs initial setup required before actually using the store.
    ///
    /// This function should be called first, before using any of the other
    /// functions.
    async fn setup(&self) -> Result<(), StoreError>;

    /// Inserts or refreshes the binding for `user_id`.
    async fn save_mapping(&self, user_id: &str, device_jid: &str) -> Result<(), StoreError>;

    /// Fetches the binding for `user_id`, if any.
    async fn get_mapping(&self, user_id: &str) -> Result<Option<DeviceMapping>, StoreError>;

    /// Removes the binding for `user_id`. Removing an absent row is not an
    /// error.
    async fn delete_mapping(&self, user_id: &str) -> Result<(), StoreError>;

    /// All persisted bindings, used by the admin surface.
    async fn list_mappings(&self) -> Result<Vec<DeviceMapping>, StoreError>;
}
