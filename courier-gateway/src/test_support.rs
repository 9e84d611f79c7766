//! Shared in-memory fakes for unit tests.

use std::collections::HashMap;

use async_trait::async_trait;
use device_store::{DeviceMapping, DeviceStore, StoreError};
use parking_lot::Mutex;
use time::OffsetDateTime;

#[derive(Default)]
pub(crate) struct MemoryStore {
    rows: Mutex<HashMap<String, DeviceMapping>>,
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn setup(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn save_mapping(&self, user_id: &str, device_jid: &str) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut rows = self.rows.lock();

        rows.entry(user_id.to_owned())
            .and_modify(|row| {
                row.device_jid = device_jid.to_owned();
                row.updated_at = now;
            })
            .or_insert_with(|| DeviceMapping {
                user_id: user_id.to_owned(),
                device_jid: device_jid.to_owned(),
                created_at: now,
                updated_at: now,
            });

        Ok(())
    }

    async fn get_mapping(&self, user_id: &str) -> Result<Option<DeviceMapping>, StoreError> {
        Ok(self.rows.lock().get(user_id).cloned())
    }

    async fn delete_mapping(&self, user_id: &str) -> Result<(), StoreError> {
        self.rows.lock().remove(user_id);
        Ok(())
    }

    async fn list_mappings(&self) -> Result<Vec<DeviceMapping>, StoreError> {
        Ok(self.rows.lock().values().cloned().collect())
    }
}
