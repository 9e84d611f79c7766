#[macro_use]
extern crate tracing;

use async_trait::async_trait;
use device_store::{DeviceMapping, DeviceStore, StoreError};
use libsql::Connection;
use time::OffsetDateTime;

#[rustfmt::skip]
pub use libsql;

/// Implementation of [`DeviceStore`] using libSQL as the backend.
///
/// The upstream protocol library owns its own tables in the same database
/// file; this store only touches `user_device_mapping`.
///
/// We use the 'user_version' value to store the migration state.
/// It's a very lightweight approach as it is just an integer at a fixed offset
/// in the SQLite file.
/// - <https://sqlite.org/pragma.html#pragma_user_version>
/// - <https://www.sqlite.org/fileformat.html#user_version_number>
#[derive(typed_builder::TypedBuilder)]
pub struct LibSqlDeviceStore {
    conn: Connection,
}

impl LibSqlDeviceStore {
    async fn apply_pragmas(&self) -> Result<(), StoreError> {
        // WAL + synchronous NORMAL is a good combination for a backend
        // service; busy_timeout avoids SQLITE_BUSY under concurrent access
        // with the protocol library sharing the file.
        const PRAGMAS: &str = "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 15000;
            PRAGMA cache_size = -3000;
            PRAGMA temp_store = MEMORY;
        ";

        trace!(sql_query = %PRAGMAS, "PRAGMAs query");

        let mut batch_rows = self
            .conn
            .execute_batch(PRAGMAS)
            .await
            .map_err(StoreError::backend)?;

        while let Some(rows) = batch_rows.next_stmt_row() {
            let Some(mut rows) = rows else {
                continue;
            };

            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA row");
            }
        }

        Ok(())
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let user_version = self.query_user_version().await?;

        match MIGRATIONS.get(user_version..) {
            Some(remaining) if !remaining.is_empty() => {
                info!(
                    user_version,
                    migration_count = MIGRATIONS.len() - user_version,
                    "Start migration"
                );

                for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                    trace!(migration_id, %sql_query, "Apply migration");

                    self.conn
                        .execute_batch(sql_query)
                        .await
                        .map_err(StoreError::backend)?;

                    self.update_user_version(migration_id + 1).await?;
                }

                info!("Migration complete");
            }
            None => {
                warn!(user_version, "user_version is set to an unexpected value");
            }
            _ => {
                debug!(user_version, "Database is already up to date");
            }
        }

        Ok(())
    }

    async fn query_user_version(&self) -> Result<usize, StoreError> {
        let sql_query = "PRAGMA user_version";

        let row = self
            .conn
            .query(sql_query, ())
            .await
            .map_err(StoreError::backend)?
            .next()
            .await
            .map_err(StoreError::backend)?
            .ok_or_else(|| StoreError::Backend("no row returned for user_version".to_owned()))?;

        let value = row.get::<u64>(0).map_err(StoreError::backend)?;

        Ok(usize::try_from(value).expect("number not too big"))
    }

    async fn update_user_version(&self, value: usize) -> Result<(), StoreError> {
        let value = u64::try_from(value).expect("number not too big");

        let sql_query = format!("PRAGMA user_version = {value}");

        self.conn
            .execute(&sql_query, ())
            .await
            .map_err(StoreError::backend)?;

        Ok(())
    }
}

#[async_trait]
impl DeviceStore for LibSqlDeviceStore {
    async fn setup(&self) -> Result<(), StoreError> {
        self.apply_pragmas().await?;
        self.migrate().await?;
        Ok(())
    }

    async fn save_mapping(&self, user_id: &str, device_jid: &str) -> Result<(), StoreError> {
        let sql_query = "INSERT INTO user_device_mapping
            (user_id, device_jid, created_at, updated_at)
            VALUES (:user_id, :device_jid, :now, :now)
            ON CONFLICT(user_id) DO UPDATE SET
                device_jid = excluded.device_jid,
                updated_at = excluded.updated_at";

        let now = OffsetDateTime::now_utc().unix_timestamp();

        let params = (
            (":user_id", user_id.to_owned()),
            (":device_jid", device_jid.to_owned()),
            (":now", now),
        );

        trace!(%sql_query, user_id, device_jid, "Upserting device mapping");

        self.conn
            .execute(sql_query, params)
            .await
            .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn get_mapping(&self, user_id: &str) -> Result<Option<DeviceMapping>, StoreError> {
        let sql_query = "SELECT user_id, device_jid, created_at, updated_at
            FROM user_device_mapping
            WHERE user_id = $1";

        let mut rows = self
            .conn
            .query(sql_query, [user_id.to_owned()])
            .await
            .map_err(StoreError::backend)?;

        let Some(row) = rows.next().await.map_err(StoreError::backend)? else {
            return Ok(None);
        };

        let model = libsql::de::from_row::<MappingModel>(&row).map_err(StoreError::backend)?;

        Ok(Some(model.into_mapping(user_id)?))
    }

    async fn delete_mapping(&self, user_id: &str) -> Result<(), StoreError> {
        let sql_query = "DELETE FROM user_device_mapping WHERE user_id = $1";

        trace!(%sql_query, user_id, "Deleting device mapping");

        self.conn
            .execute(sql_query, [user_id.to_owned()])
            .await
            .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn list_mappings(&self) -> Result<Vec<DeviceMapping>, StoreError> {
        let sql_query = "SELECT user_id, device_jid, created_at, updated_at
            FROM user_device_mapping
            ORDER BY user_id";

        let mut rows = self
            .conn
            .query(sql_query, ())
            .await
            .map_err(StoreError::backend)?;

        let mut mappings = Vec::new();

        while let Some(row) = rows.next().await.map_err(StoreError::backend)? {
            match libsql::de::from_row::<MappingModel>(&row) {
                Ok(model) => {
                    let user_id = model.user_id.clone();
                    mappings.push(model.into_mapping(&user_id)?);
                }
                Err(error) => {
                    error!(%error, ?row, "Failed to read row");
                }
            }
        }

        Ok(mappings)
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
struct MappingModel {
    user_id: String,
    device_jid: String,
    created_at: i64,
    updated_at: i64,
}

impl MappingModel {
    fn into_mapping(self, user_id: &str) -> Result<DeviceMapping, StoreError> {
        let created_at =
            OffsetDateTime::from_unix_timestamp(self.created_at).map_err(|e| StoreError::Corrupted {
                user_id: user_id.to_owned(),
                reason: format!("created_at: {e}"),
            })?;
        let updated_at =
            OffsetDateTime::from_unix_timestamp(self.updated_at).map_err(|e| StoreError::Corrupted {
                user_id: user_id.to_owned(),
                reason: format!("updated_at: {e}"),
            })?;

        Ok(DeviceMapping {
            user_id: self.user_id,
            device_jid: self.device_jid,
            created_at,
            updated_at,
        })
    }
}

// Typically, migrations should not be modified once released, and we should only be appending to this list.
const MIGRATIONS: &[&str] = &["CREATE TABLE user_device_mapping (
        user_id TEXT NOT NULL PRIMARY KEY,
        device_jid TEXT NOT NULL,
        created_at INT NOT NULL,
        updated_at INT NOT NULL
    ) STRICT;"];

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (LibSqlDeviceStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = libsql::Builder::new_local(dir.path().join("store.db"))
            .build()
            .await
            .expect("build db");
        let conn = db.connect().expect("connect");
        let store = LibSqlDeviceStore::builder().conn(conn).build();
        store.setup().await.expect("setup");
        (store, dir)
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let (store, _dir) = open_store().await;

        store.save_mapping("alice", "12345.0:1@device").await.expect("save");

        let mapping = store
            .get_mapping("alice")
            .await
            .expect("get")
            .expect("mapping present");

        assert_eq!(mapping.user_id, "alice");
        assert_eq!(mapping.device_jid, "12345.0:1@device");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_keeps_created_at() {
        let (store, _dir) = open_store().await;

        store.save_mapping("bob", "one@device").await.expect("first save");
        let first = store.get_mapping("bob").await.expect("get").expect("row");

        store.save_mapping("bob", "two@device").await.expect("second save");
        let second = store.get_mapping("bob").await.expect("get").expect("row");

        assert_eq!(second.device_jid, "two@device");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);

        let all = store.list_mappings().await.expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn delete_absent_row_is_ok() {
        let (store, _dir) = open_store().await;
        store.delete_mapping("nobody").await.expect("delete");
        assert!(store.get_mapping("nobody").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn setup_twice_is_idempotent() {
        let (store, _dir) = open_store().await;
        store.setup().await.expect("second setup");
    }
}
