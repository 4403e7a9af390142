use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::OfflineError;
use crate::record::{BufferKey, BufferedRecord, PendingRecord};

pub const STORE_NAME: &str = "pizza_hunt";
pub const SCHEMA_VERSION: i64 = 1;

const REMOVE_CHUNK: usize = 500;

/// The local buffer of pizza writes that could not reach the API.
#[async_trait]
pub trait BufferStore: Send + Sync {
    async fn append(&self, record: &PendingRecord) -> Result<BufferKey, OfflineError>;
    /// Snapshot in insertion order. Nothing is deleted.
    async fn drain(&self) -> Result<Vec<BufferedRecord>, OfflineError>;
    /// Empties the whole buffer. Clearing an empty buffer succeeds.
    async fn clear(&self) -> Result<(), OfflineError>;
    /// Deletes exactly the given keys; unknown keys are ignored.
    async fn remove(&self, keys: &[BufferKey]) -> Result<(), OfflineError>;
    async fn len(&self) -> Result<usize, OfflineError>;
}

pub struct SqliteBufferStore {
    pool: Pool<Sqlite>,
    location: PathBuf,
}

impl SqliteBufferStore {
    /// Opens `<dir>/pizza_hunt.db`, creating the directory, the file and the
    /// `new_pizza` table on first use.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, OfflineError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|err| {
            OfflineError::StoreUnavailable(format!("cannot create {}: {err}", dir.display()))
        })?;

        let location = dir.join(format!("{STORE_NAME}.db"));
        let options = SqliteConnectOptions::new()
            .filename(&location)
            .create_if_missing(true);
        Self::connect(options, location).await
    }

    pub async fn open_in_memory() -> Result<Self, OfflineError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|err| OfflineError::StoreUnavailable(err.to_string()))?;
        Self::connect(options, PathBuf::from(":memory:")).await
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    async fn connect(options: SqliteConnectOptions, location: PathBuf) -> Result<Self, OfflineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|err| {
                OfflineError::StoreUnavailable(format!("{}: {err}", location.display()))
            })?;

        let store = Self { pool, location };
        store.upgrade().await?;
        tracing::debug!(store = %store.location.display(), "offline store opened");
        Ok(store)
    }

    async fn upgrade(&self) -> Result<(), OfflineError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| OfflineError::StoreUnavailable(err.to_string()))?;

        if version > SCHEMA_VERSION {
            return Err(OfflineError::StoreUnavailable(format!(
                "store schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
        if version == SCHEMA_VERSION {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| OfflineError::StoreUnavailable(err.to_string()))?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS new_pizza (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|err| OfflineError::StoreUnavailable(err.to_string()))?;
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&mut *tx)
            .await
            .map_err(|err| OfflineError::StoreUnavailable(err.to_string()))?;
        tx.commit()
            .await
            .map_err(|err| OfflineError::StoreUnavailable(err.to_string()))?;

        tracing::info!(
            store = %self.location.display(),
            version = SCHEMA_VERSION,
            "offline store initialized"
        );
        Ok(())
    }
}

fn storage_error(err: sqlx::Error) -> OfflineError {
    OfflineError::WriteError(err.to_string())
}

#[async_trait]
impl BufferStore for SqliteBufferStore {
    async fn append(&self, record: &PendingRecord) -> Result<BufferKey, OfflineError> {
        let payload = serde_json::to_string(record.as_json())
            .map_err(|err| OfflineError::InvalidRecord(err.to_string()))?;

        let result = sqlx::query("INSERT INTO new_pizza (payload) VALUES (?1)")
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        let key = BufferKey::new(result.last_insert_rowid());
        tracing::debug!(key = %key, "pending record buffered");
        Ok(key)
    }

    async fn drain(&self) -> Result<Vec<BufferedRecord>, OfflineError> {
        let rows = sqlx::query("SELECT id, payload FROM new_pizza ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.into_iter()
            .map(|row| {
                let id: i64 = row.try_get("id").map_err(storage_error)?;
                let payload: String = row.try_get("payload").map_err(storage_error)?;
                let record = PendingRecord::from_json_str(&payload).map_err(|err| {
                    OfflineError::WriteError(format!("corrupted record {id}: {err}"))
                })?;
                Ok(BufferedRecord {
                    key: BufferKey::new(id),
                    record,
                })
            })
            .collect()
    }

    async fn clear(&self) -> Result<(), OfflineError> {
        sqlx::query("DELETE FROM new_pizza")
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    /// All chunks commit together or not at all.
    async fn remove(&self, keys: &[BufferKey]) -> Result<(), OfflineError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        for chunk in keys.chunks(REMOVE_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM new_pizza WHERE id IN (");
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key.get());
            }
            separated.push_unseparated(")");

            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;
        }
        tx.commit().await.map_err(storage_error)?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, OfflineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM new_pizza")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn pizza(name: &str) -> PendingRecord {
        PendingRecord::new(json!({ "name": name })).unwrap()
    }

    fn records(buffered: Vec<BufferedRecord>) -> Vec<PendingRecord> {
        buffered.into_iter().map(|entry| entry.record).collect()
    }

    #[tokio::test]
    async fn drain_returns_records_in_append_order() {
        let store = SqliteBufferStore::open_in_memory().await.unwrap();
        let appended = vec![pizza("Margherita"), pizza("Pepperoni"), pizza("Hawaiian")];
        for record in &appended {
            store.append(record).await.unwrap();
        }

        assert_eq!(records(store.drain().await.unwrap()), appended);
        // drain is a read
        assert_eq!(store.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn append_assigns_increasing_keys() {
        let store = SqliteBufferStore::open_in_memory().await.unwrap();
        let first = store.append(&pizza("a")).await.unwrap();
        let second = store.append(&pizza("b")).await.unwrap();
        assert!(second > first);

        store.clear().await.unwrap();
        let third = store.append(&pizza("c")).await.unwrap();
        assert!(third > second);
    }

    #[tokio::test]
    async fn clear_on_empty_buffer_is_a_no_op() {
        let store = SqliteBufferStore::open_in_memory().await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_deletes_only_given_keys() {
        let store = SqliteBufferStore::open_in_memory().await.unwrap();
        let first = store.append(&pizza("Margherita")).await.unwrap();
        store.append(&pizza("Pepperoni")).await.unwrap();
        let third = store.append(&pizza("Calzone")).await.unwrap();

        store
            .remove(&[first, third, BufferKey::new(999)])
            .await
            .unwrap();
        assert_eq!(records(store.drain().await.unwrap()), vec![pizza("Pepperoni")]);

        store.remove(&[]).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_spanning_several_chunks_deletes_every_key() {
        let store = SqliteBufferStore::open_in_memory().await.unwrap();
        let mut keys = Vec::new();
        for index in 0..(REMOVE_CHUNK * 2 + 10) {
            keys.push(store.append(&pizza(&format!("pizza-{index}"))).await.unwrap());
        }
        let kept = store.append(&pizza("Margherita")).await.unwrap();

        store.remove(&keys).await.unwrap();

        let remaining = store.drain().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, kept);
    }

    #[tokio::test]
    async fn failed_remove_rolls_back_earlier_chunks() {
        let store = SqliteBufferStore::open_in_memory().await.unwrap();
        let mut keys = Vec::new();
        for index in 0..(REMOVE_CHUNK + 5) {
            keys.push(store.append(&pizza(&format!("pizza-{index}"))).await.unwrap());
        }
        // the second chunk's DELETE hits this trigger and aborts
        let blocked = *keys.last().unwrap();
        sqlx::query(&format!(
            "CREATE TRIGGER keep_last BEFORE DELETE ON new_pizza WHEN old.id = {} \
             BEGIN SELECT RAISE(ABORT, 'locked'); END",
            blocked.get()
        ))
        .execute(&store.pool)
        .await
        .unwrap();

        let result = store.remove(&keys).await;

        assert!(matches!(result, Err(OfflineError::WriteError(_))));
        assert_eq!(store.len().await.unwrap(), keys.len());
    }

    #[tokio::test]
    async fn reopening_keeps_buffered_records() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SqliteBufferStore::open(temp_dir.path()).await.unwrap();
            store.append(&pizza("Supreme")).await.unwrap();
            assert!(store.location().ends_with("pizza_hunt.db"));
        }

        let reopened = SqliteBufferStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(records(reopened.drain().await.unwrap()), vec![pizza("Supreme")]);
    }

    #[tokio::test]
    async fn newer_schema_version_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SqliteBufferStore::open(temp_dir.path()).await.unwrap();
            sqlx::query("PRAGMA user_version = 2")
                .execute(&store.pool)
                .await
                .unwrap();
            store.pool.close().await;
        }

        let result = SqliteBufferStore::open(temp_dir.path()).await;
        assert!(matches!(result, Err(OfflineError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn unusable_directory_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let result = SqliteBufferStore::open(&blocker).await;
        assert!(matches!(result, Err(OfflineError::StoreUnavailable(_))));
    }
}
