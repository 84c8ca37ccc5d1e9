use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use thiserror::Error;

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Ascending,
    Descending,
}

/// A record to upsert. `partition` and `position` form the secondary index
/// that [`RecordStore::scan_partition`] walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWrite {
    pub key: String,
    pub partition: String,
    pub position: i64,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub partition: String,
    pub position: i64,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOp {
    Upsert {
        collection: String,
        record: RecordWrite,
    },
    Delete {
        collection: String,
        key: String,
    },
    /// Aborts the whole batch unless the stored position matches; `None`
    /// expects the record to be absent.
    ExpectPosition {
        collection: String,
        key: String,
        position: Option<i64>,
    },
}

#[derive(Debug, Error)]
#[error("precondition failed for {collection}/{key}: expected {expected:?}, found {found:?}")]
pub struct PreconditionFailed {
    pub collection: String,
    pub key: String,
    pub expected: Option<i64>,
    pub found: Option<i64>,
}

/// The host cannot provide durable storage at all. Retrying will not help.
#[derive(Debug, Error)]
#[error("durable storage unsupported: {reason}")]
pub struct StorageUnsupported {
    pub reason: String,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Idempotent setup handshake. May fail with [`StorageUnsupported`].
    async fn open(&self) -> Result<()>;
    async fn upsert(&self, collection: &str, record: RecordWrite) -> Result<()>;
    async fn delete(&self, collection: &str, key: &str) -> Result<bool>;
    async fn get(&self, collection: &str, key: &str) -> Result<Option<StoredRecord>>;
    async fn scan_partition(
        &self,
        collection: &str,
        partition: &str,
        direction: ScanDirection,
    ) -> Result<Vec<StoredRecord>>;
    async fn delete_partition(&self, collection: &str, partition: &str) -> Result<u64>;
    async fn clear_collection(&self, collection: &str) -> Result<u64>;
    /// Deletes records first written before `cutoff`.
    async fn purge_older_than(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<u64>;
    async fn apply_batch(&self, ops: Vec<RecordOp>) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    database_url: String,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let storage = Self::new_lazy(database_url)?;
        storage.open().await?;
        Ok(storage)
    }

    /// Builds the pool without touching the database; the first query (or
    /// [`RecordStore::open`]) connects. Must be called inside a tokio runtime.
    pub fn new_lazy(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);

        // Every connection to an in-memory database gets its own database, so
        // pin those to one long-lived connection.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        Ok(Self {
            pool: pool_options.connect_lazy_with(connect_options),
            database_url: database_url.to_string(),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn position_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        key: &str,
    ) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT position FROM records WHERE collection = ? AND record_key = ?")
            .bind(collection)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0)))
    }
}

const UPSERT_SQL: &str = "INSERT INTO records (collection, record_key, partition_key, position, value, created_at_ms, updated_at_ms)
     VALUES (?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(collection, record_key) DO UPDATE SET
        partition_key = excluded.partition_key,
        position = excluded.position,
        value = excluded.value,
        updated_at_ms = excluded.updated_at_ms";

const SELECT_COLUMNS: &str =
    "SELECT record_key, partition_key, position, value, created_at_ms, updated_at_ms FROM records";

#[async_trait]
impl RecordStore for Storage {
    async fn open(&self) -> Result<()> {
        ensure_sqlite_parent_dir_exists(&self.database_url)?;
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .with_context(|| format!("failed to migrate record store at '{}'", self.database_url))?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, record: RecordWrite) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(UPSERT_SQL)
            .bind(collection)
            .bind(&record.key)
            .bind(&record.partition)
            .bind(record.position)
            .bind(&record.value)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to upsert {collection}/{}", record.key))?;
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND record_key = ?")
            .bind(collection)
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete {collection}/{key}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<StoredRecord>> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE collection = ? AND record_key = ?"
        ))
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load {collection}/{key}"))?;
        row.map(record_from_row).transpose()
    }

    async fn scan_partition(
        &self,
        collection: &str,
        partition: &str,
        direction: ScanDirection,
    ) -> Result<Vec<StoredRecord>> {
        let order = match direction {
            ScanDirection::Ascending => "ASC",
            ScanDirection::Descending => "DESC",
        };
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE collection = ? AND partition_key = ? ORDER BY position {order}, record_key {order}"
        ))
        .bind(collection)
        .bind(partition)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to scan {collection} partition '{partition}'"))?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn delete_partition(&self, collection: &str, partition: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND partition_key = ?")
            .bind(collection)
            .bind(partition)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear {collection} partition '{partition}'"))?;
        Ok(result.rows_affected())
    }

    async fn clear_collection(&self, collection: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear {collection}"))?;
        Ok(result.rows_affected())
    }

    async fn purge_older_than(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND created_at_ms < ?")
            .bind(collection)
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to purge {collection}"))?;
        Ok(result.rows_affected())
    }

    async fn apply_batch(&self, ops: Vec<RecordOp>) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for op in ops {
            match op {
                RecordOp::Upsert { collection, record } => {
                    sqlx::query(UPSERT_SQL)
                        .bind(&collection)
                        .bind(&record.key)
                        .bind(&record.partition)
                        .bind(record.position)
                        .bind(&record.value)
                        .bind(now)
                        .bind(now)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to upsert {collection}/{}", record.key))?;
                }
                RecordOp::Delete { collection, key } => {
                    sqlx::query("DELETE FROM records WHERE collection = ? AND record_key = ?")
                        .bind(&collection)
                        .bind(&key)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to delete {collection}/{key}"))?;
                }
                RecordOp::ExpectPosition {
                    collection,
                    key,
                    position,
                } => {
                    let found = Self::position_in_tx(&mut tx, &collection, &key).await?;
                    if found != position {
                        return Err(PreconditionFailed {
                            collection,
                            key,
                            expected: position,
                            found,
                        }
                        .into());
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

fn record_from_row(row: SqliteRow) -> Result<StoredRecord> {
    Ok(StoredRecord {
        key: row.try_get(0)?,
        partition: row.try_get(1)?,
        position: row.try_get(2)?,
        value: row.try_get(3)?,
        created_at: millis_to_datetime(row.try_get(4)?),
        updated_at: millis_to_datetime(row.try_get(5)?),
    })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    if let Err(err) = fs::create_dir_all(parent) {
        if matches!(
            err.kind(),
            io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported
        ) {
            return Err(StorageUnsupported {
                reason: format!("cannot create '{}': {err}", parent.display()),
            }
            .into());
        }
        return Err(err).with_context(|| {
            format!(
                "failed to create parent directory '{}' for database url '{database_url}'",
                parent.display()
            )
        });
    }

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
