//! Local record persistence for the offline queue.
//!
//! The engine only needs a tiny key/value contract: read a JSON document by
//! key, and replace it atomically. Two implementations are provided:
//!
//! - [`MemoryStorage`]: process-local map for tests/dev
//! - [`SqliteStorage`]: durable single-table SQLite store (the desktop/mobile default)

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// Local storage failure.
///
/// A failed write is fatal to that single write: callers must not treat the
/// mutation as durable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to read '{key}' from local storage: {message}")]
    Read { key: String, message: String },
    #[error("failed to write '{key}' to local storage: {message}")]
    Write { key: String, message: String },
    #[error("corrupt record under '{key}': {message}")]
    Corrupt { key: String, message: String },
}

impl PersistenceError {
    pub fn read(key: &str, message: impl Into<String>) -> Self {
        Self::Read {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn write(key: &str, message: impl Into<String>) -> Self {
        Self::Write {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn corrupt(key: &str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Persistent key/value primitive consumed by the queue and dead-letter stores.
///
/// `store` must replace the value in a single atomic write: readers observe
/// either the previous document or the new one, never a partial write.
#[async_trait]
pub trait RecordStorage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    async fn store(&self, key: &str, value: String) -> Result<(), PersistenceError>;
}

#[async_trait]
impl<S> RecordStorage for Arc<S>
where
    S: RecordStorage + ?Sized,
{
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        (**self).load(key).await
    }

    async fn store(&self, key: &str, value: String) -> Result<(), PersistenceError> {
        (**self).store(key, value).await
    }
}

/// Load and deserialize a JSON document.
pub(crate) async fn load_json<T>(
    storage: &dyn RecordStorage,
    key: &str,
) -> Result<Option<T>, PersistenceError>
where
    T: DeserializeOwned,
{
    match storage.load(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| PersistenceError::corrupt(key, e.to_string())),
        None => Ok(None),
    }
}

/// Serialize and store a JSON document.
pub(crate) async fn store_json<T>(
    storage: &dyn RecordStorage,
    key: &str,
    value: &T,
) -> Result<(), PersistenceError>
where
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_string(value).map_err(|e| PersistenceError::write(key, e.to_string()))?;
    storage.store(key, raw).await
}

/// In-memory record storage for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl RecordStorage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| PersistenceError::read(key, "storage lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    async fn store(&self, key: &str, value: String) -> Result<(), PersistenceError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| PersistenceError::write(key, "storage lock poisoned"))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum SqliteLocation {
    File(PathBuf),
    Memory,
}

/// SQLite-backed record storage.
///
/// This struct is cheap to clone and is safe to share across threads. The
/// connection pool is created lazily on first use.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    location: SqliteLocation,
    pool: Arc<tokio::sync::Mutex<Option<SqlitePool>>>,
}

impl SqliteStorage {
    /// Storage backed by the database file at `path` (created if missing).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            location: SqliteLocation::File(path.into()),
            pool: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Storage backed by the default per-user database file.
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::open(default_db_path()?))
    }

    /// Non-durable SQLite database living as long as this handle (tests/dev).
    pub fn in_memory() -> Self {
        Self {
            location: SqliteLocation::Memory,
            pool: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Get the pool, initializing it if necessary.
    async fn pool(&self) -> anyhow::Result<SqlitePool> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        let pool = self.connect().await?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    async fn connect(&self) -> anyhow::Result<SqlitePool> {
        let pool = match &self.location {
            SqliteLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create sync store directory at {:?}", parent)
                    })?;
                }

                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true);

                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await
                    .with_context(|| format!("failed to open sync store at {:?}", path))?
            }
            SqliteLocation::Memory => {
                // Every connection to `:memory:` is a separate database, so pin
                // the pool to one connection that never expires.
                let options = SqliteConnectOptions::from_str("sqlite::memory:")
                    .context("invalid in-memory SQLite URL")?;

                SqlitePoolOptions::new()
                    .min_connections(1)
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await
                    .context("failed to open in-memory sync store")?
            }
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_store (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create sync_store table")?;

        Ok(pool)
    }
}

#[async_trait]
impl RecordStorage for SqliteStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let pool = self
            .pool()
            .await
            .map_err(|e| PersistenceError::read(key, format!("{e:#}")))?;

        let row = sqlx::query(
            r#"
            SELECT value
            FROM sync_store
            WHERE key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&pool)
        .await
        .map_err(|e| PersistenceError::read(key, e.to_string()))?;

        match row {
            Some(row) => {
                let value: String = row
                    .try_get("value")
                    .map_err(|e| PersistenceError::corrupt(key, e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn store(&self, key: &str, value: String) -> Result<(), PersistenceError> {
        let pool = self
            .pool()
            .await
            .map_err(|e| PersistenceError::write(key, format!("{e:#}")))?;

        sqlx::query(
            r#"
            INSERT INTO sync_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key)
            DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .map_err(|e| PersistenceError::write(key, e.to_string()))?;

        Ok(())
    }
}

/// Resolve the default sync database path:
/// `{app_data_dir}/stockman/sync.db`.
pub fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    let mut path = base;
    path.push("stockman");
    path.push("sync.db");
    Ok(path)
}
