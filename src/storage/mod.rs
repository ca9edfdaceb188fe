//! Physical log storage.
//!
//! This module contains:
//! - `Storage`: closed set of backend variants behind one capability surface
//! - `StorageRegistry`: storage instances addressed by id
//! - Storage configuration types
//! - Implementations: in-memory, SQLite
//!
//! Transient backend failures (`StorageError::Unavailable`) are retried with
//! exponential backoff inside every `Storage` call and only surface once the
//! retries are exhausted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cursor::{Offset, Partition};
use crate::utils::retry::storage_backoff;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

/// Id of the storage created at startup.
pub const DEFAULT_STORAGE_ID: &str = "default";

// ============================================================================
// Errors
// ============================================================================

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Physical log not found: {log_id}")]
    LogNotFound { log_id: String },

    #[error("Physical log already exists: {log_id}")]
    LogExists { log_id: String },

    #[error("Partition {partition} not found in log {log_id}")]
    PartitionNotFound { log_id: String, partition: Partition },

    #[error("Offset {requested} is before earliest retained offset {earliest} in {log_id}/{partition}")]
    OffsetOutOfRange {
        log_id: String,
        partition: Partition,
        requested: Offset,
        earliest: Offset,
    },

    #[error("No storage with id {storage_id}")]
    StorageNotFound { storage_id: String },

    #[error("Storage {storage_id} already registered")]
    DuplicatedStorage { storage_id: String },

    #[error("Storage {storage_id} cannot be removed: {reason}")]
    StorageInUse { storage_id: String, reason: String },

    #[error("Invalid storage configuration: {0}")]
    Config(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// Connection failures and a busy or locked database file clear up on their
/// own; constraint, decode and SQL errors do not.
#[cfg(feature = "sqlite")]
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        // SQLITE_BUSY (5) and SQLITE_LOCKED (6), extended codes included.
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    }
}

/// One record read from a physical log partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: Offset,
    pub payload: Bytes,
}

// ============================================================================
// Storage
// ============================================================================

/// Storage backend kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Process-local logs, lost on restart.
    #[default]
    Memory,
    /// Logs persisted in a SQLite database file.
    Sqlite,
}

/// A physical storage backend.
///
/// The set of backends is small and known ahead of time, so dispatch is a
/// plain `match` rather than a trait object.
pub enum Storage {
    Memory(MemoryStorage),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteStorage),
}

macro_rules! dispatch {
    ($self:ident, $backend:ident => $call:expr) => {
        match $self {
            Storage::Memory($backend) => $call,
            #[cfg(feature = "sqlite")]
            Storage::Sqlite($backend) => $call,
        }
    };
}

impl Storage {
    /// Build a storage from its configuration.
    pub async fn from_config(config: &StorageBackendConfig) -> Result<Self> {
        info!(storage_id = %config.id, storage_type = ?config.storage_type, "Initializing storage");
        match config.storage_type {
            StorageType::Memory => Ok(Self::Memory(MemoryStorage::new(&config.id))),
            #[cfg(feature = "sqlite")]
            StorageType::Sqlite => {
                let storage =
                    SqliteStorage::connect(&config.id, &config.sqlite.path, config.poll_interval())
                        .await?;
                Ok(Self::Sqlite(storage))
            }
            #[cfg(not(feature = "sqlite"))]
            StorageType::Sqlite => Err(StorageError::Config(
                "SQLite storage requested but 'sqlite' feature is not enabled".to_string(),
            )),
        }
    }

    pub fn id(&self) -> &str {
        dispatch!(self, s => s.id())
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            Self::Memory(_) => StorageType::Memory,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => StorageType::Sqlite,
        }
    }

    /// Create a physical log with `partitions` empty partitions.
    pub async fn create_log(&self, log_id: &str, partitions: u32) -> Result<()> {
        retrying("create_log", || async move {
            dispatch!(self, s => s.create_log(log_id, partitions).await)
        })
        .await
    }

    /// Delete a physical log and all of its records.
    pub async fn delete_log(&self, log_id: &str) -> Result<()> {
        retrying("delete_log", || async move {
            dispatch!(self, s => s.delete_log(log_id).await)
        })
        .await
    }

    /// Number of partitions of a physical log.
    pub async fn partitions(&self, log_id: &str) -> Result<u32> {
        retrying("partitions", || async move {
            dispatch!(self, s => s.partitions(log_id).await)
        })
        .await
    }

    /// Append a payload, returning the offset it was written at.
    pub async fn publish(&self, log_id: &str, partition: Partition, payload: Bytes) -> Result<Offset> {
        retrying("publish", || {
            let payload = payload.clone();
            async move { dispatch!(self, s => s.publish(log_id, partition, payload).await) }
        })
        .await
    }

    /// Read up to `max` records following `after`.
    ///
    /// `after = None` starts at the earliest retained offset.
    pub async fn fetch(
        &self,
        log_id: &str,
        partition: Partition,
        after: Option<Offset>,
        max: usize,
    ) -> Result<Vec<LogRecord>> {
        retrying("fetch", || async move {
            dispatch!(self, s => s.fetch(log_id, partition, after, max).await)
        })
        .await
    }

    /// First retained offset; equals `latest_offset` when nothing is retained.
    pub async fn earliest_offset(&self, log_id: &str, partition: Partition) -> Result<Offset> {
        retrying("earliest_offset", || async move {
            dispatch!(self, s => s.earliest_offset(log_id, partition).await)
        })
        .await
    }

    /// Exclusive end of the partition: the offset the next publish gets.
    pub async fn latest_offset(&self, log_id: &str, partition: Partition) -> Result<Offset> {
        retrying("latest_offset", || async move {
            dispatch!(self, s => s.latest_offset(log_id, partition).await)
        })
        .await
    }

    /// Latest offsets of every partition, indexed by partition.
    pub async fn latest_offsets(&self, log_id: &str) -> Result<Vec<Offset>> {
        let partitions = self.partitions(log_id).await?;
        let mut offsets = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            offsets.push(self.latest_offset(log_id, partition).await?);
        }
        Ok(offsets)
    }

    /// Drop records below `before` (retention).
    pub async fn truncate(&self, log_id: &str, partition: Partition, before: Offset) -> Result<()> {
        retrying("truncate", || async move {
            dispatch!(self, s => s.truncate(log_id, partition, before).await)
        })
        .await
    }

    /// Wait until a record after `after` exists or `timeout` elapses.
    ///
    /// Returns `true` when data may be available. Never retried: callers
    /// fetch afterwards and see any backend error there.
    pub async fn wait_for_data(
        &self,
        log_id: &str,
        partition: Partition,
        after: Option<Offset>,
        timeout: Duration,
    ) -> Result<bool> {
        dispatch!(self, s => s.wait_for_data(log_id, partition, after, timeout).await)
    }
}

async fn retrying<T, F, Fut>(operation: &'static str, call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    call.retry(storage_backoff())
        .when(StorageError::is_transient)
        .notify(|err: &StorageError, delay: Duration| {
            warn!(operation, error = %err, delay = ?delay, "Storage unavailable, retrying");
        })
        .await
}

// ============================================================================
// Registry
// ============================================================================

/// Storage instances addressed by id.
pub struct StorageRegistry {
    storages: RwLock<HashMap<String, Arc<Storage>>>,
    default: Arc<Storage>,
}

impl StorageRegistry {
    /// Create a registry whose default storage is `default`.
    pub fn new(default: Storage) -> Self {
        let default = Arc::new(default);
        let mut storages = HashMap::new();
        storages.insert(default.id().to_string(), default.clone());
        Self {
            storages: RwLock::new(storages),
            default,
        }
    }

    /// Build every configured storage.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let default = config
            .backends
            .iter()
            .find(|b| b.id == config.default)
            .ok_or_else(|| StorageError::StorageNotFound {
                storage_id: config.default.clone(),
            })?;

        let registry = Self::new(Storage::from_config(default).await?);
        for backend in config.backends.iter().filter(|b| b.id != config.default) {
            registry.register(Storage::from_config(backend).await?).await?;
        }
        Ok(registry)
    }

    pub fn default_id(&self) -> &str {
        self.default.id()
    }

    pub fn default_storage(&self) -> Arc<Storage> {
        self.default.clone()
    }

    pub async fn register(&self, storage: Storage) -> Result<()> {
        let mut storages = self.storages.write().await;
        let storage_id = storage.id().to_string();
        if storages.contains_key(&storage_id) {
            return Err(StorageError::DuplicatedStorage { storage_id });
        }
        info!(storage_id = %storage_id, "Storage registered");
        storages.insert(storage_id, Arc::new(storage));
        Ok(())
    }

    pub async fn get(&self, storage_id: &str) -> Result<Arc<Storage>> {
        self.storages
            .read()
            .await
            .get(storage_id)
            .cloned()
            .ok_or_else(|| StorageError::StorageNotFound {
                storage_id: storage_id.to_string(),
            })
    }

    /// Registered storage ids, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.storages.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Unregister a storage. The default storage cannot be removed.
    pub async fn remove(&self, storage_id: &str) -> Result<()> {
        if storage_id == self.default.id() {
            return Err(StorageError::StorageInUse {
                storage_id: storage_id.to_string(),
                reason: "default storage".to_string(),
            });
        }
        self.storages
            .write()
            .await
            .remove(storage_id)
            .map(|_| info!(storage_id, "Storage removed"))
            .ok_or_else(|| StorageError::StorageNotFound {
                storage_id: storage_id.to_string(),
            })
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Id of the storage new event types are created on.
    pub default: String,
    /// Configured backends.
    pub backends: Vec<StorageBackendConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default: DEFAULT_STORAGE_ID.to_string(),
            backends: vec![StorageBackendConfig::default()],
        }
    }
}

/// One storage backend (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageBackendConfig {
    /// Storage id referenced by timelines.
    pub id: String,
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// SQLite-specific configuration.
    pub sqlite: SqliteStorageConfig,
    /// Poll interval for noticing writes made by other processes.
    pub poll_interval_ms: u64,
}

impl StorageBackendConfig {
    pub fn memory(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for StorageBackendConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_STORAGE_ID.to_string(),
            storage_type: StorageType::Memory,
            sqlite: SqliteStorageConfig::default(),
            poll_interval_ms: 100,
        }
    }
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteStorageConfig {
    /// Database file path.
    pub path: String,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            path: "data/strata-logs.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests;
