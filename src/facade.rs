//! Strata facade for in-process library usage.
//!
//! Wires storages, timeline metadata, locking, switching, publishing and
//! streaming into one `Broker`.
//!
//! # Example
//!
//! ```ignore
//! use strata::facade::Broker;
//! use strata::stream::StreamRequest;
//!
//! let broker = Broker::in_memory();
//! broker.register_event_type("orders", 4, None, None).await?;
//!
//! let cursor = broker.publish("orders", 0, Bytes::from_static(b"created")).await?;
//! broker.switch_timeline("orders", None).await?;
//!
//! let mut stream = broker
//!     .stream(StreamRequest::new("orders").with_cursors(vec![Cursor::begin(0)]))
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use crate::config::{Config, MetadataType};
use crate::cursor::{Cursor, CursorError, Partition};
use crate::lock::{DistributedLock, LockError, LockService, MemoryLockService};
use crate::publisher::{EventPublisher, PublishError, PublishGates};
use crate::storage::{
    MemoryStorage, Storage, StorageBackendConfig, StorageError, StorageRegistry,
    DEFAULT_STORAGE_ID,
};
use crate::stream::{EventStream, StreamEngine, StreamError, StreamRequest};
use crate::timeline::{
    spawn_retirement_task, CheckpointTracker, EventTypeRecord, MemoryTimelineRepository,
    RetirementTaskHandle, SwitchCoordinator, Timeline, TimelineError, TimelineRegistry,
    TimelineRepository,
};

/// Errors from Broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Cursor error: {0}")]
    Cursor(#[from] CursorError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Main strata instance for library usage.
pub struct Broker {
    storages: Arc<StorageRegistry>,
    registry: Arc<TimelineRegistry>,
    coordinator: Arc<SwitchCoordinator>,
    checkpoints: Arc<CheckpointTracker>,
    publisher: EventPublisher,
    engine: StreamEngine,
    config: Config,
}

impl Broker {
    /// A broker keeping everything in process memory.
    pub fn in_memory() -> Self {
        let storages = StorageRegistry::new(Storage::Memory(MemoryStorage::new(DEFAULT_STORAGE_ID)));
        Self::from_parts(
            Config::default(),
            Arc::new(storages),
            Arc::new(MemoryTimelineRepository::new()),
            Arc::new(MemoryLockService::new()),
        )
    }

    /// Build every configured component.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let storages = Arc::new(StorageRegistry::from_config(&config.storage).await?);

        let (repository, locks): (Arc<dyn TimelineRepository>, Arc<dyn LockService>) =
            match config.metadata.metadata_type {
                MetadataType::Memory => (
                    Arc::new(MemoryTimelineRepository::new()),
                    Arc::new(MemoryLockService::new()),
                ),
                #[cfg(feature = "sqlite")]
                MetadataType::Sqlite => sqlite_metadata(&config.metadata.sqlite.path).await?,
                #[cfg(not(feature = "sqlite"))]
                MetadataType::Sqlite => {
                    return Err(BrokerError::InvalidRequest(
                        "SQLite metadata requested but 'sqlite' feature is not enabled".to_string(),
                    ))
                }
            };

        info!(
            storages = ?storages.list().await,
            metadata = ?config.metadata.metadata_type,
            "Broker initialized"
        );
        Ok(Self::from_parts(config.clone(), storages, repository, locks))
    }

    /// Assemble a broker from already built collaborators.
    pub fn from_parts(
        config: Config,
        storages: Arc<StorageRegistry>,
        repository: Arc<dyn TimelineRepository>,
        locks: Arc<dyn LockService>,
    ) -> Self {
        let registry = Arc::new(TimelineRegistry::new(repository, storages.clone()));
        let gates = Arc::new(PublishGates::new());
        let checkpoints = Arc::new(CheckpointTracker::new());
        let coordinator = Arc::new(SwitchCoordinator::new(
            registry.clone(),
            DistributedLock::from_config(locks, &config.lock),
            gates.clone(),
            checkpoints.clone(),
        ));

        Self {
            publisher: EventPublisher::new(registry.clone(), gates),
            engine: StreamEngine::new(registry.clone(), config.stream.clone()),
            storages,
            registry,
            coordinator,
            checkpoints,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TimelineRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<SwitchCoordinator> {
        &self.coordinator
    }

    // ------------------------------------------------------------------
    // Event types and timelines
    // ------------------------------------------------------------------

    /// Create an event type on `storage_id` (default storage when `None`).
    ///
    /// `retention` defaults to `timelines.default_retention_ms`.
    pub async fn register_event_type(
        &self,
        name: &str,
        partitions: u32,
        storage_id: Option<&str>,
        retention: Option<Duration>,
    ) -> Result<EventTypeRecord> {
        if name.is_empty() {
            return Err(BrokerError::InvalidRequest("event type name is empty".to_string()));
        }
        if partitions == 0 {
            return Err(BrokerError::InvalidRequest(format!(
                "event type {} needs at least one partition",
                name
            )));
        }
        let retention = retention.unwrap_or_else(|| self.config.timelines.default_retention());
        Ok(self
            .registry
            .register_event_type(name, partitions, storage_id, retention)
            .await?)
    }

    pub async fn event_types(&self) -> Result<Vec<EventTypeRecord>> {
        Ok(self.registry.list_event_types().await?)
    }

    /// Readable timelines of `event_type`, oldest first.
    pub async fn list_timelines(&self, event_type: &str) -> Result<Vec<Timeline>> {
        Ok(self.registry.list_timelines(event_type).await?)
    }

    /// Move publishing of `event_type` onto a new timeline on `storage_id`
    /// (default storage when `None`).
    pub async fn switch_timeline(&self, event_type: &str, storage_id: Option<&str>) -> Result<Timeline> {
        let storage_id = storage_id.unwrap_or(self.storages.default_id());
        Ok(self.coordinator.switch_timeline(event_type, storage_id).await?)
    }

    /// Delete the oldest timeline of `event_type`.
    pub async fn delete_timeline(&self, event_type: &str) -> Result<Timeline> {
        Ok(self.coordinator.delete_timeline(event_type).await?)
    }

    /// Start the background retirement task.
    pub fn spawn_retirement(&self) -> RetirementTaskHandle {
        spawn_retirement_task(
            self.coordinator.clone(),
            self.config.timelines.retirement_interval(),
        )
    }

    // ------------------------------------------------------------------
    // Publishing and streaming
    // ------------------------------------------------------------------

    pub async fn publish(&self, event_type: &str, partition: Partition, payload: Bytes) -> Result<Cursor> {
        Ok(self.publisher.publish(event_type, partition, payload).await?)
    }

    pub async fn stream(&self, request: StreamRequest) -> Result<EventStream> {
        Ok(self.engine.stream(request).await?)
    }

    /// Record the cursors `consumer` has processed. Timelines at or after
    /// them are kept from retirement.
    pub async fn commit_cursors(&self, event_type: &str, consumer: &str, cursors: &[Cursor]) -> Result<()> {
        self.registry.event_type(event_type).await?;
        self.checkpoints.commit(event_type, consumer, cursors).await?;
        Ok(())
    }

    /// Forget a consumer's checkpoints.
    pub async fn remove_consumer(&self, event_type: &str, consumer: &str) -> bool {
        self.checkpoints.remove(event_type, consumer).await
    }

    // ------------------------------------------------------------------
    // Storages
    // ------------------------------------------------------------------

    pub async fn list_storages(&self) -> Vec<String> {
        self.storages.list().await
    }

    pub async fn get_storage(&self, storage_id: &str) -> Result<Arc<Storage>> {
        Ok(self.storages.get(storage_id).await?)
    }

    /// Build and register a storage backend.
    pub async fn create_storage(&self, config: &StorageBackendConfig) -> Result<()> {
        if config.id.is_empty() {
            return Err(BrokerError::InvalidRequest("storage id is empty".to_string()));
        }
        if self.storages.get(&config.id).await.is_ok() {
            return Err(StorageError::DuplicatedStorage {
                storage_id: config.id.clone(),
            }
            .into());
        }
        let storage = Storage::from_config(config).await?;
        self.storages.register(storage).await?;
        Ok(())
    }

    /// Unregister a storage no timeline lives on.
    pub async fn delete_storage(&self, storage_id: &str) -> Result<()> {
        self.storages.get(storage_id).await?;
        if self.registry.repository().storage_in_use(storage_id).await? {
            return Err(StorageError::StorageInUse {
                storage_id: storage_id.to_string(),
                reason: "timelines still use it".to_string(),
            }
            .into());
        }
        self.storages.remove(storage_id).await?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
async fn sqlite_metadata(path: &str) -> Result<(Arc<dyn TimelineRepository>, Arc<dyn LockService>)> {
    use sqlx::sqlite::SqlitePoolOptions;

    use crate::lock::SqliteLockService;
    use crate::timeline::SqliteTimelineRepository;

    let pool = if path == ":memory:" {
        // Every connection to an in-memory database sees a different one.
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?
    } else {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BrokerError::InvalidRequest(format!("{}: {}", path, e)))?;
        }
        SqlitePoolOptions::new()
            .connect(&format!("sqlite:{}?mode=rwc", path))
            .await?
    };

    let repository = SqliteTimelineRepository::new(pool.clone());
    repository.init().await?;
    let locks = SqliteLockService::new(pool);
    locks.init().await?;
    Ok((Arc::new(repository), Arc::new(locks)))
}
