//! Timelines: the physical segments making up an event type's logical log.
//!
//! This module contains:
//! - `Timeline` / `EventTypeRecord`: the persisted records
//! - `TimelineRepository`: persistence interface (memory and SQLite)
//! - `TimelineRegistry`: lookups and lock-guarded mutations
//! - `SwitchCoordinator`: switch-over, deletion and retirement

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::{Offset, Partition, TimelineOrder, LEGACY_ORDER};
use crate::lock::LockError;
use crate::storage::StorageError;

pub mod coordinator;
pub mod registry;
pub mod repository;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use coordinator::{
    spawn_retirement_task, CheckpointTracker, ConsumerTracker, RetirementTaskHandle,
    SwitchCoordinator,
};
pub use registry::TimelineRegistry;
pub use repository::{MemoryTimelineRepository, TimelineRepository};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTimelineRepository;

// ============================================================================
// Errors
// ============================================================================

/// Result type for timeline operations.
pub type Result<T> = std::result::Result<T, TimelineError>;

/// Errors that can occur while reading or mutating timelines.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("Event type not found: {event_type}")]
    EventTypeNotFound { event_type: String },

    #[error("Event type already exists: {event_type}")]
    EventTypeExists { event_type: String },

    #[error("No active timeline for event type {event_type}")]
    NoActiveTimeline { event_type: String },

    #[error("Timeline {order} of event type {event_type} not found")]
    TimelineNotFound {
        event_type: String,
        order: TimelineOrder,
    },

    #[error("Offset {offset} of partition {partition} is outside timeline {order} of {event_type}")]
    PositionNotCovered {
        event_type: String,
        order: TimelineOrder,
        partition: Partition,
        offset: Offset,
    },

    #[error("Cannot delete the only remaining timeline of {event_type}")]
    CannotDeleteActiveTimeline { event_type: String },

    #[error("Timeline {order} of {event_type} cannot go from {from} to {to}")]
    InvalidTransition {
        event_type: String,
        order: TimelineOrder,
        from: TimelineState,
        to: TimelineState,
    },

    #[error("Event type {event_type} has exhausted timeline orders")]
    TooManyTimelines { event_type: String },

    #[error("Lock for event type {event_type} not held")]
    LockNotHeld { event_type: String },

    #[error("Timed out after {waited:?} waiting for the lock of {event_type}")]
    LockTimeout { event_type: String, waited: Duration },

    #[error("Lock error: {0}")]
    Lock(LockError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Repository error: {0}")]
    Repository(String),
}

impl TimelineError {
    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn from_lock(event_type: &str, err: LockError) -> Self {
        match err {
            LockError::Timeout { waited, .. } => Self::LockTimeout {
                event_type: event_type.to_string(),
                waited,
            },
            LockError::NotHeld { .. } => Self::LockNotHeld {
                event_type: event_type.to_string(),
            },
            other => Self::Lock(other),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for TimelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Repository(err.to_string())
    }
}

// ============================================================================
// Records
// ============================================================================

/// Lifecycle state of a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelineState {
    /// Persisted but not yet receiving publishes.
    New,
    /// Receiving publishes.
    Active,
    /// Superseded; still readable until deleted.
    Draining,
    /// Retired; its order is never reused.
    Deleted,
}

impl TimelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "active" => Some(Self::Active),
            "draining" => Some(Self::Draining),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Visible to readers.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Draining)
    }
}

impl std::fmt::Display for TimelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event type and the physical log it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTypeRecord {
    pub name: String,
    /// Declared partition count; every timeline has this many partitions.
    pub partitions: u32,
    /// Storage holding the base log.
    pub storage_id: String,
    /// Physical log backing the event type before its first switch.
    pub base_log_id: String,
    /// How long a draining timeline is kept before retirement.
    pub retention: Duration,
    pub created_at: DateTime<Utc>,
}

/// One physical segment of an event type's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline {
    pub id: String,
    pub event_type: String,
    pub order: TimelineOrder,
    pub storage_id: String,
    pub physical_log_id: String,
    pub state: TimelineState,
    pub created_at: DateTime<Utc>,
    /// When the timeline became active.
    pub switched_at: Option<DateTime<Utc>>,
    /// Earliest time a draining timeline may be retired.
    pub cleanup_at: Option<DateTime<Utc>>,
    /// Exclusive end offset per partition, once superseded and sealed.
    pub sealed_end: Option<Vec<Offset>>,
}

impl Timeline {
    /// A fresh `New` timeline.
    pub fn new(
        event_type: &str,
        order: TimelineOrder,
        storage_id: &str,
        physical_log_id: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            order,
            storage_id: storage_id.to_string(),
            physical_log_id: physical_log_id.to_string(),
            state: TimelineState::New,
            created_at: Utc::now(),
            switched_at: None,
            cleanup_at: None,
            sealed_end: None,
        }
    }

    /// The implicit timeline of an event type that was never switched.
    pub fn legacy(event_type: &EventTypeRecord) -> Self {
        Self {
            id: format!("{}-legacy", event_type.name),
            event_type: event_type.name.clone(),
            order: LEGACY_ORDER,
            storage_id: event_type.storage_id.clone(),
            physical_log_id: event_type.base_log_id.clone(),
            state: TimelineState::Active,
            created_at: event_type.created_at,
            switched_at: Some(event_type.created_at),
            cleanup_at: None,
            sealed_end: None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.order == LEGACY_ORDER
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_end.is_some()
    }

    /// Sealed exclusive end of `partition`, if sealed.
    pub fn end_of(&self, partition: Partition) -> Option<Offset> {
        self.sealed_end
            .as_ref()
            .and_then(|ends| ends.get(partition as usize).copied())
    }

    /// Whether both timelines read the same physical log.
    pub fn shares_log_with(&self, other: &Timeline) -> bool {
        self.storage_id == other.storage_id && self.physical_log_id == other.physical_log_id
    }
}

#[cfg(test)]
mod tests;
