//! Event publishing onto the active timeline.
//!
//! Every publish resolves the active timeline afresh. A per event type
//! publish gate lets the switch coordinator wait for this process's
//! in-flight publishes before sealing a superseded timeline; writes racing a
//! switch made by another process are detected after the fact and moved to
//! the new active timeline.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cursor::{self, Cursor, Offset, Partition};
use crate::storage::StorageError;
use crate::timeline::{Timeline, TimelineError, TimelineRegistry};

/// How many times a publish follows consecutive switches before giving up.
const MAX_REPUBLISH: usize = 3;

/// Result type for publish operations.
pub type Result<T> = std::result::Result<T, PublishError>;

/// Errors that can occur while publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Partition {partition} out of range for event type {event_type} ({partitions} partitions)")]
    PartitionOutOfRange {
        event_type: String,
        partition: Partition,
        partitions: u32,
    },

    #[error("Publish to {event_type} kept racing timeline switches")]
    SwitchContention { event_type: String },

    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Per event type gates: publishers share them, sealing takes them exclusively.
#[derive(Default)]
pub struct PublishGates {
    gates: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl PublishGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn gate(&self, event_type: &str) -> Arc<RwLock<()>> {
        self.gates
            .lock()
            .await
            .entry(event_type.to_string())
            .or_default()
            .clone()
    }
}

pub struct EventPublisher {
    registry: Arc<TimelineRegistry>,
    gates: Arc<PublishGates>,
}

impl EventPublisher {
    pub fn new(registry: Arc<TimelineRegistry>, gates: Arc<PublishGates>) -> Self {
        Self { registry, gates }
    }

    /// Append `payload` to `partition` of the active timeline, returning the
    /// cursor of the written event.
    #[tracing::instrument(name = "publisher.publish", skip_all, fields(%event_type, partition = partition))]
    pub async fn publish(&self, event_type: &str, partition: Partition, payload: Bytes) -> Result<Cursor> {
        let record = self.registry.event_type(event_type).await?;
        if partition >= record.partitions {
            return Err(PublishError::PartitionOutOfRange {
                event_type: event_type.to_string(),
                partition,
                partitions: record.partitions,
            });
        }

        let gate = self.gates.gate(event_type).await;
        for attempt in 0..=MAX_REPUBLISH {
            let _shared = gate.read().await;
            let timeline = self.registry.active_timeline(event_type).await?;
            let storage = self.registry.storage_for(&timeline).await?;
            let offset = storage
                .publish(&timeline.physical_log_id, partition, payload.clone())
                .await?;

            if self.landed(&timeline, partition, offset).await? {
                debug!(order = timeline.order, offset, "Event published");
                return Ok(cursor::encode(timeline.order, partition, offset));
            }
            warn!(
                order = timeline.order,
                offset,
                attempt,
                "Write landed past the sealed end of a superseded timeline, republishing"
            );
        }

        Err(PublishError::SwitchContention {
            event_type: event_type.to_string(),
        })
    }

    /// Whether a write at `offset` is readable through `written`.
    ///
    /// A timeline sealed after the write includes it; only a seal recorded
    /// before the write completed can leave it orphaned. Legacy writes are
    /// checked against the timeline that adopted the base log.
    async fn landed(&self, written: &Timeline, partition: Partition, offset: Offset) -> Result<bool> {
        let current = match self
            .registry
            .resolve_timeline_for_order(&written.event_type, written.order)
            .await
        {
            Ok(current) => current,
            Err(TimelineError::TimelineNotFound { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(current.end_of(partition).map_or(true, |end| offset < end))
    }
}
