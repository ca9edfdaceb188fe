//! Switch-over coordination.
//!
//! Every operation here runs under the event type's distributed lock:
//! - `switch_timeline`: move publishing onto a fresh physical log
//! - `delete_timeline`: drop the oldest timeline on request
//! - `retire_drained`: drop drained timelines no consumer still needs
//!
//! A switch seals the superseded timeline after the flip: the per-partition
//! end offsets are recorded while this process's publishers are held off,
//! and readers stop at that end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::registry::TimelineRegistry;
use super::{EventTypeRecord, Result, Timeline, TimelineError, TimelineState};
use crate::cursor::{self, Cursor, CursorError, CursorPosition};
use crate::lock::{timeline_lock_key, DistributedLock, LockGuard};
use crate::publisher::PublishGates;
use crate::storage::{Storage, StorageError};

// ============================================================================
// Consumer tracking
// ============================================================================

/// Tells retirement whether consumers may still read a timeline.
#[async_trait]
pub trait ConsumerTracker: Send + Sync {
    async fn is_referenced(&self, timeline: &Timeline) -> bool;
}

/// Consumer checkpoints held in memory.
///
/// A checkpoint references every timeline at or after the oldest position
/// it holds; `BEGIN` references them all.
#[derive(Default)]
pub struct CheckpointTracker {
    checkpoints: RwLock<HashMap<(String, String), Vec<CursorPosition>>>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `consumer`'s committed cursors for `event_type`.
    pub async fn commit(
        &self,
        event_type: &str,
        consumer: &str,
        cursors: &[Cursor],
    ) -> std::result::Result<(), CursorError> {
        let positions = cursors
            .iter()
            .map(cursor::decode)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.checkpoints
            .write()
            .await
            .insert((event_type.to_string(), consumer.to_string()), positions);
        Ok(())
    }

    /// Forget a consumer. Returns whether it had checkpoints.
    pub async fn remove(&self, event_type: &str, consumer: &str) -> bool {
        self.checkpoints
            .write()
            .await
            .remove(&(event_type.to_string(), consumer.to_string()))
            .is_some()
    }
}

#[async_trait]
impl ConsumerTracker for CheckpointTracker {
    async fn is_referenced(&self, timeline: &Timeline) -> bool {
        let checkpoints = self.checkpoints.read().await;
        checkpoints
            .iter()
            .filter(|((event_type, _), _)| *event_type == timeline.event_type)
            .flat_map(|(_, positions)| positions)
            .any(|position| match position {
                CursorPosition::Begin { .. } => true,
                // Legacy positions live on the first timeline.
                CursorPosition::At(at) => at.order.max(1) <= timeline.order,
            })
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct SwitchCoordinator {
    registry: Arc<TimelineRegistry>,
    lock: DistributedLock,
    gates: Arc<PublishGates>,
    tracker: Arc<dyn ConsumerTracker>,
}

impl SwitchCoordinator {
    pub fn new(
        registry: Arc<TimelineRegistry>,
        lock: DistributedLock,
        gates: Arc<PublishGates>,
        tracker: Arc<dyn ConsumerTracker>,
    ) -> Self {
        Self {
            registry,
            lock,
            gates,
            tracker,
        }
    }

    pub fn registry(&self) -> &Arc<TimelineRegistry> {
        &self.registry
    }

    async fn acquire(&self, event_type: &str) -> Result<LockGuard> {
        self.lock
            .acquire(&timeline_lock_key(event_type))
            .await
            .map_err(|e| TimelineError::from_lock(event_type, e))
    }

    async fn release(&self, guard: LockGuard) {
        let key = guard.key().to_string();
        if let Err(e) = guard.release().await {
            // The lease expires on its own.
            warn!(key = %key, error = %e, "Failed to release lock");
        }
    }

    /// Create a timeline on `storage_id` and make it active.
    #[tracing::instrument(name = "timeline.switch", skip_all, fields(%event_type, %storage_id))]
    pub async fn switch_timeline(&self, event_type: &str, storage_id: &str) -> Result<Timeline> {
        let record = self.registry.event_type(event_type).await?;
        let storage = self.registry.storages().get(storage_id).await?;

        let guard = self.acquire(event_type).await?;
        let result = self.switch_locked(&guard, &record, &storage).await;
        self.release(guard).await;

        match &result {
            Ok(timeline) => info!(order = timeline.order, log = %timeline.physical_log_id, "Timeline switch complete"),
            Err(e) => warn!(error = %e, "Timeline switch failed"),
        }
        result
    }

    async fn switch_locked(
        &self,
        guard: &LockGuard,
        record: &EventTypeRecord,
        storage: &Arc<Storage>,
    ) -> Result<Timeline> {
        let event_type = record.name.as_str();
        self.repair(guard, event_type).await?;

        let records = self.registry.timeline_records(event_type).await?;
        let legacy = records.iter().all(|t| t.switched_at.is_none());
        if legacy && record.storage_id == storage.id() {
            return self.adopt_base_log(guard, record).await;
        }

        // The registry stays untouched until the new log exists.
        let log_id = uuid::Uuid::new_v4().to_string();
        storage.create_log(&log_id, record.partitions).await?;

        let mut created = Vec::with_capacity(2);
        let flipped = self
            .create_and_flip(guard, record, storage.id(), &log_id, legacy, &mut created)
            .await;
        let (active, previous) = match flipped {
            Ok(flipped) => flipped,
            Err(e) => {
                for timeline in &created {
                    self.abandon(guard, timeline).await;
                }
                discard_log(storage, &log_id).await;
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            // The switch already happened; an unsealed timeline gets sealed
            // by the next coordinator run.
            if let Err(e) = self.seal(guard, &previous).await {
                warn!(event_type, order = previous.order, error = %e, "Failed to seal superseded timeline");
            }
        }
        Ok(active)
    }

    /// Persist the new timeline and make it active. On the first switch the
    /// base log is adopted as a draining timeline in the same commit, so
    /// legacy positions stay valid. Every timeline persisted here is pushed
    /// to `created` for compensation.
    async fn create_and_flip(
        &self,
        guard: &LockGuard,
        record: &EventTypeRecord,
        storage_id: &str,
        log_id: &str,
        legacy: bool,
        created: &mut Vec<Timeline>,
    ) -> Result<(Timeline, Option<Timeline>)> {
        let event_type = record.name.as_str();
        let adopted = if legacy {
            let adopted = self
                .registry
                .create_timeline(guard, event_type, &record.storage_id, &record.base_log_id)
                .await?;
            created.push(adopted.clone());
            Some(adopted)
        } else {
            None
        };

        let timeline = self
            .registry
            .create_timeline(guard, event_type, storage_id, log_id)
            .await?;
        created.push(timeline.clone());

        match adopted {
            Some(adopted) => {
                let (active, previous) = self
                    .registry
                    .switch_from_legacy(guard, event_type, adopted.order, timeline.order)
                    .await?;
                debug!(event_type, order = previous.order, "Base log adopted");
                Ok((active, Some(previous)))
            }
            None => self.registry.switch_active(guard, event_type, timeline.order).await,
        }
    }

    /// First switch onto the base storage: the base log itself becomes the
    /// active timeline.
    async fn adopt_base_log(&self, guard: &LockGuard, record: &EventTypeRecord) -> Result<Timeline> {
        let event_type = record.name.as_str();
        let created = self
            .registry
            .create_timeline(guard, event_type, &record.storage_id, &record.base_log_id)
            .await?;
        match self
            .registry
            .switch_active(guard, event_type, created.order)
            .await
        {
            Ok((active, _)) => {
                debug!(event_type, order = active.order, "Base log adopted");
                Ok(active)
            }
            Err(e) => {
                self.abandon(guard, &created).await;
                Err(e)
            }
        }
    }

    /// Compensate a `New` timeline that never became active.
    async fn abandon(&self, guard: &LockGuard, timeline: &Timeline) {
        if let Err(e) = self
            .registry
            .mark_deleted(guard, &timeline.event_type, timeline.order)
            .await
        {
            warn!(
                event_type = %timeline.event_type,
                order = timeline.order,
                error = %e,
                "Failed to discard new timeline; it is cleaned up by the next coordinator run"
            );
        }
    }

    /// Record the end offsets of a superseded timeline.
    async fn seal(&self, guard: &LockGuard, timeline: &Timeline) -> Result<Timeline> {
        let storage = self.registry.storage_for(timeline).await?;
        let gate = self.gates.gate(&timeline.event_type).await;
        let _exclusive = gate.write().await;

        let ends = match storage.latest_offsets(&timeline.physical_log_id).await {
            Ok(ends) => ends,
            Err(StorageError::LogNotFound { .. }) => {
                warn!(
                    event_type = %timeline.event_type,
                    order = timeline.order,
                    "Sealing timeline whose physical log is gone"
                );
                let record = self.registry.event_type(&timeline.event_type).await?;
                vec![0; record.partitions as usize]
            }
            Err(e) => return Err(e.into()),
        };
        self.registry
            .mark_draining(guard, &timeline.event_type, timeline.order, ends)
            .await
    }

    /// Finish what an interrupted switch left behind: seal draining
    /// timelines and discard timelines that never became active.
    async fn repair(&self, guard: &LockGuard, event_type: &str) -> Result<()> {
        let record = self.registry.event_type(event_type).await?;
        let records = self.registry.timeline_records(event_type).await?;
        let mut live: Vec<_> = records.iter().filter(|t| t.state.is_live()).cloned().collect();
        if records.iter().all(|t| t.switched_at.is_none()) {
            // Still legacy: the base log is read through the legacy timeline.
            live.push(Timeline::legacy(&record));
        }
        for timeline in &records {
            match timeline.state {
                TimelineState::Draining if !timeline.is_sealed() => {
                    self.seal(guard, timeline).await?;
                }
                TimelineState::New => {
                    warn!(event_type, order = timeline.order, "Discarding stray new timeline");
                    self.registry
                        .mark_deleted(guard, event_type, timeline.order)
                        .await?;
                    self.drop_log(timeline, &live).await;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Delete the physical log of a retired timeline unless a live timeline
    /// still reads it.
    async fn drop_log(&self, retired: &Timeline, live: &[Timeline]) {
        if live
            .iter()
            .any(|t| t.id != retired.id && t.shares_log_with(retired))
        {
            return;
        }
        match self.registry.storage_for(retired).await {
            Ok(storage) => discard_log(&storage, &retired.physical_log_id).await,
            Err(e) => warn!(storage_id = %retired.storage_id, error = %e, "Cannot drop log of retired timeline"),
        }
    }

    /// Delete the oldest timeline of `event_type`.
    #[tracing::instrument(name = "timeline.delete", skip_all, fields(%event_type))]
    pub async fn delete_timeline(&self, event_type: &str) -> Result<Timeline> {
        self.registry.event_type(event_type).await?;

        let guard = self.acquire(event_type).await?;
        let result = self.delete_locked(&guard, event_type).await;
        self.release(guard).await;
        result
    }

    async fn delete_locked(&self, guard: &LockGuard, event_type: &str) -> Result<Timeline> {
        self.repair(guard, event_type).await?;

        let live = self.registry.list_timelines(event_type).await?;
        let oldest = match live.first() {
            Some(oldest) if live.len() > 1 && oldest.state == TimelineState::Draining => oldest,
            _ => {
                return Err(TimelineError::CannotDeleteActiveTimeline {
                    event_type: event_type.to_string(),
                })
            }
        };

        let deleted = self
            .registry
            .mark_deleted(guard, event_type, oldest.order)
            .await?;
        self.drop_log(&deleted, &live[1..]).await;
        Ok(deleted)
    }

    /// Delete drained timelines whose retention elapsed and that no consumer
    /// references, oldest first.
    #[tracing::instrument(name = "timeline.retire", skip_all, fields(%event_type))]
    pub async fn retire_drained(&self, event_type: &str) -> Result<Vec<Timeline>> {
        let live = self.registry.list_timelines(event_type).await?;
        let unsettled = self
            .registry
            .timeline_records(event_type)
            .await?
            .iter()
            .any(|t| t.state == TimelineState::New);
        if !unsettled && !live.iter().any(|t| t.state == TimelineState::Draining) {
            return Ok(Vec::new());
        }

        let guard = self.acquire(event_type).await?;
        let result = self.retire_locked(&guard, event_type).await;
        self.release(guard).await;
        result
    }

    async fn retire_locked(&self, guard: &LockGuard, event_type: &str) -> Result<Vec<Timeline>> {
        self.repair(guard, event_type).await?;

        let live = self.registry.list_timelines(event_type).await?;
        let now = Utc::now();
        let mut retired = Vec::new();
        for (index, timeline) in live.iter().enumerate() {
            if timeline.state != TimelineState::Draining {
                break;
            }
            if timeline.cleanup_at.map_or(true, |at| at > now) {
                break;
            }
            if self.tracker.is_referenced(timeline).await {
                debug!(event_type, order = timeline.order, "Draining timeline still referenced");
                break;
            }

            let deleted = self
                .registry
                .mark_deleted(guard, event_type, timeline.order)
                .await?;
            self.drop_log(&deleted, &live[index + 1..]).await;
            retired.push(deleted);
        }
        Ok(retired)
    }

    /// Run retirement over every event type. Failures are logged per event
    /// type and do not stop the pass.
    pub async fn retire_all(&self) -> Result<usize> {
        let mut retired = 0;
        for record in self.registry.list_event_types().await? {
            match self.retire_drained(&record.name).await {
                Ok(timelines) => retired += timelines.len(),
                Err(e) => error!(event_type = %record.name, error = %e, "Timeline retirement failed"),
            }
        }
        Ok(retired)
    }
}

async fn discard_log(storage: &Storage, log_id: &str) {
    match storage.delete_log(log_id).await {
        Ok(()) | Err(StorageError::LogNotFound { .. }) => {}
        Err(e) => warn!(storage_id = %storage.id(), log_id, error = %e, "Failed to delete physical log"),
    }
}

// ============================================================================
// Background retirement
// ============================================================================

/// Handle for the background retirement task.
pub struct RetirementTaskHandle {
    cancel: tokio::sync::watch::Sender<bool>,
}

impl RetirementTaskHandle {
    /// Signal the retirement task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Spawn a task that periodically retires drained timelines.
pub fn spawn_retirement_task(
    coordinator: Arc<SwitchCoordinator>,
    interval: Duration,
) -> RetirementTaskHandle {
    let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Timeline retirement task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match coordinator.retire_all().await {
                        Ok(0) => {}
                        Ok(retired) => info!(retired, "Retired drained timelines"),
                        Err(e) => error!(error = %e, "Timeline retirement pass failed"),
                    }
                }
                changed = cancel_rx.changed() => {
                    // A dropped handle stops the task too.
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!("Timeline retirement task stopped");
                        break;
                    }
                }
            }
        }
    });

    RetirementTaskHandle { cancel: cancel_tx }
}
