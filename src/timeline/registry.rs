//! Timeline registry: the source of truth for which physical log backs which
//! part of an event type's logical log.
//!
//! Reads take no lock and may observe a switch mid-flight; callers tolerate
//! that by re-resolving. Mutations demand a `LockGuard` for the event type's
//! timeline lock and map to a single repository commit each.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::repository::TimelineRepository;
use super::{EventTypeRecord, Result, Timeline, TimelineError, TimelineState};
use crate::cursor::{Offset, Position, TimelineOrder, LEGACY_ORDER, MAX_ORDER};
use crate::lock::{timeline_lock_key, LockGuard};
use crate::storage::{Storage, StorageRegistry};

pub struct TimelineRegistry {
    repository: Arc<dyn TimelineRepository>,
    storages: Arc<StorageRegistry>,
    changes: watch::Sender<u64>,
}

impl TimelineRegistry {
    pub fn new(repository: Arc<dyn TimelineRepository>, storages: Arc<StorageRegistry>) -> Self {
        Self {
            repository,
            storages,
            changes: watch::channel(0).0,
        }
    }

    pub fn storages(&self) -> &Arc<StorageRegistry> {
        &self.storages
    }

    pub fn repository(&self) -> &Arc<dyn TimelineRepository> {
        &self.repository
    }

    /// Receiver bumped after every mutation made through this registry.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    // ------------------------------------------------------------------
    // Event types
    // ------------------------------------------------------------------

    /// Create an event type and its base log on `storage_id` (the default
    /// storage when `None`).
    pub async fn register_event_type(
        &self,
        name: &str,
        partitions: u32,
        storage_id: Option<&str>,
        retention: Duration,
    ) -> Result<EventTypeRecord> {
        if self.repository.get_event_type(name).await?.is_some() {
            return Err(TimelineError::EventTypeExists {
                event_type: name.to_string(),
            });
        }

        let storage = match storage_id {
            Some(id) => self.storages.get(id).await?,
            None => self.storages.default_storage(),
        };
        let record = EventTypeRecord {
            name: name.to_string(),
            partitions,
            storage_id: storage.id().to_string(),
            base_log_id: uuid::Uuid::new_v4().to_string(),
            retention,
            created_at: Utc::now(),
        };

        storage.create_log(&record.base_log_id, partitions).await?;
        if let Err(e) = self.repository.create_event_type(&record).await {
            if let Err(cleanup) = storage.delete_log(&record.base_log_id).await {
                warn!(event_type = name, error = %cleanup, "Failed to remove orphaned base log");
            }
            return Err(e);
        }

        info!(
            event_type = name,
            partitions,
            storage_id = %record.storage_id,
            "Event type registered"
        );
        self.notify();
        Ok(record)
    }

    pub async fn event_type(&self, name: &str) -> Result<EventTypeRecord> {
        self.repository
            .get_event_type(name)
            .await?
            .ok_or_else(|| TimelineError::EventTypeNotFound {
                event_type: name.to_string(),
            })
    }

    pub async fn list_event_types(&self) -> Result<Vec<EventTypeRecord>> {
        self.repository.list_event_types().await
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Every persisted timeline record, deleted and new ones included.
    pub async fn timeline_records(&self, event_type: &str) -> Result<Vec<Timeline>> {
        self.event_type(event_type).await?;
        self.repository.list_timelines(event_type).await
    }

    /// Readable timelines, oldest first.
    ///
    /// Until some timeline has been activated the event type lives on its
    /// legacy timeline, which is the only one listed.
    pub async fn list_timelines(&self, event_type: &str) -> Result<Vec<Timeline>> {
        let record = self.event_type(event_type).await?;
        let timelines = self.repository.list_timelines(event_type).await?;
        if timelines.iter().all(|t| t.switched_at.is_none()) {
            return Ok(vec![Timeline::legacy(&record)]);
        }
        Ok(timelines.into_iter().filter(|t| t.state.is_live()).collect())
    }

    pub async fn active_timeline(&self, event_type: &str) -> Result<Timeline> {
        self.list_timelines(event_type)
            .await?
            .into_iter()
            .find(|t| t.state == TimelineState::Active)
            .ok_or_else(|| TimelineError::NoActiveTimeline {
                event_type: event_type.to_string(),
            })
    }

    /// The readable timeline with `order`.
    ///
    /// Order 0 names the legacy timeline; once switched, it resolves to the
    /// timeline that adopted the event type's base log.
    pub async fn resolve_timeline_for_order(
        &self,
        event_type: &str,
        order: TimelineOrder,
    ) -> Result<Timeline> {
        let record = self.event_type(event_type).await?;
        let timelines = self.list_timelines(event_type).await?;
        let not_found = || TimelineError::TimelineNotFound {
            event_type: event_type.to_string(),
            order,
        };

        if order != LEGACY_ORDER {
            return timelines
                .into_iter()
                .find(|t| t.order == order)
                .ok_or_else(not_found);
        }
        let legacy = Timeline::legacy(&record);
        timelines
            .into_iter()
            .find(|t| t.is_legacy() || t.shares_log_with(&legacy))
            .ok_or_else(not_found)
    }

    /// The first readable timeline after `order`.
    pub async fn next_timeline(
        &self,
        event_type: &str,
        order: TimelineOrder,
    ) -> Result<Option<Timeline>> {
        Ok(self
            .list_timelines(event_type)
            .await?
            .into_iter()
            .find(|t| t.order > order))
    }

    /// Resolve a position to the timeline whose retained range covers it.
    ///
    /// The position names the last event consumed, so the offset just before
    /// the earliest retained one is still covered, and nothing at or past
    /// the timeline's end is.
    pub async fn resolve_position(&self, event_type: &str, position: &Position) -> Result<Timeline> {
        let timeline = self
            .resolve_timeline_for_order(event_type, position.order)
            .await?;
        let storage = self.storage_for(&timeline).await?;
        let log = &timeline.physical_log_id;

        let earliest = storage.earliest_offset(log, position.partition).await?;
        let end = match timeline.end_of(position.partition) {
            Some(end) => end,
            None => storage.latest_offset(log, position.partition).await?,
        };
        if position.offset + 1 < earliest || position.offset >= end {
            return Err(TimelineError::PositionNotCovered {
                event_type: event_type.to_string(),
                order: position.order,
                partition: position.partition,
                offset: position.offset,
            });
        }
        Ok(timeline)
    }

    pub async fn storage_for(&self, timeline: &Timeline) -> Result<Arc<Storage>> {
        Ok(self.storages.get(&timeline.storage_id).await?)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    async fn check_guard(&self, guard: &LockGuard, event_type: &str) -> Result<()> {
        if guard.key() != timeline_lock_key(event_type) {
            return Err(TimelineError::LockNotHeld {
                event_type: event_type.to_string(),
            });
        }
        guard
            .verify()
            .await
            .map_err(|e| TimelineError::from_lock(event_type, e))
    }

    async fn record(&self, event_type: &str, order: TimelineOrder) -> Result<Timeline> {
        self.repository
            .list_timelines(event_type)
            .await?
            .into_iter()
            .find(|t| t.order == order)
            .ok_or_else(|| TimelineError::TimelineNotFound {
                event_type: event_type.to_string(),
                order,
            })
    }

    /// Persist a `New` timeline for an existing physical log.
    pub async fn create_timeline(
        &self,
        guard: &LockGuard,
        event_type: &str,
        storage_id: &str,
        physical_log_id: &str,
    ) -> Result<Timeline> {
        self.check_guard(guard, event_type).await?;
        self.event_type(event_type).await?;

        let existing = self.repository.list_timelines(event_type).await?;
        let order = existing.iter().map(|t| t.order).max().unwrap_or(0) + 1;
        if order > MAX_ORDER {
            return Err(TimelineError::TooManyTimelines {
                event_type: event_type.to_string(),
            });
        }

        let timeline = Timeline::new(event_type, order, storage_id, physical_log_id);
        self.repository
            .commit(std::slice::from_ref(&timeline), &[])
            .await?;
        debug!(event_type, order, storage_id, physical_log_id, "Timeline created");
        self.notify();
        Ok(timeline)
    }

    /// Atomically make `new_order` active and the current active timeline
    /// draining. Returns the new active timeline and the demoted one, if any.
    pub async fn switch_active(
        &self,
        guard: &LockGuard,
        event_type: &str,
        new_order: TimelineOrder,
    ) -> Result<(Timeline, Option<Timeline>)> {
        self.flip(guard, event_type, new_order, None).await
    }

    /// First switch of a never-switched event type: in one commit, the `New`
    /// timeline `adopted` (backed by the base log) starts draining and
    /// `new_order` becomes active.
    ///
    /// Legacy positions then resolve to `adopted`, which the caller seals.
    pub async fn switch_from_legacy(
        &self,
        guard: &LockGuard,
        event_type: &str,
        adopted: TimelineOrder,
        new_order: TimelineOrder,
    ) -> Result<(Timeline, Timeline)> {
        let (active, previous) = self.flip(guard, event_type, new_order, Some(adopted)).await?;
        let previous = previous.ok_or_else(|| TimelineError::TimelineNotFound {
            event_type: event_type.to_string(),
            order: adopted,
        })?;
        Ok((active, previous))
    }

    async fn flip(
        &self,
        guard: &LockGuard,
        event_type: &str,
        new_order: TimelineOrder,
        adopted: Option<TimelineOrder>,
    ) -> Result<(Timeline, Option<Timeline>)> {
        self.check_guard(guard, event_type).await?;
        let record = self.event_type(event_type).await?;
        let timelines = self.repository.list_timelines(event_type).await?;
        let find_new = |order: TimelineOrder, to: TimelineState| -> Result<Timeline> {
            let timeline = timelines
                .iter()
                .find(|t| t.order == order)
                .cloned()
                .ok_or_else(|| TimelineError::TimelineNotFound {
                    event_type: event_type.to_string(),
                    order,
                })?;
            if timeline.state != TimelineState::New {
                return Err(TimelineError::InvalidTransition {
                    event_type: event_type.to_string(),
                    order,
                    from: timeline.state,
                    to,
                });
            }
            Ok(timeline)
        };

        let mut next = find_new(new_order, TimelineState::Active)?;
        let now = Utc::now();
        let previous = match adopted {
            Some(order) => {
                let mut adopted = find_new(order, TimelineState::Draining)?;
                if timelines.iter().any(|t| t.switched_at.is_some()) {
                    return Err(TimelineError::InvalidTransition {
                        event_type: event_type.to_string(),
                        order,
                        from: adopted.state,
                        to: TimelineState::Draining,
                    });
                }
                adopted.switched_at = Some(now);
                Some(adopted)
            }
            None => timelines
                .iter()
                .find(|t| t.state == TimelineState::Active)
                .cloned(),
        }
        .map(|mut previous| {
            previous.state = TimelineState::Draining;
            previous.cleanup_at = Some(cleanup_time(now, record.retention));
            previous
        });

        let mut updates = Vec::with_capacity(2);
        // Demote first: the schema allows one active row at a time.
        if let Some(previous) = &previous {
            updates.push(previous.clone());
        }
        next.state = TimelineState::Active;
        next.switched_at = Some(now);
        updates.push(next.clone());

        self.repository.commit(&[], &updates).await?;
        info!(
            event_type,
            active = new_order,
            draining = previous.as_ref().map(|p| p.order),
            adopted = adopted.is_some(),
            "Active timeline switched"
        );
        self.notify();
        Ok((next, previous))
    }

    /// Move a superseded timeline to `Draining`, recording its sealed end.
    ///
    /// Re-sealing an already sealed timeline keeps the first recorded end.
    pub async fn mark_draining(
        &self,
        guard: &LockGuard,
        event_type: &str,
        order: TimelineOrder,
        sealed_end: Vec<Offset>,
    ) -> Result<Timeline> {
        self.check_guard(guard, event_type).await?;
        let record = self.event_type(event_type).await?;
        let mut timeline = self.record(event_type, order).await?;

        match timeline.state {
            TimelineState::Draining if timeline.is_sealed() => return Ok(timeline),
            TimelineState::Draining | TimelineState::New => {}
            from => {
                return Err(TimelineError::InvalidTransition {
                    event_type: event_type.to_string(),
                    order,
                    from,
                    to: TimelineState::Draining,
                })
            }
        }

        if timeline.cleanup_at.is_none() {
            timeline.cleanup_at = Some(cleanup_time(Utc::now(), record.retention));
        }
        timeline.state = TimelineState::Draining;
        timeline.sealed_end = Some(sealed_end);
        self.repository
            .commit(&[], std::slice::from_ref(&timeline))
            .await?;
        debug!(event_type, order, sealed_end = ?timeline.sealed_end, "Timeline sealed");
        self.notify();
        Ok(timeline)
    }

    /// Retire a timeline. The active timeline cannot be deleted.
    pub async fn mark_deleted(
        &self,
        guard: &LockGuard,
        event_type: &str,
        order: TimelineOrder,
    ) -> Result<Timeline> {
        self.check_guard(guard, event_type).await?;
        let mut timeline = self.record(event_type, order).await?;

        match timeline.state {
            TimelineState::Deleted => return Ok(timeline),
            TimelineState::Active => {
                return Err(TimelineError::CannotDeleteActiveTimeline {
                    event_type: event_type.to_string(),
                })
            }
            TimelineState::New | TimelineState::Draining => {}
        }

        timeline.state = TimelineState::Deleted;
        self.repository
            .commit(&[], std::slice::from_ref(&timeline))
            .await?;
        info!(event_type, order, "Timeline deleted");
        self.notify();
        Ok(timeline)
    }
}

fn cleanup_time(drained_at: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|delta| drained_at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
