//! Persistence interface for event types and timelines.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{EventTypeRecord, Result, Timeline, TimelineError, TimelineState};

/// Stores event type and timeline records.
///
/// `commit` must apply all inserts and updates or none of them, and a
/// reader in the committing process must see the result immediately.
#[async_trait]
pub trait TimelineRepository: Send + Sync {
    async fn create_event_type(&self, record: &EventTypeRecord) -> Result<()>;

    async fn get_event_type(&self, name: &str) -> Result<Option<EventTypeRecord>>;

    async fn list_event_types(&self) -> Result<Vec<EventTypeRecord>>;

    /// Every timeline of `event_type`, deleted ones included, by order.
    async fn list_timelines(&self, event_type: &str) -> Result<Vec<Timeline>>;

    /// Overwrite existing timelines and insert new ones atomically.
    ///
    /// Updates are applied in slice order before the inserts, and every
    /// single step must leave at most one active timeline per event type.
    async fn commit(&self, inserts: &[Timeline], updates: &[Timeline]) -> Result<()>;

    /// Whether a non-deleted timeline, or a never-switched event type, lives
    /// on `storage_id`. An event type is never-switched while none of its
    /// timelines has a `switched_at`.
    async fn storage_in_use(&self, storage_id: &str) -> Result<bool>;
}

#[derive(Default)]
struct Tables {
    event_types: HashMap<String, EventTypeRecord>,
    timelines: HashMap<String, Vec<Timeline>>,
}

/// In-memory repository.
#[derive(Default)]
pub struct MemoryTimelineRepository {
    tables: RwLock<Tables>,
}

impl MemoryTimelineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict(message: String) -> TimelineError {
    TimelineError::Repository(message)
}

/// Apply a commit to one event type's timelines, enforcing the uniqueness
/// constraints the SQLite schema enforces statement by statement.
fn apply(timelines: &mut Vec<Timeline>, inserts: &[&Timeline], updates: &[&Timeline]) -> Result<()> {
    for timeline in updates {
        let existing = timelines
            .iter_mut()
            .find(|t| t.id == timeline.id)
            .ok_or_else(|| conflict(format!("timeline {} does not exist", timeline.id)))?;
        *existing = (*timeline).clone();
        check_single_active(timelines)?;
    }
    for timeline in inserts {
        if timelines
            .iter()
            .any(|t| t.id == timeline.id || t.order == timeline.order)
        {
            return Err(conflict(format!(
                "timeline {} (order {}) already exists",
                timeline.id, timeline.order
            )));
        }
        timelines.push((*timeline).clone());
        check_single_active(timelines)?;
    }
    timelines.sort_by_key(|t| t.order);
    Ok(())
}

fn check_single_active(timelines: &[Timeline]) -> Result<()> {
    let active = timelines
        .iter()
        .filter(|t| t.state == TimelineState::Active)
        .count();
    if active > 1 {
        return Err(conflict("more than one active timeline".to_string()));
    }
    Ok(())
}

#[async_trait]
impl TimelineRepository for MemoryTimelineRepository {
    async fn create_event_type(&self, record: &EventTypeRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.event_types.contains_key(&record.name) {
            return Err(TimelineError::EventTypeExists {
                event_type: record.name.clone(),
            });
        }
        tables
            .event_types
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn get_event_type(&self, name: &str) -> Result<Option<EventTypeRecord>> {
        Ok(self.tables.read().await.event_types.get(name).cloned())
    }

    async fn list_event_types(&self) -> Result<Vec<EventTypeRecord>> {
        let mut records: Vec<_> = self
            .tables
            .read()
            .await
            .event_types
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn list_timelines(&self, event_type: &str) -> Result<Vec<Timeline>> {
        Ok(self
            .tables
            .read()
            .await
            .timelines
            .get(event_type)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, inserts: &[Timeline], updates: &[Timeline]) -> Result<()> {
        let mut tables = self.tables.write().await;

        // Stage every touched event type, then swap in only if all succeed.
        let mut staged: HashMap<String, Vec<Timeline>> = HashMap::new();
        let event_types = inserts.iter().chain(updates).map(|t| t.event_type.clone());
        for event_type in event_types {
            if staged.contains_key(&event_type) {
                continue;
            }
            let current = tables.timelines.get(&event_type).cloned().unwrap_or_default();
            let own_inserts: Vec<_> = inserts.iter().filter(|t| t.event_type == event_type).collect();
            let own_updates: Vec<_> = updates.iter().filter(|t| t.event_type == event_type).collect();
            let mut next = current;
            apply(&mut next, &own_inserts, &own_updates)?;
            staged.insert(event_type, next);
        }

        tables.timelines.extend(staged);
        Ok(())
    }

    async fn storage_in_use(&self, storage_id: &str) -> Result<bool> {
        let tables = self.tables.read().await;
        // A never-switched event type still lives on its base storage, even
        // with abandoned timeline rows around.
        let by_event_type = tables.event_types.values().any(|e| {
            e.storage_id == storage_id
                && tables
                    .timelines
                    .get(&e.name)
                    .map_or(true, |timelines| timelines.iter().all(|t| t.switched_at.is_none()))
        });
        let by_timeline = tables
            .timelines
            .values()
            .flatten()
            .any(|t| t.storage_id == storage_id && t.state != TimelineState::Deleted);
        Ok(by_event_type || by_timeline)
    }
}
