use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::cursor::{self, Cursor, Position};
use crate::lock::{timeline_lock_key, DistributedLock, MemoryLockService};
use crate::publisher::PublishGates;
use crate::storage::{MemoryStorage, Storage, StorageError, StorageRegistry};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

struct Fixture {
    storages: Arc<StorageRegistry>,
    registry: Arc<TimelineRegistry>,
    locks: Arc<MemoryLockService>,
    lock: DistributedLock,
    tracker: Arc<CheckpointTracker>,
    coordinator: Arc<SwitchCoordinator>,
}

async fn fixture() -> Fixture {
    let storages = Arc::new(StorageRegistry::new(Storage::Memory(MemoryStorage::new(
        "default",
    ))));
    storages
        .register(Storage::Memory(MemoryStorage::new("spare")))
        .await
        .unwrap();
    let registry = Arc::new(TimelineRegistry::new(
        Arc::new(MemoryTimelineRepository::new()),
        storages.clone(),
    ));
    let locks = Arc::new(MemoryLockService::new());
    let lock = DistributedLock::new(locks.clone(), Duration::from_millis(200), Duration::from_secs(5));
    let tracker = Arc::new(CheckpointTracker::new());
    let coordinator = Arc::new(SwitchCoordinator::new(
        registry.clone(),
        lock.clone(),
        Arc::new(PublishGates::new()),
        tracker.clone(),
    ));
    Fixture {
        storages,
        registry,
        locks,
        lock,
        tracker,
        coordinator,
    }
}

async fn log_exists(storages: &StorageRegistry, storage_id: &str, log_id: &str) -> bool {
    match &*storages.get(storage_id).await.unwrap() {
        Storage::Memory(storage) => storage.log_exists(log_id).await,
        #[allow(unreachable_patterns)]
        other => panic!("expected memory storage, got {:?}", other.storage_type()),
    }
}

async fn publish(fx: &Fixture, timeline: &Timeline, partition: u32, count: usize) {
    let storage = fx.registry.storage_for(timeline).await.unwrap();
    for _ in 0..count {
        storage
            .publish(&timeline.physical_log_id, partition, Bytes::from_static(b"e"))
            .await
            .unwrap();
    }
}

// ============================================================================
// Records
// ============================================================================

#[test]
fn test_state_round_trips_through_text() {
    for state in [
        TimelineState::New,
        TimelineState::Active,
        TimelineState::Draining,
        TimelineState::Deleted,
    ] {
        assert_eq!(TimelineState::parse(state.as_str()), Some(state));
    }
    assert_eq!(TimelineState::parse("ACTIVE"), None);
    assert!(TimelineState::Draining.is_live());
    assert!(!TimelineState::New.is_live());
}

#[test]
fn test_sealed_end_per_partition() {
    let mut timeline = Timeline::new("orders", 1, "default", "log-1");
    assert_eq!(timeline.end_of(0), None);

    timeline.sealed_end = Some(vec![3, 0]);
    assert!(timeline.is_sealed());
    assert_eq!(timeline.end_of(0), Some(3));
    assert_eq!(timeline.end_of(1), Some(0));
    assert_eq!(timeline.end_of(2), None);
}

#[test]
fn test_shares_log_requires_same_storage() {
    let a = Timeline::new("orders", 1, "default", "log-1");
    let b = Timeline::new("orders", 2, "default", "log-1");
    let c = Timeline::new("orders", 3, "spare", "log-1");
    assert!(a.shares_log_with(&b));
    assert!(!a.shares_log_with(&c));
}

#[test]
fn test_retryable_errors() {
    assert!(TimelineError::LockTimeout {
        event_type: "orders".to_string(),
        waited: Duration::from_secs(1),
    }
    .is_retryable());
    assert!(TimelineError::Storage(StorageError::Unavailable("down".to_string())).is_retryable());
    assert!(!TimelineError::NoActiveTimeline {
        event_type: "orders".to_string(),
    }
    .is_retryable());
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_register_event_type_creates_base_log() {
    let fx = fixture().await;
    let record = fx
        .registry
        .register_event_type("orders", 3, None, DAY)
        .await
        .unwrap();

    assert_eq!(record.storage_id, "default");
    assert!(log_exists(&fx.storages, "default", &record.base_log_id).await);

    let timelines = fx.registry.list_timelines("orders").await.unwrap();
    assert_eq!(timelines.len(), 1);
    assert!(timelines[0].is_legacy());
    assert_eq!(timelines[0].state, TimelineState::Active);
    assert_eq!(timelines[0].physical_log_id, record.base_log_id);
}

#[tokio::test]
async fn test_register_duplicate_event_type() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    let result = fx.registry.register_event_type("orders", 1, None, DAY).await;
    assert!(matches!(result, Err(TimelineError::EventTypeExists { .. })));
}

#[tokio::test]
async fn test_register_on_unknown_storage() {
    let fx = fixture().await;
    let result = fx
        .registry
        .register_event_type("orders", 1, Some("missing"), DAY)
        .await;
    assert!(matches!(
        result,
        Err(TimelineError::Storage(StorageError::StorageNotFound { .. }))
    ));
    assert!(fx.registry.list_event_types().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_event_type() {
    let fx = fixture().await;
    let result = fx.registry.active_timeline("missing").await;
    assert!(matches!(result, Err(TimelineError::EventTypeNotFound { .. })));
}

#[tokio::test]
async fn test_mutation_requires_matching_lock() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();

    let wrong = fx.lock.acquire(&timeline_lock_key("payments")).await.unwrap();
    let result = fx
        .registry
        .create_timeline(&wrong, "orders", "default", "log-x")
        .await;
    assert!(matches!(result, Err(TimelineError::LockNotHeld { .. })));
}

#[tokio::test]
async fn test_mutation_rejected_after_lease_lost() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();

    let key = timeline_lock_key("orders");
    let guard = fx.lock.acquire(&key).await.unwrap();
    fx.locks.expire(&key).await;

    let result = fx
        .registry
        .create_timeline(&guard, "orders", "default", "log-x")
        .await;
    assert!(matches!(result, Err(TimelineError::LockNotHeld { .. })));
    assert!(fx.registry.timeline_records("orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_switch_active_demotes_previous() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    let guard = fx.lock.acquire(&timeline_lock_key("orders")).await.unwrap();

    let first = fx
        .registry
        .create_timeline(&guard, "orders", "default", "log-1")
        .await
        .unwrap();
    assert_eq!(first.order, 1);
    assert_eq!(first.state, TimelineState::New);
    let (active, previous) = fx
        .registry
        .switch_active(&guard, "orders", first.order)
        .await
        .unwrap();
    assert_eq!(active.state, TimelineState::Active);
    assert!(active.switched_at.is_some());
    assert!(previous.is_none());

    let second = fx
        .registry
        .create_timeline(&guard, "orders", "spare", "log-2")
        .await
        .unwrap();
    let (active, previous) = fx
        .registry
        .switch_active(&guard, "orders", second.order)
        .await
        .unwrap();
    assert_eq!(active.order, 2);
    let previous = previous.unwrap();
    assert_eq!(previous.order, 1);
    assert_eq!(previous.state, TimelineState::Draining);
    assert!(previous.cleanup_at.unwrap() > previous.switched_at.unwrap());
    assert!(!previous.is_sealed());

    // Only a new timeline may become active.
    let result = fx.registry.switch_active(&guard, "orders", 1).await;
    assert!(matches!(result, Err(TimelineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn test_mark_draining_keeps_first_seal() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 2, None, DAY)
        .await
        .unwrap();
    let guard = fx.lock.acquire(&timeline_lock_key("orders")).await.unwrap();
    fx.registry
        .create_timeline(&guard, "orders", "default", "log-1")
        .await
        .unwrap();
    fx.registry.switch_active(&guard, "orders", 1).await.unwrap();

    // Active timelines are sealed only after being superseded.
    let result = fx
        .registry
        .mark_draining(&guard, "orders", 1, vec![1, 1])
        .await;
    assert!(matches!(result, Err(TimelineError::InvalidTransition { .. })));

    fx.registry
        .create_timeline(&guard, "orders", "default", "log-2")
        .await
        .unwrap();
    fx.registry.switch_active(&guard, "orders", 2).await.unwrap();

    let sealed = fx
        .registry
        .mark_draining(&guard, "orders", 1, vec![4, 2])
        .await
        .unwrap();
    assert_eq!(sealed.sealed_end, Some(vec![4, 2]));

    let again = fx
        .registry
        .mark_draining(&guard, "orders", 1, vec![9, 9])
        .await
        .unwrap();
    assert_eq!(again.sealed_end, Some(vec![4, 2]));
}

#[tokio::test]
async fn test_mark_deleted_rejects_active() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    let guard = fx.lock.acquire(&timeline_lock_key("orders")).await.unwrap();
    fx.registry
        .create_timeline(&guard, "orders", "default", "log-1")
        .await
        .unwrap();
    fx.registry.switch_active(&guard, "orders", 1).await.unwrap();

    let result = fx.registry.mark_deleted(&guard, "orders", 1).await;
    assert!(matches!(
        result,
        Err(TimelineError::CannotDeleteActiveTimeline { .. })
    ));
}

#[tokio::test]
async fn test_orders_exhausted() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    let mut last = Timeline::new("orders", cursor::MAX_ORDER, "default", "log-last");
    last.state = TimelineState::Deleted;
    fx.registry
        .repository()
        .commit(&[last], &[])
        .await
        .unwrap();

    let guard = fx.lock.acquire(&timeline_lock_key("orders")).await.unwrap();
    let result = fx
        .registry
        .create_timeline(&guard, "orders", "default", "log-x")
        .await;
    assert!(matches!(result, Err(TimelineError::TooManyTimelines { .. })));
}

#[tokio::test]
async fn test_resolve_position_bounds() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    let legacy = fx.registry.active_timeline("orders").await.unwrap();
    publish(&fx, &legacy, 0, 5).await;
    let storage = fx.registry.storage_for(&legacy).await.unwrap();
    storage.truncate(&legacy.physical_log_id, 0, 2).await.unwrap();

    let at = |offset| Position {
        order: 0,
        partition: 0,
        offset,
    };
    // Last consumed event just before the earliest retained one.
    assert!(fx.registry.resolve_position("orders", &at(1)).await.is_ok());
    assert!(fx.registry.resolve_position("orders", &at(4)).await.is_ok());
    assert!(matches!(
        fx.registry.resolve_position("orders", &at(0)).await,
        Err(TimelineError::PositionNotCovered { .. })
    ));
    assert!(matches!(
        fx.registry.resolve_position("orders", &at(5)).await,
        Err(TimelineError::PositionNotCovered { .. })
    ));
}

// ============================================================================
// Coordinator
// ============================================================================

#[tokio::test]
async fn test_first_switch_on_same_storage_adopts_base_log() {
    let fx = fixture().await;
    let record = fx
        .registry
        .register_event_type("orders", 2, None, DAY)
        .await
        .unwrap();

    let timeline = fx
        .coordinator
        .switch_timeline("orders", "default")
        .await
        .unwrap();
    assert_eq!(timeline.order, 1);
    assert_eq!(timeline.physical_log_id, record.base_log_id);

    let timelines = fx.registry.list_timelines("orders").await.unwrap();
    assert_eq!(timelines.len(), 1);
    assert_eq!(timelines[0].state, TimelineState::Active);

    // Legacy positions now resolve to the adopting timeline.
    let resolved = fx
        .registry
        .resolve_timeline_for_order("orders", 0)
        .await
        .unwrap();
    assert_eq!(resolved.order, 1);
}

#[tokio::test]
async fn test_switch_seals_previous_timeline() {
    let fx = fixture().await;
    let record = fx
        .registry
        .register_event_type("orders", 2, None, DAY)
        .await
        .unwrap();
    let legacy = fx.registry.active_timeline("orders").await.unwrap();
    publish(&fx, &legacy, 0, 3).await;
    publish(&fx, &legacy, 1, 1).await;

    let active = fx
        .coordinator
        .switch_timeline("orders", "spare")
        .await
        .unwrap();
    assert_eq!(active.order, 2);
    assert_eq!(active.storage_id, "spare");
    assert_ne!(active.physical_log_id, record.base_log_id);
    assert!(log_exists(&fx.storages, "spare", &active.physical_log_id).await);

    let timelines = fx.registry.list_timelines("orders").await.unwrap();
    assert_eq!(timelines.len(), 2);
    assert_eq!(timelines[0].order, 1);
    assert_eq!(timelines[0].state, TimelineState::Draining);
    assert_eq!(timelines[0].sealed_end, Some(vec![3, 1]));
    assert_eq!(timelines[1].state, TimelineState::Active);
}

#[tokio::test]
async fn test_switch_to_unknown_storage() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    let result = fx.coordinator.switch_timeline("orders", "missing").await;
    assert!(matches!(
        result,
        Err(TimelineError::Storage(StorageError::StorageNotFound { .. }))
    ));
    assert!(fx.registry.list_timelines("orders").await.unwrap()[0].is_legacy());
}

#[tokio::test]
async fn test_switch_times_out_on_held_lock() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    let _held = fx.lock.acquire(&timeline_lock_key("orders")).await.unwrap();

    let result = fx.coordinator.switch_timeline("orders", "default").await;
    match result {
        Err(e @ TimelineError::LockTimeout { .. }) => assert!(e.is_retryable()),
        other => panic!("expected lock timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_log_creation_leaves_timelines_untouched() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    fx.coordinator
        .switch_timeline("orders", "default")
        .await
        .unwrap();

    match &*fx.storages.get("spare").await.unwrap() {
        Storage::Memory(storage) => storage.set_fail_on_create(true),
        #[allow(unreachable_patterns)]
        _ => unreachable!(),
    }
    let result = fx.coordinator.switch_timeline("orders", "spare").await;
    assert!(matches!(result, Err(TimelineError::Storage(_))));

    let timelines = fx.registry.list_timelines("orders").await.unwrap();
    assert_eq!(timelines.len(), 1);
    assert_eq!(timelines[0].order, 1);
    assert_eq!(timelines[0].state, TimelineState::Active);
}

#[tokio::test]
async fn test_failed_first_switch_to_other_storage_stays_legacy() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    let legacy = fx.registry.active_timeline("orders").await.unwrap();
    publish(&fx, &legacy, 0, 2).await;

    let spare = fx.storages.get("spare").await.unwrap();
    let Storage::Memory(spare_memory) = &*spare else {
        unreachable!()
    };
    spare_memory.set_fail_on_create(true);
    let result = fx.coordinator.switch_timeline("orders", "spare").await;
    assert!(matches!(result, Err(TimelineError::Storage(_))));

    let timelines = fx.registry.list_timelines("orders").await.unwrap();
    assert_eq!(timelines.len(), 1);
    assert!(timelines[0].is_legacy());
    assert_eq!(timelines[0].state, TimelineState::Active);
    assert!(fx.registry.timeline_records("orders").await.unwrap().is_empty());

    // Once the backend recovers, the same switch goes through.
    spare_memory.set_fail_on_create(false);
    let active = fx
        .coordinator
        .switch_timeline("orders", "spare")
        .await
        .unwrap();
    assert_eq!(active.order, 2);

    let timelines = fx.registry.list_timelines("orders").await.unwrap();
    assert_eq!(timelines.len(), 2);
    assert_eq!(timelines[0].order, 1);
    assert_eq!(timelines[0].physical_log_id, legacy.physical_log_id);
    assert_eq!(timelines[0].state, TimelineState::Draining);
    assert_eq!(timelines[0].sealed_end, Some(vec![2]));
    assert_eq!(timelines[1].state, TimelineState::Active);
}

#[tokio::test]
async fn test_switch_from_legacy_rejected_once_switched() {
    let fx = fixture().await;
    let record = fx
        .registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    fx.coordinator
        .switch_timeline("orders", "default")
        .await
        .unwrap();

    let guard = fx.lock.acquire(&timeline_lock_key("orders")).await.unwrap();
    let adopted = fx
        .registry
        .create_timeline(&guard, "orders", "default", &record.base_log_id)
        .await
        .unwrap();
    let fresh = fx
        .registry
        .create_timeline(&guard, "orders", "spare", "spare-log")
        .await
        .unwrap();
    let result = fx
        .registry
        .switch_from_legacy(&guard, "orders", adopted.order, fresh.order)
        .await;
    assert!(matches!(result, Err(TimelineError::InvalidTransition { .. })));
    guard.release().await.unwrap();

    assert_eq!(fx.registry.active_timeline("orders").await.unwrap().order, 1);
}

#[tokio::test]
async fn test_repair_discards_stray_new_timeline() {
    let fx = fixture().await;
    let record = fx
        .registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();

    // An interrupted adoption leaves a new timeline on the base log.
    let guard = fx.lock.acquire(&timeline_lock_key("orders")).await.unwrap();
    fx.registry
        .create_timeline(&guard, "orders", "default", &record.base_log_id)
        .await
        .unwrap();
    guard.release().await.unwrap();

    let active = fx
        .coordinator
        .switch_timeline("orders", "default")
        .await
        .unwrap();
    assert_eq!(active.order, 2);
    assert_eq!(active.physical_log_id, record.base_log_id);
    assert!(log_exists(&fx.storages, "default", &record.base_log_id).await);

    let records = fx.registry.timeline_records("orders").await.unwrap();
    assert_eq!(records[0].state, TimelineState::Deleted);
    assert_eq!(records[1].state, TimelineState::Active);
}

#[tokio::test]
async fn test_repair_seals_unsealed_draining_timeline() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    let legacy = fx.registry.active_timeline("orders").await.unwrap();
    publish(&fx, &legacy, 0, 2).await;

    // A switch that died between the flip and the seal.
    let guard = fx.lock.acquire(&timeline_lock_key("orders")).await.unwrap();
    fx.registry
        .create_timeline(&guard, "orders", "default", &legacy.physical_log_id)
        .await
        .unwrap();
    fx.registry.switch_active(&guard, "orders", 1).await.unwrap();
    fx.storages
        .get("spare")
        .await
        .unwrap()
        .create_log("log-2", 1)
        .await
        .unwrap();
    fx.registry
        .create_timeline(&guard, "orders", "spare", "log-2")
        .await
        .unwrap();
    fx.registry.switch_active(&guard, "orders", 2).await.unwrap();
    guard.release().await.unwrap();
    assert!(!fx.registry.list_timelines("orders").await.unwrap()[0].is_sealed());

    fx.coordinator
        .switch_timeline("orders", "default")
        .await
        .unwrap();
    let timelines = fx.registry.list_timelines("orders").await.unwrap();
    assert_eq!(timelines[0].sealed_end, Some(vec![2]));
    assert_eq!(timelines[1].sealed_end, Some(vec![0]));
    assert_eq!(timelines[2].state, TimelineState::Active);
}

#[tokio::test]
async fn test_delete_only_timeline_rejected() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();

    let result = fx.coordinator.delete_timeline("orders").await;
    assert!(matches!(
        result,
        Err(TimelineError::CannotDeleteActiveTimeline { .. })
    ));

    fx.coordinator
        .switch_timeline("orders", "default")
        .await
        .unwrap();
    let result = fx.coordinator.delete_timeline("orders").await;
    assert!(matches!(
        result,
        Err(TimelineError::CannotDeleteActiveTimeline { .. })
    ));
}

#[tokio::test]
async fn test_delete_oldest_drops_its_log() {
    let fx = fixture().await;
    let record = fx
        .registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    fx.coordinator
        .switch_timeline("orders", "spare")
        .await
        .unwrap();

    let deleted = fx.coordinator.delete_timeline("orders").await.unwrap();
    assert_eq!(deleted.order, 1);
    assert_eq!(deleted.state, TimelineState::Deleted);
    assert!(!log_exists(&fx.storages, "default", &record.base_log_id).await);

    let timelines = fx.registry.list_timelines("orders").await.unwrap();
    assert_eq!(timelines.len(), 1);
    assert_eq!(timelines[0].order, 2);

    // Deleted orders are never reused.
    let next = fx
        .coordinator
        .switch_timeline("orders", "default")
        .await
        .unwrap();
    assert_eq!(next.order, 3);
}

#[tokio::test]
async fn test_retire_drained_after_retention() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, Duration::ZERO)
        .await
        .unwrap();
    fx.coordinator
        .switch_timeline("orders", "spare")
        .await
        .unwrap();

    let retired = fx.coordinator.retire_drained("orders").await.unwrap();
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].order, 1);
    assert_eq!(fx.registry.list_timelines("orders").await.unwrap().len(), 1);

    // Nothing left to retire: the active timeline stays.
    assert!(fx.coordinator.retire_drained("orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retire_keeps_timelines_within_retention() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, DAY)
        .await
        .unwrap();
    fx.coordinator
        .switch_timeline("orders", "spare")
        .await
        .unwrap();

    assert!(fx.coordinator.retire_drained("orders").await.unwrap().is_empty());
    assert_eq!(fx.registry.list_timelines("orders").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_retire_respects_consumer_checkpoints() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, Duration::ZERO)
        .await
        .unwrap();
    fx.coordinator
        .switch_timeline("orders", "spare")
        .await
        .unwrap();

    fx.tracker
        .commit("orders", "billing", &[cursor::encode(0, 0, 0)])
        .await
        .unwrap();
    assert!(fx.coordinator.retire_drained("orders").await.unwrap().is_empty());

    fx.tracker
        .commit("orders", "billing", &[cursor::encode(2, 0, 0)])
        .await
        .unwrap();
    assert_eq!(fx.coordinator.retire_drained("orders").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_retirement_task_runs_periodically() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, None, Duration::ZERO)
        .await
        .unwrap();
    fx.coordinator
        .switch_timeline("orders", "spare")
        .await
        .unwrap();

    let handle = spawn_retirement_task(fx.coordinator.clone(), Duration::from_millis(20));
    let mut retired = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if fx.registry.list_timelines("orders").await.unwrap().len() == 1 {
            retired = true;
            break;
        }
    }
    handle.stop();
    assert!(retired, "drained timeline was not retired");
}

// ============================================================================
// Checkpoints and repository
// ============================================================================

#[tokio::test]
async fn test_checkpoint_references() {
    let tracker = CheckpointTracker::new();
    let first = Timeline::new("orders", 1, "default", "log-1");
    let third = Timeline::new("orders", 3, "default", "log-3");

    assert!(!tracker.is_referenced(&first).await);

    tracker
        .commit("orders", "a", &[cursor::encode(2, 0, 10)])
        .await
        .unwrap();
    assert!(!tracker.is_referenced(&first).await);
    assert!(tracker.is_referenced(&third).await);

    tracker.commit("orders", "b", &[Cursor::begin(0)]).await.unwrap();
    assert!(tracker.is_referenced(&first).await);

    assert!(tracker.remove("orders", "b").await);
    assert!(!tracker.remove("orders", "b").await);
    assert!(!tracker.is_referenced(&first).await);

    // Other event types do not count.
    tracker.commit("payments", "c", &[Cursor::begin(0)]).await.unwrap();
    assert!(!tracker.is_referenced(&first).await);

    let invalid = tracker
        .commit("orders", "d", &[Cursor::new(0, "garbage")])
        .await;
    assert!(invalid.is_err());
}

#[tokio::test]
async fn test_memory_repository_rejects_second_active() {
    let repository = MemoryTimelineRepository::new();
    let mut first = Timeline::new("orders", 1, "default", "log-1");
    first.state = TimelineState::Active;
    let mut second = Timeline::new("orders", 2, "default", "log-2");
    second.state = TimelineState::Active;

    repository.commit(&[first], &[]).await.unwrap();
    let result = repository.commit(&[second], &[]).await;
    assert!(matches!(result, Err(TimelineError::Repository(_))));
    assert_eq!(repository.list_timelines("orders").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_memory_repository_rejects_duplicate_order() {
    let repository = MemoryTimelineRepository::new();
    repository
        .commit(&[Timeline::new("orders", 1, "default", "log-1")], &[])
        .await
        .unwrap();
    let result = repository
        .commit(&[Timeline::new("orders", 1, "default", "log-2")], &[])
        .await;
    assert!(matches!(result, Err(TimelineError::Repository(_))));
}

#[tokio::test]
async fn test_storage_in_use() {
    let fx = fixture().await;
    fx.registry
        .register_event_type("orders", 1, Some("spare"), DAY)
        .await
        .unwrap();
    let repository = fx.registry.repository();

    assert!(repository.storage_in_use("spare").await.unwrap());
    assert!(!repository.storage_in_use("default").await.unwrap());

    fx.coordinator
        .switch_timeline("orders", "default")
        .await
        .unwrap();
    assert!(repository.storage_in_use("spare").await.unwrap());
    assert!(repository.storage_in_use("default").await.unwrap());

    fx.coordinator.delete_timeline("orders").await.unwrap();
    assert!(!repository.storage_in_use("spare").await.unwrap());
}

#[tokio::test]
async fn test_storage_in_use_after_abandoned_first_switch() {
    let fx = fixture().await;
    let record = fx
        .registry
        .register_event_type("orders", 1, Some("spare"), DAY)
        .await
        .unwrap();

    // A first switch that died before the flip, then got compensated.
    let guard = fx.lock.acquire(&timeline_lock_key("orders")).await.unwrap();
    let stray = fx
        .registry
        .create_timeline(&guard, "orders", "spare", &record.base_log_id)
        .await
        .unwrap();
    fx.registry
        .mark_deleted(&guard, "orders", stray.order)
        .await
        .unwrap();
    guard.release().await.unwrap();

    let timelines = fx.registry.list_timelines("orders").await.unwrap();
    assert!(timelines[0].is_legacy());
    assert_eq!(timelines[0].storage_id, "spare");
    assert!(fx.registry.repository().storage_in_use("spare").await.unwrap());
}

#[tokio::test]
async fn test_memory_repository_applies_updates_before_inserts() {
    let repository = MemoryTimelineRepository::new();
    let mut first = Timeline::new("orders", 1, "default", "log-1");
    first.state = TimelineState::Active;
    repository.commit(&[first.clone()], &[]).await.unwrap();

    let mut second = Timeline::new("orders", 2, "spare", "log-2");
    second.state = TimelineState::Active;
    first.state = TimelineState::Draining;
    repository
        .commit(&[second], &[first.clone()])
        .await
        .unwrap();

    let timelines = repository.list_timelines("orders").await.unwrap();
    assert_eq!(timelines[0].state, TimelineState::Draining);
    assert_eq!(timelines[1].state, TimelineState::Active);
}

#[tokio::test]
async fn test_memory_repository_checks_every_step() {
    let repository = MemoryTimelineRepository::new();
    let mut first = Timeline::new("orders", 1, "default", "log-1");
    first.state = TimelineState::Active;
    let second = Timeline::new("orders", 2, "default", "log-2");
    repository
        .commit(&[first.clone(), second.clone()], &[])
        .await
        .unwrap();

    // Promoting before demoting has two active rows in between.
    let mut promoted = second.clone();
    promoted.state = TimelineState::Active;
    first.state = TimelineState::Draining;
    let result = repository.commit(&[], &[promoted, first]).await;
    assert!(matches!(result, Err(TimelineError::Repository(_))));

    let timelines = repository.list_timelines("orders").await.unwrap();
    assert_eq!(timelines[0].state, TimelineState::Active);
    assert_eq!(timelines[1].state, TimelineState::New);
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn repository() -> SqliteTimelineRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repository = SqliteTimelineRepository::new(pool);
        repository.init().await.unwrap();
        repository
    }

    fn record(name: &str) -> EventTypeRecord {
        EventTypeRecord {
            name: name.to_string(),
            partitions: 2,
            storage_id: "default".to_string(),
            base_log_id: format!("{}-base", name),
            retention: Duration::from_millis(1500),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_type_round_trip() {
        let repository = repository().await;
        repository.create_event_type(&record("orders")).await.unwrap();
        repository.create_event_type(&record("audit")).await.unwrap();

        let loaded = repository.get_event_type("orders").await.unwrap().unwrap();
        assert_eq!(loaded.partitions, 2);
        assert_eq!(loaded.base_log_id, "orders-base");
        assert_eq!(loaded.retention, Duration::from_millis(1500));
        assert!(repository.get_event_type("missing").await.unwrap().is_none());

        let names: Vec<_> = repository
            .list_event_types()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["audit", "orders"]);

        let duplicate = repository.create_event_type(&record("orders")).await;
        assert!(matches!(duplicate, Err(TimelineError::EventTypeExists { .. })));
    }

    #[tokio::test]
    async fn test_commit_and_reload_timelines() {
        let repository = repository().await;
        repository.create_event_type(&record("orders")).await.unwrap();

        let mut first = Timeline::new("orders", 1, "default", "log-1");
        first.state = TimelineState::Active;
        first.switched_at = Some(chrono::Utc::now());
        repository.commit(&[first.clone()], &[]).await.unwrap();

        let mut second = Timeline::new("orders", 2, "spare", "log-2");
        second.state = TimelineState::Active;
        first.state = TimelineState::Draining;
        first.sealed_end = Some(vec![7, 0]);
        first.cleanup_at = Some(chrono::Utc::now());
        repository
            .commit(&[second.clone()], &[first.clone()])
            .await
            .unwrap();

        let timelines = repository.list_timelines("orders").await.unwrap();
        assert_eq!(timelines.len(), 2);
        assert_eq!(timelines[0].state, TimelineState::Draining);
        assert_eq!(timelines[0].sealed_end, Some(vec![7, 0]));
        assert!(timelines[0].cleanup_at.is_some());
        assert_eq!(timelines[1].storage_id, "spare");
        assert_eq!(timelines[1].state, TimelineState::Active);
    }

    #[tokio::test]
    async fn test_commit_checks_every_step() {
        let repository = repository().await;
        repository.create_event_type(&record("orders")).await.unwrap();

        let mut first = Timeline::new("orders", 1, "default", "log-1");
        first.state = TimelineState::Active;
        let second = Timeline::new("orders", 2, "default", "log-2");
        repository
            .commit(&[first.clone(), second.clone()], &[])
            .await
            .unwrap();

        let mut promoted = second.clone();
        promoted.state = TimelineState::Active;
        first.state = TimelineState::Draining;
        let result = repository.commit(&[], &[promoted, first]).await;
        assert!(result.is_err());

        let timelines = repository.list_timelines("orders").await.unwrap();
        assert_eq!(timelines[0].state, TimelineState::Active);
        assert_eq!(timelines[1].state, TimelineState::New);
    }

    #[tokio::test]
    async fn test_storage_in_use_ignores_abandoned_timelines() {
        let repository = repository().await;
        repository.create_event_type(&record("orders")).await.unwrap();

        let mut abandoned = Timeline::new("orders", 1, "default", "orders-base");
        abandoned.state = TimelineState::Deleted;
        repository.commit(&[abandoned], &[]).await.unwrap();
        assert!(repository.storage_in_use("default").await.unwrap());

        let mut moved = Timeline::new("orders", 2, "spare", "log-2");
        moved.state = TimelineState::Active;
        moved.switched_at = Some(chrono::Utc::now());
        repository.commit(&[moved], &[]).await.unwrap();
        assert!(!repository.storage_in_use("default").await.unwrap());
        assert!(repository.storage_in_use("spare").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let repository = repository().await;
        repository.create_event_type(&record("orders")).await.unwrap();

        let mut active = Timeline::new("orders", 1, "default", "log-1");
        active.state = TimelineState::Active;
        repository.commit(&[active], &[]).await.unwrap();

        // The second active row violates the schema; the insert of order 2
        // must roll back with it.
        let fresh = Timeline::new("orders", 2, "default", "log-2");
        let mut rogue = Timeline::new("orders", 3, "default", "log-3");
        rogue.state = TimelineState::Active;
        let result = repository.commit(&[fresh, rogue], &[]).await;
        assert!(result.is_err());
        assert_eq!(repository.list_timelines("orders").await.unwrap().len(), 1);
    }
}
