use std::time::Duration;

use bytes::Bytes;

use super::*;

fn memory(id: &str) -> Storage {
    Storage::Memory(MemoryStorage::new(id))
}

#[tokio::test]
async fn test_publish_assigns_sequential_offsets() {
    let storage = memory("s1");
    storage.create_log("log-a", 2).await.unwrap();

    for expected in 0..3 {
        let offset = storage
            .publish("log-a", 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(offset, expected);
    }
    assert_eq!(storage.latest_offset("log-a", 1).await.unwrap(), 3);
    assert_eq!(storage.latest_offset("log-a", 0).await.unwrap(), 0);
    assert_eq!(storage.latest_offsets("log-a").await.unwrap(), vec![0, 3]);
}

#[tokio::test]
async fn test_fetch_after_offset() {
    let storage = memory("s1");
    storage.create_log("log-a", 1).await.unwrap();
    for payload in ["a", "b", "c", "d"] {
        storage
            .publish("log-a", 0, Bytes::from(payload))
            .await
            .unwrap();
    }

    let all = storage.fetch("log-a", 0, None, 10).await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[0].payload, Bytes::from("a"));

    let tail = storage.fetch("log-a", 0, Some(1), 1).await.unwrap();
    assert_eq!(
        tail,
        vec![LogRecord {
            offset: 2,
            payload: Bytes::from("c")
        }]
    );

    assert!(storage.fetch("log-a", 0, Some(3), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_before_earliest_is_out_of_range() {
    let storage = memory("s1");
    storage.create_log("log-a", 1).await.unwrap();
    for _ in 0..5 {
        storage.publish("log-a", 0, Bytes::new()).await.unwrap();
    }
    storage.truncate("log-a", 0, 3).await.unwrap();

    assert_eq!(storage.earliest_offset("log-a", 0).await.unwrap(), 3);
    assert_eq!(storage.latest_offset("log-a", 0).await.unwrap(), 5);

    // After offset 2 means "start at 3": still valid.
    assert_eq!(storage.fetch("log-a", 0, Some(2), 10).await.unwrap().len(), 2);

    let err = storage.fetch("log-a", 0, Some(0), 10).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::OffsetOutOfRange {
            requested: 1,
            earliest: 3,
            ..
        }
    ));
}

#[tokio::test]
async fn test_missing_log_and_partition() {
    let storage = memory("s1");
    storage.create_log("log-a", 1).await.unwrap();

    assert!(matches!(
        storage.fetch("nope", 0, None, 1).await,
        Err(StorageError::LogNotFound { .. })
    ));
    assert!(matches!(
        storage.publish("log-a", 7, Bytes::new()).await,
        Err(StorageError::PartitionNotFound { partition: 7, .. })
    ));
    assert!(matches!(
        storage.create_log("log-a", 1).await,
        Err(StorageError::LogExists { .. })
    ));

    storage.delete_log("log-a").await.unwrap();
    assert!(matches!(
        storage.partitions("log-a").await,
        Err(StorageError::LogNotFound { .. })
    ));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let backend = MemoryStorage::new("s1");
    backend.fail_next(2);
    let storage = Storage::Memory(backend);

    storage.create_log("log-a", 1).await.unwrap();
    assert_eq!(storage.partitions("log-a").await.unwrap(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_surface_unavailable() {
    let backend = MemoryStorage::new("s1");
    backend.set_fail_on_create(true);
    let storage = Storage::Memory(backend);

    let err = storage.create_log("log-a", 1).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_wait_for_data_wakes_on_publish() {
    let storage = std::sync::Arc::new(memory("s1"));
    storage.create_log("log-a", 1).await.unwrap();

    let waiter = {
        let storage = storage.clone();
        tokio::spawn(async move {
            storage
                .wait_for_data("log-a", 0, None, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    storage.publish("log-a", 0, Bytes::new()).await.unwrap();

    assert!(waiter.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_wait_for_data_times_out() {
    let storage = memory("s1");
    storage.create_log("log-a", 1).await.unwrap();
    storage.publish("log-a", 0, Bytes::new()).await.unwrap();

    let ready = storage
        .wait_for_data("log-a", 0, Some(0), Duration::from_millis(30))
        .await
        .unwrap();
    assert!(!ready);

    let ready = storage
        .wait_for_data("log-a", 0, None, Duration::from_millis(30))
        .await
        .unwrap();
    assert!(ready);
}

#[tokio::test]
async fn test_registry_register_get_remove() {
    let registry = StorageRegistry::new(memory(DEFAULT_STORAGE_ID));
    registry.register(memory("secondary")).await.unwrap();

    assert_eq!(registry.list().await, vec!["default", "secondary"]);
    assert_eq!(registry.get("secondary").await.unwrap().id(), "secondary");
    assert!(matches!(
        registry.register(memory("secondary")).await,
        Err(StorageError::DuplicatedStorage { .. })
    ));

    registry.remove("secondary").await.unwrap();
    assert!(matches!(
        registry.get("secondary").await,
        Err(StorageError::StorageNotFound { .. })
    ));
    assert!(matches!(
        registry.remove(DEFAULT_STORAGE_ID).await,
        Err(StorageError::StorageInUse { .. })
    ));
}

#[tokio::test]
async fn test_registry_from_config() {
    let config = StorageConfig {
        default: "primary".to_string(),
        backends: vec![
            StorageBackendConfig::memory("primary"),
            StorageBackendConfig::memory("archive"),
        ],
    };
    let registry = StorageRegistry::from_config(&config).await.unwrap();

    assert_eq!(registry.default_id(), "primary");
    assert_eq!(registry.list().await, vec!["archive", "primary"]);
}

#[tokio::test]
async fn test_registry_from_config_requires_default_backend() {
    let config = StorageConfig {
        default: "missing".to_string(),
        backends: vec![StorageBackendConfig::memory("primary")],
    };
    assert!(matches!(
        StorageRegistry::from_config(&config).await,
        Err(StorageError::StorageNotFound { .. })
    ));
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_only_connection_level_sqlx_errors_are_transient() {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::raw_sql("CREATE TABLE t (id INTEGER PRIMARY KEY)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO t (id) VALUES (1)")
        .execute(&pool)
        .await
        .unwrap();
    let duplicate = sqlx::query("INSERT INTO t (id) VALUES (1)")
        .execute(&pool)
        .await
        .unwrap_err();

    let constraint = StorageError::from(duplicate);
    assert!(matches!(constraint, StorageError::Backend(_)));
    assert!(!constraint.is_transient());
    assert!(!StorageError::from(sqlx::Error::RowNotFound).is_transient());

    assert!(StorageError::from(sqlx::Error::PoolTimedOut).is_transient());
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection reset");
    assert!(StorageError::from(sqlx::Error::Io(io)).is_transient());
}
