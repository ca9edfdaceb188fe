//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Partitions of SQLite-backed physical logs.
#[derive(Iden)]
pub enum LogPartitions {
    Table,
    #[iden = "log_id"]
    LogId,
    #[iden = "partition_id"]
    PartitionId,
    #[iden = "earliest"]
    Earliest,
    #[iden = "next_offset"]
    NextOffset,
}

/// Records of SQLite-backed physical logs.
#[derive(Iden)]
pub enum LogRecords {
    Table,
    #[iden = "log_id"]
    LogId,
    #[iden = "partition_id"]
    PartitionId,
    #[iden = "record_offset"]
    RecordOffset,
    #[iden = "payload"]
    Payload,
    #[iden = "created_at"]
    CreatedAt,
}

/// Event type metadata.
#[derive(Iden)]
pub enum EventTypes {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "partitions"]
    Partitions,
    #[iden = "storage_id"]
    StorageId,
    #[iden = "base_log_id"]
    BaseLogId,
    #[iden = "retention_ms"]
    RetentionMs,
    #[iden = "created_at"]
    CreatedAt,
}

/// Timeline records.
#[derive(Iden)]
pub enum Timelines {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "event_type"]
    EventType,
    #[iden = "timeline_order"]
    TimelineOrder,
    #[iden = "storage_id"]
    StorageId,
    #[iden = "physical_log_id"]
    PhysicalLogId,
    #[iden = "state"]
    State,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "switched_at"]
    SwitchedAt,
    #[iden = "cleanup_at"]
    CleanupAt,
    #[iden = "sealed_end"]
    SealedEnd,
}

/// Distributed lock leases.
#[derive(Iden)]
pub enum Locks {
    Table,
    #[iden = "lock_key"]
    LockKey,
    #[iden = "holder"]
    Holder,
    #[iden = "expires_at_ms"]
    ExpiresAtMs,
}

/// SQL for creating the physical log tables.
pub const CREATE_LOG_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS log_partitions (
    log_id TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    earliest INTEGER NOT NULL DEFAULT 0,
    next_offset INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (log_id, partition_id)
);

CREATE TABLE IF NOT EXISTS log_records (
    log_id TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    record_offset INTEGER NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (log_id, partition_id, record_offset)
);
"#;

/// SQL for creating the timeline metadata tables.
pub const CREATE_TIMELINE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS event_types (
    name TEXT PRIMARY KEY NOT NULL,
    partitions INTEGER NOT NULL,
    storage_id TEXT NOT NULL,
    base_log_id TEXT NOT NULL,
    retention_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS timelines (
    id TEXT PRIMARY KEY NOT NULL,
    event_type TEXT NOT NULL,
    timeline_order INTEGER NOT NULL,
    storage_id TEXT NOT NULL,
    physical_log_id TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    switched_at TEXT,
    cleanup_at TEXT,
    sealed_end TEXT,
    UNIQUE (event_type, timeline_order)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_timelines_single_active
    ON timelines(event_type) WHERE state = 'active';
"#;

/// SQL for creating the lock lease table.
pub const CREATE_LOCKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS locks (
    lock_key TEXT PRIMARY KEY NOT NULL,
    holder TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
"#;
