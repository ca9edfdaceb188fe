//! SQLite-backed physical logs.
//!
//! Publishes made by this process wake local waiters directly; writes made by
//! other processes sharing the database file are noticed by polling at the
//! configured interval.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::debug;

use super::schema::{LogPartitions, LogRecords, CREATE_LOG_TABLES};
use super::{LogRecord, Result, StorageError};
use crate::cursor::{Offset, Partition};

type WatchKey = (String, Partition);

/// SQLite implementation of a storage backend.
pub struct SqliteStorage {
    id: String,
    pool: SqlitePool,
    poll_interval: Duration,
    watchers: Mutex<HashMap<WatchKey, watch::Sender<Offset>>>,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `path`.
    pub async fn connect(id: &str, path: &str, poll_interval: Duration) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Config(format!("{}: {}", path, e)))?;
        }
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path)).await?;
        let storage = Self::new(id, pool, poll_interval);
        storage.init().await?;
        Ok(storage)
    }

    /// Wrap an existing pool. Call `init` before use.
    pub fn new(id: &str, pool: SqlitePool, poll_interval: Duration) -> Self {
        Self {
            id: id.to_string(),
            pool,
            poll_interval,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Create the log tables if they do not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_LOG_TABLES).execute(&self.pool).await?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn partition_bounds(
        conn: &mut SqliteConnection,
        log_id: &str,
        partition: Partition,
    ) -> Result<(Offset, Offset)> {
        let query = Query::select()
            .columns([LogPartitions::Earliest, LogPartitions::NextOffset])
            .from(LogPartitions::Table)
            .and_where(Expr::col(LogPartitions::LogId).eq(log_id))
            .and_where(Expr::col(LogPartitions::PartitionId).eq(partition))
            .to_string(SqliteQueryBuilder);

        match sqlx::query(&query).fetch_optional(&mut *conn).await? {
            Some(row) => {
                let earliest: i64 = row.get("earliest");
                let next: i64 = row.get("next_offset");
                Ok((earliest as Offset, next as Offset))
            }
            None => Err(Self::missing(conn, log_id, partition).await),
        }
    }

    /// Distinguish a missing log from a missing partition.
    async fn missing(conn: &mut SqliteConnection, log_id: &str, partition: Partition) -> StorageError {
        let query = Query::select()
            .expr(Expr::col(LogPartitions::PartitionId).count())
            .from(LogPartitions::Table)
            .and_where(Expr::col(LogPartitions::LogId).eq(log_id))
            .to_string(SqliteQueryBuilder);

        match sqlx::query(&query).fetch_one(&mut *conn).await {
            Ok(row) if row.get::<i64, _>(0) > 0 => StorageError::PartitionNotFound {
                log_id: log_id.to_string(),
                partition,
            },
            Ok(_) => StorageError::LogNotFound {
                log_id: log_id.to_string(),
            },
            Err(e) => e.into(),
        }
    }

    async fn bounds(&self, log_id: &str, partition: Partition) -> Result<(Offset, Offset)> {
        let mut conn = self.pool.acquire().await?;
        Self::partition_bounds(&mut conn, log_id, partition).await
    }

    async fn notify(&self, log_id: &str, partition: Partition, end: Offset) {
        let watchers = self.watchers.lock().await;
        if let Some(sender) = watchers.get(&(log_id.to_string(), partition)) {
            sender.send_replace(end);
        }
    }

    async fn subscribe(&self, log_id: &str, partition: Partition) -> watch::Receiver<Offset> {
        let mut watchers = self.watchers.lock().await;
        watchers
            .entry((log_id.to_string(), partition))
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    pub async fn create_log(&self, log_id: &str, partitions: u32) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = async {
            let exists = Query::select()
                .column(LogPartitions::LogId)
                .from(LogPartitions::Table)
                .and_where(Expr::col(LogPartitions::LogId).eq(log_id))
                .limit(1)
                .to_string(SqliteQueryBuilder);
            if sqlx::query(&exists).fetch_optional(&mut *conn).await?.is_some() {
                return Err(StorageError::LogExists {
                    log_id: log_id.to_string(),
                });
            }

            for partition in 0..partitions {
                let insert = Query::insert()
                    .into_table(LogPartitions::Table)
                    .columns([
                        LogPartitions::LogId,
                        LogPartitions::PartitionId,
                        LogPartitions::Earliest,
                        LogPartitions::NextOffset,
                    ])
                    .values_panic([log_id.into(), partition.into(), 0i64.into(), 0i64.into()])
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&insert).execute(&mut *conn).await?;
            }
            Ok(())
        }
        .await;

        finish(&mut conn, result).await?;
        debug!(storage = %self.id, log_id, partitions, "Created SQLite log");
        Ok(())
    }

    pub async fn delete_log(&self, log_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = async {
            let delete_records = Query::delete()
                .from_table(LogRecords::Table)
                .and_where(Expr::col(LogRecords::LogId).eq(log_id))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&delete_records).execute(&mut *conn).await?;

            let delete_partitions = Query::delete()
                .from_table(LogPartitions::Table)
                .and_where(Expr::col(LogPartitions::LogId).eq(log_id))
                .to_string(SqliteQueryBuilder);
            let deleted = sqlx::query(&delete_partitions)
                .execute(&mut *conn)
                .await?
                .rows_affected();
            if deleted == 0 {
                return Err(StorageError::LogNotFound {
                    log_id: log_id.to_string(),
                });
            }
            Ok(())
        }
        .await;

        finish(&mut conn, result).await?;
        self.watchers
            .lock()
            .await
            .retain(|(log, _), _| log != log_id);
        debug!(storage = %self.id, log_id, "Deleted SQLite log");
        Ok(())
    }

    pub async fn partitions(&self, log_id: &str) -> Result<u32> {
        let query = Query::select()
            .expr(Expr::col(LogPartitions::PartitionId).count())
            .from(LogPartitions::Table)
            .and_where(Expr::col(LogPartitions::LogId).eq(log_id))
            .to_string(SqliteQueryBuilder);

        let count: i64 = sqlx::query(&query).fetch_one(&self.pool).await?.get(0);
        if count == 0 {
            return Err(StorageError::LogNotFound {
                log_id: log_id.to_string(),
            });
        }
        Ok(count as u32)
    }

    pub async fn publish(&self, log_id: &str, partition: Partition, payload: Bytes) -> Result<Offset> {
        let mut conn = self.pool.acquire().await?;
        // BEGIN IMMEDIATE takes the write lock upfront so concurrent
        // publishers serialize instead of racing for the same offset.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = async {
            let (_, offset) = Self::partition_bounds(&mut conn, log_id, partition).await?;

            let insert = Query::insert()
                .into_table(LogRecords::Table)
                .columns([
                    LogRecords::LogId,
                    LogRecords::PartitionId,
                    LogRecords::RecordOffset,
                    LogRecords::Payload,
                    LogRecords::CreatedAt,
                ])
                .values_panic([
                    log_id.into(),
                    partition.into(),
                    (offset as i64).into(),
                    payload.to_vec().into(),
                    chrono::Utc::now().to_rfc3339().into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&insert).execute(&mut *conn).await?;

            let bump = Query::update()
                .table(LogPartitions::Table)
                .value(LogPartitions::NextOffset, (offset + 1) as i64)
                .and_where(Expr::col(LogPartitions::LogId).eq(log_id))
                .and_where(Expr::col(LogPartitions::PartitionId).eq(partition))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&bump).execute(&mut *conn).await?;
            Ok(offset)
        }
        .await;

        let offset = finish(&mut conn, result).await?;
        self.notify(log_id, partition, offset + 1).await;
        Ok(offset)
    }

    pub async fn fetch(
        &self,
        log_id: &str,
        partition: Partition,
        after: Option<Offset>,
        max: usize,
    ) -> Result<Vec<LogRecord>> {
        let (earliest, _) = self.bounds(log_id, partition).await?;
        let start = after.map(|o| o + 1).unwrap_or(earliest);
        if start < earliest {
            return Err(StorageError::OffsetOutOfRange {
                log_id: log_id.to_string(),
                partition,
                requested: start,
                earliest,
            });
        }

        let query = Query::select()
            .columns([LogRecords::RecordOffset, LogRecords::Payload])
            .from(LogRecords::Table)
            .and_where(Expr::col(LogRecords::LogId).eq(log_id))
            .and_where(Expr::col(LogRecords::PartitionId).eq(partition))
            .and_where(Expr::col(LogRecords::RecordOffset).gte(start as i64))
            .order_by(LogRecords::RecordOffset, Order::Asc)
            .limit(max as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let offset: i64 = row.get("record_offset");
                let payload: Vec<u8> = row.get("payload");
                LogRecord {
                    offset: offset as Offset,
                    payload: Bytes::from(payload),
                }
            })
            .collect())
    }

    pub async fn earliest_offset(&self, log_id: &str, partition: Partition) -> Result<Offset> {
        Ok(self.bounds(log_id, partition).await?.0)
    }

    pub async fn latest_offset(&self, log_id: &str, partition: Partition) -> Result<Offset> {
        Ok(self.bounds(log_id, partition).await?.1)
    }

    pub async fn truncate(&self, log_id: &str, partition: Partition, before: Offset) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = async {
            let (earliest, next) = Self::partition_bounds(&mut conn, log_id, partition).await?;
            let new_earliest = before.clamp(earliest, next);

            let delete = Query::delete()
                .from_table(LogRecords::Table)
                .and_where(Expr::col(LogRecords::LogId).eq(log_id))
                .and_where(Expr::col(LogRecords::PartitionId).eq(partition))
                .and_where(Expr::col(LogRecords::RecordOffset).lt(new_earliest as i64))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&delete).execute(&mut *conn).await?;

            let update = Query::update()
                .table(LogPartitions::Table)
                .value(LogPartitions::Earliest, new_earliest as i64)
                .and_where(Expr::col(LogPartitions::LogId).eq(log_id))
                .and_where(Expr::col(LogPartitions::PartitionId).eq(partition))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&update).execute(&mut *conn).await?;
            Ok(())
        }
        .await;

        finish(&mut conn, result).await
    }

    pub async fn wait_for_data(
        &self,
        log_id: &str,
        partition: Partition,
        after: Option<Offset>,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut receiver = self.subscribe(log_id, partition).await;

        loop {
            let (earliest, next) = match self.bounds(log_id, partition).await {
                Ok(bounds) => bounds,
                // Let the caller's next fetch surface the error.
                Err(_) => return Ok(true),
            };
            let needed = after.map(|o| o + 1).unwrap_or(earliest);
            if next > needed {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                changed = receiver.changed() => {
                    if changed.is_err() {
                        return Ok(true);
                    }
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e)
        }
    }
}
