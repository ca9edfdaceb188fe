//! In-memory physical logs.
//!
//! Each partition keeps its retained records in a `VecDeque` plus a watch
//! channel carrying the partition's exclusive end, so readers waiting for
//! new data are woken by publishes instead of polling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::debug;

use super::{LogRecord, Result, StorageError};
use crate::cursor::{Offset, Partition};

struct PartitionData {
    /// Offset of `records[0]`; the earliest retained offset.
    base: Offset,
    records: VecDeque<Bytes>,
}

impl PartitionData {
    fn end(&self) -> Offset {
        self.base + self.records.len() as Offset
    }
}

struct MemoryPartition {
    data: Mutex<PartitionData>,
    end: watch::Sender<Offset>,
}

struct MemoryLog {
    partitions: Vec<MemoryPartition>,
}

/// Process-local storage backend.
///
/// Also used as the test double for storage failures: `fail_next` makes the
/// following calls report the backend as unavailable.
pub struct MemoryStorage {
    id: String,
    logs: RwLock<HashMap<String, Arc<MemoryLog>>>,
    fail_next: AtomicUsize,
    fail_on_create: AtomicBool,
}

impl MemoryStorage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            logs: RwLock::new(HashMap::new()),
            fail_next: AtomicUsize::new(0),
            fail_on_create: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Report the next `count` calls as unavailable.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make `create_log` fail permanently until reset.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.fail_on_create.store(fail, Ordering::SeqCst);
    }

    /// Whether a physical log exists.
    pub async fn log_exists(&self, log_id: &str) -> bool {
        self.logs.read().await.contains_key(log_id)
    }

    fn injected_failure(&self) -> Result<()> {
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::Unavailable(format!(
                "injected failure on storage {}",
                self.id
            )));
        }
        Ok(())
    }

    async fn log(&self, log_id: &str) -> Result<Arc<MemoryLog>> {
        self.logs
            .read()
            .await
            .get(log_id)
            .cloned()
            .ok_or_else(|| StorageError::LogNotFound {
                log_id: log_id.to_string(),
            })
    }

    pub async fn create_log(&self, log_id: &str, partitions: u32) -> Result<()> {
        self.injected_failure()?;
        if self.fail_on_create.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!(
                "storage {} rejected creation of {}",
                self.id, log_id
            )));
        }

        let mut logs = self.logs.write().await;
        if logs.contains_key(log_id) {
            return Err(StorageError::LogExists {
                log_id: log_id.to_string(),
            });
        }
        let partitions = (0..partitions)
            .map(|_| MemoryPartition {
                data: Mutex::new(PartitionData {
                    base: 0,
                    records: VecDeque::new(),
                }),
                end: watch::channel(0).0,
            })
            .collect();
        logs.insert(log_id.to_string(), Arc::new(MemoryLog { partitions }));
        debug!(storage = %self.id, log_id, "Created memory log");
        Ok(())
    }

    pub async fn delete_log(&self, log_id: &str) -> Result<()> {
        self.injected_failure()?;
        self.logs
            .write()
            .await
            .remove(log_id)
            .map(|_| debug!(storage = %self.id, log_id, "Deleted memory log"))
            .ok_or_else(|| StorageError::LogNotFound {
                log_id: log_id.to_string(),
            })
    }

    pub async fn partitions(&self, log_id: &str) -> Result<u32> {
        self.injected_failure()?;
        Ok(self.log(log_id).await?.partitions.len() as u32)
    }

    pub async fn publish(&self, log_id: &str, partition: Partition, payload: Bytes) -> Result<Offset> {
        self.injected_failure()?;
        let log = self.log(log_id).await?;
        let part = partition_of(&log, log_id, partition)?;

        let mut data = part.data.lock().await;
        let offset = data.end();
        data.records.push_back(payload);
        part.end.send_replace(data.end());
        Ok(offset)
    }

    pub async fn fetch(
        &self,
        log_id: &str,
        partition: Partition,
        after: Option<Offset>,
        max: usize,
    ) -> Result<Vec<LogRecord>> {
        self.injected_failure()?;
        let log = self.log(log_id).await?;
        let part = partition_of(&log, log_id, partition)?;

        let data = part.data.lock().await;
        let start = after.map(|o| o + 1).unwrap_or(data.base);
        if start < data.base {
            return Err(StorageError::OffsetOutOfRange {
                log_id: log_id.to_string(),
                partition,
                requested: start,
                earliest: data.base,
            });
        }

        let skip = (start - data.base) as usize;
        Ok(data
            .records
            .iter()
            .enumerate()
            .skip(skip)
            .take(max)
            .map(|(i, payload)| LogRecord {
                offset: data.base + i as Offset,
                payload: payload.clone(),
            })
            .collect())
    }

    pub async fn earliest_offset(&self, log_id: &str, partition: Partition) -> Result<Offset> {
        let log = self.log_checked(log_id).await?;
        let part = partition_of(&log, log_id, partition)?;
        let base = part.data.lock().await.base;
        Ok(base)
    }

    pub async fn latest_offset(&self, log_id: &str, partition: Partition) -> Result<Offset> {
        let log = self.log_checked(log_id).await?;
        let part = partition_of(&log, log_id, partition)?;
        let end = *part.end.borrow();
        Ok(end)
    }

    pub async fn truncate(&self, log_id: &str, partition: Partition, before: Offset) -> Result<()> {
        let log = self.log_checked(log_id).await?;
        let part = partition_of(&log, log_id, partition)?;

        let mut data = part.data.lock().await;
        while data.base < before && !data.records.is_empty() {
            data.records.pop_front();
            data.base += 1;
        }
        debug!(storage = %self.id, log_id, partition, earliest = data.base, "Truncated memory log");
        Ok(())
    }

    pub async fn wait_for_data(
        &self,
        log_id: &str,
        partition: Partition,
        after: Option<Offset>,
        timeout: Duration,
    ) -> Result<bool> {
        let log = self.log(log_id).await?;
        let part = partition_of(&log, log_id, partition)?;
        let needed = match after {
            Some(offset) => offset + 1,
            None => part.data.lock().await.base,
        };

        let mut receiver = part.end.subscribe();
        drop(log);
        let ready = match tokio::time::timeout(timeout, receiver.wait_for(|end| *end > needed)).await {
            Ok(Ok(_)) => true,
            // Sender gone: the log was deleted; let the next fetch report it.
            Ok(Err(_)) => true,
            Err(_) => false,
        };
        Ok(ready)
    }

    async fn log_checked(&self, log_id: &str) -> Result<Arc<MemoryLog>> {
        self.injected_failure()?;
        self.log(log_id).await
    }
}

fn partition_of<'a>(
    log: &'a MemoryLog,
    log_id: &str,
    partition: Partition,
) -> Result<&'a MemoryPartition> {
    log.partitions
        .get(partition as usize)
        .ok_or_else(|| StorageError::PartitionNotFound {
            log_id: log_id.to_string(),
            partition,
        })
}
