//! Per-partition streaming task.
//!
//! The reader alternates between reading and waiting. After every fetch it
//! re-resolves its timeline, because the fetch may have raced a switch:
//! - deleted timeline: move on to the next surviving one;
//! - draining but not yet sealed: the end is unknown, so drop the fetch and
//!   wait for the seal;
//! - sealed: keep only records before the sealed end, and cross to the next
//!   timeline once the sealed range is exhausted.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    CancelSignal, PartitionStart, StreamBatch, StreamBudget, StreamError, StreamMessage,
    StreamSettings,
};
use crate::cursor::{self, Cursor, Offset, Partition};
use crate::storage::{LogRecord, StorageError};
use crate::timeline::{Timeline, TimelineError, TimelineRegistry, TimelineState};
use crate::utils::retry::seal_wait_backoff;

/// Outcome of one read step.
enum Step {
    /// Records were appended or the reader moved to another timeline.
    Progress,
    /// Nothing new; wait for data.
    Idle,
    /// The timeline was superseded but is not sealed yet.
    Unsealed,
}

/// Why the read loop stopped.
enum Exit {
    Cancelled,
    Finished,
    Failed(StreamError),
}

pub(crate) struct PartitionReader {
    registry: Arc<TimelineRegistry>,
    settings: StreamSettings,
    partition: Partition,
    timeline: Timeline,
    after: Option<Offset>,
    /// Cursor of the last event handed out or pending.
    cursor: Cursor,
    pending: Vec<Bytes>,
    sender: mpsc::Sender<StreamMessage>,
    cancel: CancelSignal,
    changes: watch::Receiver<u64>,
}

impl PartitionReader {
    pub(crate) fn new(
        registry: Arc<TimelineRegistry>,
        settings: StreamSettings,
        start: PartitionStart,
        sender: mpsc::Sender<StreamMessage>,
        cancel: CancelSignal,
    ) -> Self {
        let changes = registry.subscribe();
        Self {
            registry,
            settings,
            partition: start.partition,
            timeline: start.timeline,
            after: start.after,
            cursor: start.cursor,
            pending: Vec::new(),
            sender,
            cancel,
            changes,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.read_loop().await {
            Exit::Cancelled => {
                debug!(partition = self.partition, "Partition stream cancelled");
            }
            Exit::Finished => {
                self.flush().await;
                debug!(partition = self.partition, cursor = %self.cursor.offset, "Partition stream finished");
            }
            Exit::Failed(error) => {
                self.flush().await;
                warn!(partition = self.partition, cursor = %self.cursor.offset, error = %error, "Partition stream failed");
                let _ = self
                    .sender
                    .send(StreamMessage::PartitionFailed {
                        partition: self.partition,
                        cursor: self.cursor.clone(),
                        error,
                    })
                    .await;
            }
        }
    }

    async fn read_loop(&mut self) -> Exit {
        let mut flush_at = Instant::now() + self.settings.flush_timeout;
        let mut seal_delays = seal_wait_backoff().build();

        loop {
            if self.cancel.is_cancelled() {
                return Exit::Cancelled;
            }
            if self.budget_exhausted() {
                return Exit::Finished;
            }
            let now = Instant::now();
            if self.settings.deadline.is_some_and(|deadline| now >= deadline) {
                return Exit::Finished;
            }
            if now >= flush_at {
                if !self.emit().await {
                    return Exit::Cancelled;
                }
                flush_at = Instant::now() + self.settings.flush_timeout;
                continue;
            }

            let step = match self.read().await {
                Ok(step) => step,
                Err(error) => return Exit::Failed(error),
            };

            if self.pending.len() >= self.settings.batch_limit {
                if !self.flush().await {
                    return Exit::Cancelled;
                }
                flush_at = Instant::now() + self.settings.flush_timeout;
            }

            let wait_until = match self.settings.deadline {
                Some(deadline) => flush_at.min(deadline),
                None => flush_at,
            };
            match step {
                Step::Progress => {
                    seal_delays = seal_wait_backoff().build();
                }
                Step::Idle => {
                    seal_delays = seal_wait_backoff().build();
                    if let Err(error) = self.wait_for_data(wait_until).await {
                        return Exit::Failed(error);
                    }
                }
                Step::Unsealed => {
                    let delay = seal_delays.next().unwrap_or(Duration::from_millis(200));
                    self.wait_for_change((Instant::now() + delay).min(wait_until))
                        .await;
                }
            }
        }
    }

    fn budget_exhausted(&self) -> bool {
        self.settings
            .budget
            .as_ref()
            .is_some_and(|budget| budget.is_spent())
    }

    /// Take up to `wanted` events from the shared stream budget.
    fn reserve(&self, wanted: usize) -> usize {
        match &self.settings.budget {
            Some(budget) => budget.reserve(wanted),
            None => wanted,
        }
    }

    /// One fetch from the current timeline.
    async fn read(&mut self) -> Result<Step, StreamError> {
        let wanted = self.settings.batch_limit - self.pending.len();
        let storage = self.registry.storage_for(&self.timeline).await?;

        let fetched = storage
            .fetch(&self.timeline.physical_log_id, self.partition, self.after, wanted)
            .await;
        let records = match fetched {
            Ok(records) => records,
            Err(StorageError::LogNotFound { .. }) => return self.on_log_missing().await,
            Err(StorageError::OffsetOutOfRange { .. }) => {
                return Err(StreamError::PositionNoLongerAvailable {
                    cursor: self.cursor.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let current = match self
            .registry
            .resolve_timeline_for_order(&self.settings.event_type, self.timeline.order)
            .await
        {
            Ok(current) => current,
            Err(TimelineError::TimelineNotFound { .. }) => return self.advance_past_deleted().await,
            Err(e) => return Err(e.into()),
        };
        if current.order != self.timeline.order {
            debug!(partition = self.partition, order = current.order, "Legacy timeline adopted");
        }
        self.timeline = current;

        let end = match (self.timeline.state, self.timeline.end_of(self.partition)) {
            (TimelineState::Draining, None) => return Ok(Step::Unsealed),
            (_, end) => end,
        };
        let readable: Vec<LogRecord> = match end {
            Some(end) => records.into_iter().take_while(|r| r.offset < end).collect(),
            None => records,
        };

        let granted = self.reserve(readable.len());
        let exhausted = end.is_some() && readable.len() < wanted && granted == readable.len();
        let appended = granted > 0;
        for record in readable.into_iter().take(granted) {
            self.after = Some(record.offset);
            self.cursor = cursor::encode(self.timeline.order, self.partition, record.offset);
            self.pending.push(record.payload);
        }

        if exhausted {
            return self.cross_to_next().await;
        }
        Ok(if appended { Step::Progress } else { Step::Idle })
    }

    /// The sealed range of the current timeline has been read entirely.
    async fn cross_to_next(&mut self) -> Result<Step, StreamError> {
        let next = self
            .registry
            .next_timeline(&self.settings.event_type, self.timeline.order)
            .await?;
        let Some(next) = next else {
            return Ok(Step::Idle);
        };

        if !next.shares_log_with(&self.timeline) {
            self.after = None;
        }
        debug!(
            partition = self.partition,
            from = self.timeline.order,
            to = next.order,
            "Crossing timeline boundary"
        );
        self.timeline = next;
        Ok(Step::Progress)
    }

    async fn advance_past_deleted(&mut self) -> Result<Step, StreamError> {
        let next = self
            .registry
            .next_timeline(&self.settings.event_type, self.timeline.order)
            .await?;
        match next {
            Some(next) => {
                debug!(
                    partition = self.partition,
                    deleted = self.timeline.order,
                    to = next.order,
                    "Timeline deleted while streaming, moving on"
                );
                if !next.shares_log_with(&self.timeline) {
                    self.after = None;
                }
                self.timeline = next;
                Ok(Step::Progress)
            }
            None => Err(StreamError::Timeline(TimelineError::TimelineNotFound {
                event_type: self.settings.event_type.clone(),
                order: self.timeline.order,
            })),
        }
    }

    /// A physical log vanished: fine if its timeline was deleted, fatal
    /// otherwise.
    async fn on_log_missing(&mut self) -> Result<Step, StreamError> {
        match self
            .registry
            .resolve_timeline_for_order(&self.settings.event_type, self.timeline.order)
            .await
        {
            Err(TimelineError::TimelineNotFound { .. }) => self.advance_past_deleted().await,
            Ok(_) => Err(StreamError::Storage(StorageError::LogNotFound {
                log_id: self.timeline.physical_log_id.clone(),
            })),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for new data, a registry change, the deadline or cancellation.
    async fn wait_for_data(&mut self, until: Instant) -> Result<(), StreamError> {
        let timeout = until.saturating_duration_since(Instant::now());
        if timeout.is_zero() {
            return Ok(());
        }
        let storage = self.registry.storage_for(&self.timeline).await?;
        let log_id = self.timeline.physical_log_id.clone();

        tokio::select! {
            ready = storage.wait_for_data(&log_id, self.partition, self.after, timeout) => {
                match ready {
                    // Missing logs are dealt with by the next fetch.
                    Ok(_) | Err(StorageError::LogNotFound { .. }) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            _ = self.changes.changed() => Ok(()),
            _ = self.cancel.cancelled() => Ok(()),
            _ = until_spent(self.settings.budget.clone()) => Ok(()),
        }
    }

    /// Wait for a registry change, the deadline or cancellation.
    async fn wait_for_change(&mut self, until: Instant) {
        tokio::select! {
            _ = tokio::time::sleep_until(until) => {}
            _ = self.changes.changed() => {}
            _ = self.cancel.cancelled() => {}
            _ = until_spent(self.settings.budget.clone()) => {}
        }
    }

    /// Emit pending events, if any. Returns false once the consumer is gone.
    async fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        self.emit().await
    }

    /// Emit pending events, or a keep-alive when there are none.
    async fn emit(&mut self) -> bool {
        let batch = StreamBatch {
            partition: self.partition,
            cursor: self.cursor.clone(),
            events: std::mem::take(&mut self.pending),
        };
        tokio::select! {
            sent = self.sender.send(StreamMessage::Batch(batch)) => sent.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }
}

/// Resolves once a limited stream's budget is used up; never for unlimited
/// streams.
async fn until_spent(budget: Option<Arc<StreamBudget>>) {
    match budget {
        Some(budget) => budget.exhausted().await,
        None => std::future::pending().await,
    }
}
