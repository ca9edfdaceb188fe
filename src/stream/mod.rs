//! Streaming reads across timeline boundaries.
//!
//! A stream runs one task per partition. Each task reads its partition from
//! the starting position onwards, following the event type's timelines in
//! order, and sends batches over a bounded channel shared by all partitions.
//! Starting positions are validated before any task starts, so a request
//! pointing at data that no longer exists fails without emitting anything.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cursor::{self, Cursor, CursorError, CursorPosition, Offset, Partition};
use crate::storage::StorageError;
use crate::timeline::{Timeline, TimelineError, TimelineRegistry};

mod partition;

use partition::PartitionReader;

// ============================================================================
// Errors
// ============================================================================

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors raised when starting a stream or while streaming a partition.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Event type not found: {event_type}")]
    EventTypeNotFound { event_type: String },

    #[error("Invalid cursor {cursor}: {reason}")]
    InvalidCursor { cursor: Cursor, reason: String },

    #[error("Position {cursor} is no longer available")]
    PositionNoLongerAvailable { cursor: Cursor },

    #[error("Invalid stream request: {0}")]
    InvalidRequest(String),

    #[error("Timeline error: {0}")]
    Timeline(TimelineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StreamError {
    /// Whether the request names data outside retention. Such requests are
    /// rejected outright and retrying them cannot succeed.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, Self::PositionNoLongerAvailable { .. })
    }
}

impl From<TimelineError> for StreamError {
    fn from(err: TimelineError) -> Self {
        match err {
            TimelineError::EventTypeNotFound { event_type } => Self::EventTypeNotFound { event_type },
            TimelineError::Storage(e) => Self::Storage(e),
            other => Self::Timeline(other),
        }
    }
}

impl From<CursorError> for StreamError {
    fn from(err: CursorError) -> Self {
        let CursorError::InvalidCursorFormat { partition, offset } = err;
        Self::InvalidCursor {
            cursor: Cursor::new(partition, offset),
            reason: "malformed offset".to_string(),
        }
    }
}

// ============================================================================
// Requests and messages
// ============================================================================

/// Streaming defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Events per batch when the request does not say.
    pub batch_limit: usize,
    /// Flush interval when the request does not say.
    pub flush_timeout_ms: u64,
    /// Capacity of the channel between partition tasks and the consumer.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_limit: 1,
            flush_timeout_ms: 30_000,
            channel_capacity: 32,
        }
    }
}

/// What to stream and how.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub event_type: String,
    /// One cursor per partition to read; empty reads every partition from
    /// its current end.
    pub cursors: Vec<Cursor>,
    pub batch_limit: Option<usize>,
    pub flush_timeout: Option<Duration>,
    /// Total events across all partitions; `None` is unlimited.
    pub stream_limit: Option<u64>,
    /// `None` streams until cancelled.
    pub stream_timeout: Option<Duration>,
}

impl StreamRequest {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            cursors: Vec::new(),
            batch_limit: None,
            flush_timeout: None,
            stream_limit: None,
            stream_timeout: None,
        }
    }

    pub fn with_cursors(mut self, cursors: Vec<Cursor>) -> Self {
        self.cursors = cursors;
        self
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = Some(batch_limit);
        self
    }

    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = Some(flush_timeout);
        self
    }

    pub fn with_stream_limit(mut self, stream_limit: u64) -> Self {
        self.stream_limit = Some(stream_limit);
        self
    }

    pub fn with_stream_timeout(mut self, stream_timeout: Duration) -> Self {
        self.stream_timeout = Some(stream_timeout);
        self
    }
}

/// Events of one partition. An empty batch is a keep-alive carrying the last
/// known cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    pub partition: Partition,
    pub cursor: Cursor,
    pub events: Vec<Bytes>,
}

impl StreamBatch {
    pub fn is_keep_alive(&self) -> bool {
        self.events.is_empty()
    }
}

/// Item produced by an `EventStream`.
#[derive(Debug)]
pub enum StreamMessage {
    Batch(StreamBatch),
    /// The partition stopped; its siblings keep streaming.
    PartitionFailed {
        partition: Partition,
        cursor: Cursor,
        error: StreamError,
    },
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cancellation seen by partition tasks: the stream's own signal, raised when
/// the consumer cancels or drops the stream, plus an optional caller signal.
#[derive(Clone)]
pub(crate) struct CancelSignal {
    own: watch::Receiver<bool>,
    external: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    pub(crate) fn is_cancelled(&self) -> bool {
        *self.own.borrow() || self.external.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancelled.
    pub(crate) async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::select! {
                changed = self.own.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = changed_or_pending(&mut self.external) => {
                    if changed.is_err() {
                        self.external = None;
                    }
                }
            }
        }
    }
}

async fn changed_or_pending(
    receiver: &mut Option<watch::Receiver<bool>>,
) -> std::result::Result<(), watch::error::RecvError> {
    match receiver {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// EventStream
// ============================================================================

/// A running stream. Dropping it cancels every partition task.
pub struct EventStream {
    receiver: mpsc::Receiver<StreamMessage>,
    cancel: watch::Sender<bool>,
    partitions: Vec<Partition>,
}

impl EventStream {
    /// Next message; `None` once every partition finished.
    pub async fn next_message(&mut self) -> Option<StreamMessage> {
        self.receiver.recv().await
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Partitions being streamed.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }
}

impl Stream for EventStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Where one partition starts reading.
#[derive(Debug, Clone)]
pub(crate) struct PartitionStart {
    pub partition: Partition,
    pub timeline: Timeline,
    /// Last consumed offset; `None` starts at the earliest retained one.
    pub after: Option<Offset>,
    /// Cursor reported until the first event is emitted.
    pub cursor: Cursor,
}

/// Settings shared by every partition task of one stream.
#[derive(Clone)]
pub(crate) struct StreamSettings {
    pub event_type: String,
    pub batch_limit: usize,
    pub flush_timeout: Duration,
    /// Events still allowed across the stream, if limited.
    pub budget: Option<Arc<StreamBudget>>,
    pub deadline: Option<Instant>,
}

/// Events still allowed across every partition of a limited stream.
pub(crate) struct StreamBudget {
    remaining: AtomicU64,
    spent: watch::Sender<bool>,
}

impl StreamBudget {
    fn new(limit: u64) -> Self {
        Self {
            remaining: AtomicU64::new(limit),
            spent: watch::channel(limit == 0).0,
        }
    }

    pub(crate) fn is_spent(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) == 0
    }

    /// Take up to `wanted` events.
    pub(crate) fn reserve(&self, wanted: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                granted = remaining.min(wanted as u64);
                Some(remaining - granted)
            });
        if granted > 0 && self.is_spent() {
            self.spent.send_replace(true);
        }
        granted as usize
    }

    /// Resolves once the budget is used up.
    pub(crate) async fn exhausted(&self) {
        let mut spent = self.spent.subscribe();
        let _ = spent.wait_for(|spent| *spent).await;
    }
}

pub struct StreamEngine {
    registry: Arc<TimelineRegistry>,
    config: StreamConfig,
}

impl StreamEngine {
    pub fn new(registry: Arc<TimelineRegistry>, config: StreamConfig) -> Self {
        Self { registry, config }
    }

    /// Start streaming. Fails before emitting anything when a cursor is
    /// malformed or points outside retained data.
    pub async fn stream(&self, request: StreamRequest) -> Result<EventStream> {
        self.start(request, None).await
    }

    /// Like `stream`, additionally stopping when `cancel` turns true.
    pub async fn stream_with_cancel(
        &self,
        request: StreamRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<EventStream> {
        self.start(request, Some(cancel)).await
    }

    #[tracing::instrument(name = "stream.start", skip_all, fields(event_type = %request.event_type))]
    async fn start(
        &self,
        request: StreamRequest,
        external: Option<watch::Receiver<bool>>,
    ) -> Result<EventStream> {
        let batch_limit = request.batch_limit.unwrap_or(self.config.batch_limit);
        if batch_limit == 0 {
            return Err(StreamError::InvalidRequest(
                "batch_limit must be positive".to_string(),
            ));
        }
        let flush_timeout = request
            .flush_timeout
            .unwrap_or(Duration::from_millis(self.config.flush_timeout_ms));
        if flush_timeout.is_zero() {
            return Err(StreamError::InvalidRequest(
                "flush timeout must be positive".to_string(),
            ));
        }

        let starts = self.resolve_starts(&request).await?;

        let settings = StreamSettings {
            event_type: request.event_type.clone(),
            batch_limit,
            flush_timeout,
            budget: request.stream_limit.map(|limit| Arc::new(StreamBudget::new(limit))),
            deadline: request.stream_timeout.map(|timeout| Instant::now() + timeout),
        };
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = CancelSignal {
            own: cancel_rx,
            external,
        };

        let partitions = starts.iter().map(|s| s.partition).collect();
        for start in starts {
            let reader = PartitionReader::new(
                self.registry.clone(),
                settings.clone(),
                start,
                sender.clone(),
                cancel.clone(),
            );
            tokio::spawn(reader.run());
        }

        info!(
            batch_limit,
            flush_timeout_ms = flush_timeout.as_millis() as u64,
            stream_limit = ?request.stream_limit,
            "Stream started"
        );
        Ok(EventStream {
            receiver,
            cancel: cancel_tx,
            partitions,
        })
    }

    /// Decode and resolve every starting cursor.
    async fn resolve_starts(&self, request: &StreamRequest) -> Result<Vec<PartitionStart>> {
        let event_type = request.event_type.as_str();
        let record = self.registry.event_type(event_type).await?;

        if request.cursors.is_empty() {
            let active = self.registry.active_timeline(event_type).await?;
            let storage = self.registry.storage_for(&active).await?;
            let mut starts = Vec::with_capacity(record.partitions as usize);
            for partition in 0..record.partitions {
                let latest = storage
                    .latest_offset(&active.physical_log_id, partition)
                    .await?;
                let after = latest.checked_sub(1);
                let cursor = match after {
                    Some(offset) => cursor::encode(active.order, partition, offset),
                    None => Cursor::begin(partition),
                };
                starts.push(PartitionStart {
                    partition,
                    timeline: active.clone(),
                    after,
                    cursor,
                });
            }
            return Ok(starts);
        }

        let mut seen = HashSet::new();
        let mut decoded = Vec::with_capacity(request.cursors.len());
        for cursor in &request.cursors {
            if cursor.partition >= record.partitions {
                return Err(StreamError::InvalidCursor {
                    cursor: cursor.clone(),
                    reason: format!("event type has {} partitions", record.partitions),
                });
            }
            if !seen.insert(cursor.partition) {
                return Err(StreamError::InvalidCursor {
                    cursor: cursor.clone(),
                    reason: "duplicate partition".to_string(),
                });
            }
            decoded.push((cursor, cursor::decode(cursor)?));
        }

        let mut starts = Vec::with_capacity(decoded.len());
        for (cursor, position) in decoded {
            let start = match position {
                CursorPosition::Begin { partition } => {
                    let timelines = self.registry.list_timelines(event_type).await?;
                    let oldest = timelines.into_iter().next().ok_or_else(|| {
                        TimelineError::NoActiveTimeline {
                            event_type: event_type.to_string(),
                        }
                    })?;
                    PartitionStart {
                        partition,
                        timeline: oldest,
                        after: None,
                        cursor: cursor.clone(),
                    }
                }
                CursorPosition::At(position) => {
                    let timeline = self.locate(event_type, cursor, &position).await?;
                    PartitionStart {
                        partition: position.partition,
                        timeline,
                        after: Some(position.offset),
                        cursor: cursor.clone(),
                    }
                }
            };
            debug!(
                partition = start.partition,
                order = start.timeline.order,
                after = ?start.after,
                "Partition start resolved"
            );
            starts.push(start);
        }
        Ok(starts)
    }

    async fn locate(
        &self,
        event_type: &str,
        cursor: &Cursor,
        position: &cursor::Position,
    ) -> Result<Timeline> {
        match self.registry.resolve_position(event_type, position).await {
            Ok(timeline) => Ok(timeline),
            Err(TimelineError::TimelineNotFound { order, .. }) => {
                // Orders above every allocated one never existed at all.
                let newest = self
                    .registry
                    .timeline_records(event_type)
                    .await?
                    .iter()
                    .map(|t| t.order)
                    .max()
                    .unwrap_or(0);
                if order > newest {
                    return Err(StreamError::InvalidCursor {
                        cursor: cursor.clone(),
                        reason: format!("timeline {} does not exist", order),
                    });
                }
                Err(StreamError::PositionNoLongerAvailable {
                    cursor: cursor.clone(),
                })
            }
            Err(TimelineError::PositionNotCovered { .. }) => {
                Err(StreamError::PositionNoLongerAvailable {
                    cursor: cursor.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
