// Common types for the batching pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::source::SourceError;

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors that can occur while moving events through the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Late event rejected after close (partition {partition}, offset {offset})")]
    LateEvent { partition: i32, offset: i64 },

    #[error("Log source halted: {0}")]
    SourceHalted(#[source] SourceError),

    #[error("Batch dispatcher is no longer accepting batches")]
    DispatcherGone,

    #[error("Invalid batch policy: {0}")]
    InvalidPolicy(String),
}

/// A single event pulled from the log, immutable once produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// Timestamp assigned by the log, when present
    pub timestamp: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload,
            timestamp: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }
}

/// Why a batch was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// Reached the maximum batch size
    Full,
    /// Accumulation window elapsed with enough events
    Interval,
    /// Forced by close during shutdown or source halt
    Shutdown,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Full => "full",
            FlushReason::Interval => "interval",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

/// A closed, ordered group of events
///
/// Batches are only built by the aggregator at flush time and expose no
/// mutating API, so a batch handed to persistence is never re-opened.
#[derive(Debug, Clone)]
pub struct Batch {
    id: Uuid,
    sequence: u64,
    opened_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
    reason: FlushReason,
    events: Vec<RawEvent>,
}

impl Batch {
    pub(crate) fn close(
        sequence: u64,
        opened_at: DateTime<Utc>,
        events: Vec<RawEvent>,
        reason: FlushReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            opened_at,
            closed_at: Utc::now(),
            reason,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Position of this batch in close order, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn closed_at(&self) -> DateTime<Utc> {
        self.closed_at
    }

    pub fn reason(&self) -> FlushReason {
        self.reason
    }

    pub fn events(&self) -> &[RawEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// First and last log offsets in the batch
    pub fn offset_range(&self) -> Option<(i64, i64)> {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => Some((first.offset, last.offset)),
            _ => None,
        }
    }

    /// Lightweight projection surfacing at most `limit` events
    pub fn truncated(&self, limit: usize) -> TruncatedView<'_> {
        TruncatedView { batch: self, limit }
    }
}

/// Size-limited view over a batch, used for subscriber summaries
#[derive(Debug, Clone, Copy)]
pub struct TruncatedView<'a> {
    batch: &'a Batch,
    limit: usize,
}

impl<'a> TruncatedView<'a> {
    pub fn batch(&self) -> &'a Batch {
        self.batch
    }

    /// The leading events of the batch, in arrival order
    pub fn events(&self) -> &'a [RawEvent] {
        let events = self.batch.events();
        &events[..self.limit.min(events.len())]
    }

    /// Event count of the underlying batch
    pub fn total(&self) -> usize {
        self.batch.len()
    }

    pub fn omitted(&self) -> usize {
        self.total() - self.events().len()
    }
}
