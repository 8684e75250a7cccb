// Pluggable log sources for the consumer loop
//
// A `LogSource` yields one event per call, positioned at the newest offset
// when it is opened. Errors are classified so the consumer loop can retry
// transient failures and halt on terminal ones.
//
// Current implementations:
// - Kafka: a single topic partition via rdkafka (feature `kafka`)
// - Channel: events pushed through an in-process mpsc channel

mod channel;
mod descriptor;
#[cfg(feature = "kafka")]
mod kafka;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::RawEvent;

pub use channel::{ChannelSource, ChannelSourceHandle};
pub use descriptor::LogDescriptor;
#[cfg(feature = "kafka")]
pub use kafka::KafkaLogSource;

/// Result type for log source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors raised by a log source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to connect to log source: {0}")]
    Connection(String),

    #[error("Transient read failure: {0}")]
    Transient(String),

    #[error("Terminal read failure: {0}")]
    Terminal(String),

    #[error("Log source closed")]
    Closed,
}

impl SourceError {
    /// Whether retrying the same pull may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// A partitioned log consumed one event at a time
#[async_trait]
pub trait LogSource: Send {
    /// Pull the next event
    ///
    /// Must be cancellation safe: dropping the future before it completes
    /// must not lose an event.
    async fn next_event(&mut self) -> SourceResult<RawEvent>;

    /// Release the source; no further pulls follow
    async fn close(&mut self);

    /// Human-readable description for logs
    fn describe(&self) -> String;
}
