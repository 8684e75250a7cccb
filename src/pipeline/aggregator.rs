// Batch aggregator - groups raw events into size- and time-bounded batches
//
// The open batch lives behind a single async mutex that is held only while
// appending, closing and handing the closed batch to the dispatcher queue.
// Because hand-off happens inside the critical section, batches reach the
// dispatcher in the order they were closed. The queue is unbounded and the
// hand-off never awaits, so a stalled store backs up the queue instead of
// the next ingest.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::stats::PipelineStats;
use crate::pipeline::types::{Batch, FlushReason, PipelineError, PipelineResult, RawEvent};

/// Size/time policy for closing batches
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    /// Hard cap on events per batch
    pub max_batch_size: usize,
    /// Minimum events before an interval flush is allowed
    pub min_batch_size: usize,
    /// Accumulation window
    pub batch_interval: Duration,
    /// Events surfaced in subscriber summaries
    pub truncate_size: usize,
}

impl BatchPolicy {
    /// Check the size and window bounds
    pub fn validate(&self) -> PipelineResult<()> {
        if self.max_batch_size == 0 {
            return Err(PipelineError::InvalidPolicy(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return Err(PipelineError::InvalidPolicy(format!(
                "min_batch_size must be between 1 and {}, got {}",
                self.max_batch_size, self.min_batch_size
            )));
        }
        if self.batch_interval.is_zero() {
            return Err(PipelineError::InvalidPolicy(
                "batch_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            min_batch_size: 1,
            batch_interval: Duration::from_millis(2000),
            truncate_size: 1,
        }
    }
}

struct OpenBatch {
    events: Vec<RawEvent>,
    opened_at: DateTime<Utc>,
    deadline: Instant,
}

impl OpenBatch {
    fn new(policy: &BatchPolicy) -> Self {
        Self {
            events: Vec::with_capacity(policy.max_batch_size),
            opened_at: Utc::now(),
            deadline: Instant::now() + policy.batch_interval,
        }
    }
}

struct AggregatorState {
    open: OpenBatch,
    next_sequence: u64,
    /// Dropped on close so the dispatcher sees the end of the stream
    handoff: Option<mpsc::UnboundedSender<Batch>>,
}

pub struct BatchAggregator {
    policy: BatchPolicy,
    state: Mutex<AggregatorState>,
    stats: Arc<PipelineStats>,
    closed: CancellationToken,
}

impl BatchAggregator {
    /// Create an aggregator and the receiving end of its dispatcher queue
    pub fn new(
        policy: BatchPolicy,
        stats: Arc<PipelineStats>,
    ) -> PipelineResult<(Self, mpsc::UnboundedReceiver<Batch>)> {
        policy.validate()?;

        let (handoff, batches) = mpsc::unbounded_channel();
        let state = AggregatorState {
            open: OpenBatch::new(&policy),
            next_sequence: 0,
            handoff: Some(handoff),
        };

        let aggregator = Self {
            policy,
            state: Mutex::new(state),
            stats,
            closed: CancellationToken::new(),
        };

        Ok((aggregator, batches))
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of events in the open batch
    pub async fn pending(&self) -> usize {
        self.state.lock().await.open.events.len()
    }

    /// Append an event to the open batch, flushing when it becomes full
    pub async fn ingest(&self, event: RawEvent) -> PipelineResult<()> {
        let mut state = self.state.lock().await;

        if state.handoff.is_none() {
            self.stats.record_late_event();
            warn!(
                "Rejected late event after close: partition={} offset={}",
                event.partition, event.offset
            );
            return Err(PipelineError::LateEvent {
                partition: event.partition,
                offset: event.offset,
            });
        }

        state.open.events.push(event);
        self.stats.record_ingested();

        if state.open.events.len() >= self.policy.max_batch_size {
            self.flush_locked(&mut state, FlushReason::Full)?;
        }

        Ok(())
    }

    /// Flush the open batch if its window has elapsed
    ///
    /// An under-filled batch is not flushed on time alone; its window is
    /// extended by another interval instead. Returns whether a batch was
    /// flushed.
    pub async fn flush_if_due(&self) -> PipelineResult<bool> {
        let mut state = self.state.lock().await;

        if state.handoff.is_none() {
            return Ok(false);
        }

        let now = Instant::now();
        if now < state.open.deadline {
            return Ok(false);
        }

        if state.open.events.len() >= self.policy.min_batch_size {
            self.flush_locked(&mut state, FlushReason::Interval)?;
            Ok(true)
        } else {
            debug!(
                "Batch window elapsed with {} of {} events, extending",
                state.open.events.len(),
                self.policy.min_batch_size
            );
            state.open.deadline = now + self.policy.batch_interval;
            Ok(false)
        }
    }

    /// Force a final flush and reject all later ingests
    ///
    /// Returns the sequence number of the flushed batch, if anything was
    /// pending. Calling close more than once is a no-op.
    pub async fn close(&self) -> PipelineResult<Option<u64>> {
        let mut state = self.state.lock().await;

        if state.handoff.is_none() {
            return Ok(None);
        }

        let flushed = if state.open.events.is_empty() {
            None
        } else {
            Some(self.flush_locked(&mut state, FlushReason::Shutdown)?)
        };

        state.handoff = None;
        self.closed.cancel();
        info!("Batch aggregator closed after {} batches", state.next_sequence);

        Ok(flushed)
    }

    /// Close the open batch and hand it to the dispatcher queue
    fn flush_locked(&self, state: &mut AggregatorState, reason: FlushReason) -> PipelineResult<u64> {
        let open = std::mem::replace(&mut state.open, OpenBatch::new(&self.policy));
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let batch = Batch::close(sequence, open.opened_at, open.events, reason);
        debug!(
            "Closing batch {} ({} events, reason={})",
            sequence,
            batch.len(),
            reason.as_str()
        );

        let handoff = state.handoff.as_ref().ok_or(PipelineError::DispatcherGone)?;
        handoff
            .send(batch)
            .map_err(|_| PipelineError::DispatcherGone)?;

        self.stats.record_flushed();
        Ok(sequence)
    }

    /// Spawn the timer task that drives interval flushes
    ///
    /// The task sleeps until the open batch's deadline, re-reading it after
    /// every wake since size flushes move it. It stops once the aggregator
    /// closes.
    pub fn spawn_interval_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let deadline = aggregator.state.lock().await.open.deadline;

                tokio::select! {
                    biased;

                    _ = aggregator.closed.cancelled() => break,

                    _ = sleep_until(deadline) => {
                        if let Err(e) = aggregator.flush_if_due().await {
                            error!("Interval flush failed: {}", e);
                            break;
                        }
                    }
                }
            }

            debug!("Interval flusher stopped");
        })
    }
}
