// Consumer loop - pulls events from the log source into the aggregator
//
// Runs until the shutdown token fires or the source fails for good. Either
// way the source is released and the aggregator closed, which hands the
// final partial batch to the dispatcher.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::aggregator::BatchAggregator;
use crate::pipeline::types::{PipelineError, PipelineResult};
use crate::source::LogSource;

/// Retry budget for transient source failures
#[derive(Debug, Clone)]
pub struct SourceRetryPolicy {
    /// Consecutive transient failures tolerated before halting
    pub max_retries: u32,
    /// Base delay, multiplied by the attempt number
    pub backoff: Duration,
}

impl Default for SourceRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

/// How a cancelled consumer run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerExit {
    pub events_consumed: u64,
    /// Sequence of the batch flushed on close, if anything was pending
    pub final_batch: Option<u64>,
}

pub struct StreamConsumer {
    aggregator: Arc<BatchAggregator>,
    retry: SourceRetryPolicy,
    shutdown: CancellationToken,
}

impl StreamConsumer {
    pub fn new(
        aggregator: Arc<BatchAggregator>,
        retry: SourceRetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            aggregator,
            retry,
            shutdown,
        }
    }

    /// Consume until cancelled or halted, then close the source and aggregator
    pub async fn run(&self, source: &mut dyn LogSource) -> PipelineResult<ConsumerExit> {
        info!("Consuming from {}", source.describe());

        let mut consumed = 0u64;
        let outcome = self.consume(source, &mut consumed).await;

        source.close().await;
        let final_batch = match self.aggregator.close().await {
            Ok(sequence) => sequence,
            Err(e) => {
                error!("Final flush failed: {}", e);
                outcome?;
                return Err(e);
            }
        };

        outcome?;
        info!(
            "Consumer stopped after {} events (final batch: {:?})",
            consumed, final_batch
        );

        Ok(ConsumerExit {
            events_consumed: consumed,
            final_batch,
        })
    }

    async fn consume(&self, source: &mut dyn LogSource, consumed: &mut u64) -> PipelineResult<()> {
        let mut failures = 0u32;

        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping consumer");
                    return Ok(());
                }

                next = source.next_event() => next,
            };

            match next {
                Ok(event) => {
                    failures = 0;
                    self.aggregator.ingest(event).await?;
                    *consumed += 1;
                }
                Err(e) if e.is_transient() && failures < self.retry.max_retries => {
                    failures += 1;
                    let delay = self.retry.backoff.saturating_mul(failures);
                    warn!(
                        "Transient source error (retry {}/{} in {:?}): {}",
                        failures, self.retry.max_retries, delay, e
                    );

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!("Log source halted: {}", e);
                    return Err(PipelineError::SourceHalted(e));
                }
            }
        }
    }
}
