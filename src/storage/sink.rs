use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::pipeline::Batch;
use crate::storage::traits::{BatchStore, StoreResult};

/// Bounded retry with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the given retry (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Writes one batch per call to the durable store, retrying transient failures
#[derive(Clone)]
pub struct PersistenceSink {
    store: Arc<dyn BatchStore>,
    retry: RetryPolicy,
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn BatchStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Persist a batch, returning the last error once the retry budget is spent
    pub async fn write(&self, batch: &Batch) -> StoreResult<()> {
        let mut retry = 0;

        loop {
            match self.store.write_batch(batch).await {
                Ok(()) => {
                    if retry > 0 {
                        info!(
                            "Batch {} persisted after {} retries",
                            batch.sequence(),
                            retry
                        );
                    }
                    return Ok(());
                }
                Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                    retry += 1;
                    let delay = self.retry.backoff_for(retry);
                    warn!(
                        "Transient store error for batch {} (retry {}/{} in {:?}): {}",
                        batch.sequence(),
                        retry,
                        self.retry.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
