// Batch dispatcher - persists then broadcasts each closed batch
//
// A single task drains the aggregator queue, so batches are written and
// delivered strictly in the order they were closed. A failed write is
// recorded and logged but the batch is still broadcast.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::pipeline::stats::{PipelineStats, WriteFailure};
use crate::pipeline::types::Batch;
use crate::storage::PersistenceSink;
use crate::subscribers::{BatchFrames, BroadcastReport, ConnectionRegistry};

pub struct BatchDispatcher {
    sink: PersistenceSink,
    registry: ConnectionRegistry,
    stats: Arc<PipelineStats>,
    truncate_size: usize,
}

impl BatchDispatcher {
    pub fn new(
        sink: PersistenceSink,
        registry: ConnectionRegistry,
        stats: Arc<PipelineStats>,
        truncate_size: usize,
    ) -> Self {
        Self {
            sink,
            registry,
            stats,
            truncate_size,
        }
    }

    /// Process batches until the aggregator closes its end of the queue
    pub async fn run(self, mut batches: mpsc::UnboundedReceiver<Batch>) {
        let mut dispatched = 0u64;

        while let Some(batch) = batches.recv().await {
            self.dispatch(&batch).await;
            dispatched += 1;
        }

        info!("Dispatcher drained after {} batches", dispatched);
    }

    /// Persist one batch, then deliver it to every live subscriber
    pub async fn dispatch(&self, batch: &Batch) -> BroadcastReport {
        match self.sink.write(batch).await {
            Ok(()) => self.stats.record_persisted(),
            Err(e) => {
                let failure = WriteFailure::new(batch, &e);
                error!(
                    batch_id = %failure.batch_id,
                    sequence = failure.sequence,
                    events = failure.event_count,
                    first_offset = ?failure.first_offset,
                    last_offset = ?failure.last_offset,
                    "Failed to persist batch: {}",
                    e
                );
                self.stats.record_write_failure(failure);
            }
        }

        let frames = match BatchFrames::encode(batch, self.truncate_size) {
            Ok(frames) => frames,
            Err(e) => {
                error!("Failed to encode batch {}: {}", batch.sequence(), e);
                return BroadcastReport::default();
            }
        };

        let report = self.registry.broadcast(&frames);
        self.stats.record_broadcast(&report);

        debug!(
            "Batch {} delivered={} skipped={} evicted={}",
            batch.sequence(),
            report.delivered,
            report.skipped,
            report.evicted
        );

        report
    }
}
