// Ingestion pipeline
//
// log source -> consumer loop -> aggregator -> dispatch queue -> dispatcher
//                                     ^                           |
//                              interval flusher          persist, then broadcast
//
// Only the aggregator holds the in-progress batch. Every closed batch
// crosses the queue exactly once and is handled by a single dispatcher
// task, which keeps persistence and delivery in close order.

mod aggregator;
mod consumer;
mod dispatcher;
mod stats;
mod types;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::source::LogSource;
use crate::state::{PipelineState, PipelineStatus};
use crate::storage::PersistenceSink;
use crate::subscribers::ConnectionRegistry;

pub use aggregator::{BatchAggregator, BatchPolicy};
pub use consumer::{ConsumerExit, SourceRetryPolicy, StreamConsumer};
pub use dispatcher::BatchDispatcher;
pub use stats::{PipelineStats, StatsSnapshot, WriteFailure};
pub use types::{
    Batch, FlushReason, PipelineError, PipelineResult, RawEvent, TruncatedView,
};

/// Wired-up pipeline, ready to run against a log source
pub struct Pipeline {
    state: Arc<PipelineState>,
    batches: mpsc::UnboundedReceiver<Batch>,
    consumer: StreamConsumer,
    dispatcher: BatchDispatcher,
}

impl Pipeline {
    pub fn new(
        policy: BatchPolicy,
        sink: PersistenceSink,
        registry: ConnectionRegistry,
        source_retry: SourceRetryPolicy,
        shutdown: CancellationToken,
    ) -> PipelineResult<Self> {
        let stats = Arc::new(PipelineStats::new());
        let truncate_size = policy.truncate_size;

        let (aggregator, batches) = BatchAggregator::new(policy, stats.clone())?;
        let aggregator = Arc::new(aggregator);

        let consumer = StreamConsumer::new(aggregator.clone(), source_retry, shutdown);
        let dispatcher = BatchDispatcher::new(sink, registry.clone(), stats.clone(), truncate_size);
        let state = Arc::new(PipelineState::new(aggregator, registry, stats));

        Ok(Self {
            state,
            batches,
            consumer,
            dispatcher,
        })
    }

    /// Shared state for the HTTP and WebSocket handlers
    pub fn state(&self) -> Arc<PipelineState> {
        self.state.clone()
    }

    /// Run until shutdown or a terminal source failure
    ///
    /// Returns only after the final batch has been persisted and broadcast.
    pub async fn run(self, mut source: Box<dyn LogSource>) -> PipelineResult<ConsumerExit> {
        let Pipeline {
            state,
            batches,
            consumer,
            dispatcher,
        } = self;

        state.set_status(PipelineStatus::Running);
        info!("Pipeline running");

        let flusher = state.aggregator.spawn_interval_flusher();
        let dispatch_task = tokio::spawn(dispatcher.run(batches));

        let result = consumer.run(source.as_mut()).await;
        state.set_status(PipelineStatus::Draining);

        if let Err(e) = flusher.await {
            error!("Interval flusher task failed: {}", e);
        }
        if let Err(e) = dispatch_task.await {
            error!("Dispatcher task failed: {}", e);
        }

        match &result {
            Ok(exit) => {
                state.set_status(PipelineStatus::Stopped);
                info!(
                    "Pipeline stopped after {} events",
                    exit.events_consumed
                );
            }
            Err(e) => {
                state.set_status(PipelineStatus::Halted);
                error!("Pipeline halted: {}", e);
            }
        }
        state.drained.cancel();

        result
    }
}
