use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{BatchAggregator, PipelineStats};
use crate::query::TimeSeriesStore;
use crate::subscribers::{ConnectionRegistry, SubscriberConfig};

/// Lifecycle of the ingestion pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Starting,
    Running,
    /// Cancellation received, final batch in flight
    Draining,
    /// Log source failed permanently; no further events are ingested
    Halted,
    Stopped,
}

/// Process-wide pipeline state
///
/// The aggregator is the only owner of the in-progress batch; everything
/// else reaches it through this value.
pub struct PipelineState {
    pub aggregator: Arc<BatchAggregator>,
    pub registry: ConnectionRegistry,
    pub stats: Arc<PipelineStats>,
    /// Cancelled once the last batch has been dispatched
    pub drained: CancellationToken,
    status: RwLock<PipelineStatus>,
}

impl PipelineState {
    pub fn new(
        aggregator: Arc<BatchAggregator>,
        registry: ConnectionRegistry,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            aggregator,
            registry,
            stats,
            drained: CancellationToken::new(),
            status: RwLock::new(PipelineStatus::Starting),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: PipelineStatus) {
        *self.status.write() = status;
    }
}

/// Shared application state for HTTP and WebSocket handlers
#[derive(Clone)]
pub struct GatewayState {
    pub pipeline: Arc<PipelineState>,
    pub query_store: Arc<dyn TimeSeriesStore>,
    pub subscriber_config: SubscriberConfig,
    pub start_time: Instant,
}

impl GatewayState {
    pub fn new(
        pipeline: Arc<PipelineState>,
        query_store: Arc<dyn TimeSeriesStore>,
        subscriber_config: SubscriberConfig,
    ) -> Self {
        Self {
            pipeline,
            query_store,
            subscriber_config,
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
