use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::pipeline::{StatsSnapshot, WriteFailure};
use crate::state::{GatewayState, PipelineStatus};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: PipelineStatus,
    pub version: String,
    pub subscribers: usize,
    pub uptime_seconds: u64,
}

/// Pipeline counters plus the most recent write failures
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub status: PipelineStatus,
    pub subscribers: usize,
    #[serde(flatten)]
    pub counters: StatsSnapshot,
    pub recent_write_failures: Vec<WriteFailure>,
}

/// Health check endpoint; 503 once the pipeline has halted
pub async fn health_check(
    State(state): State<GatewayState>,
) -> (StatusCode, Json<HealthResponse>) {
    let status = state.pipeline.status();
    let code = match status {
        PipelineStatus::Halted => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        subscribers: state.pipeline.registry.connection_count(),
        uptime_seconds: state.uptime_seconds(),
    };

    (code, Json(response))
}

/// Stats endpoint
pub async fn stats(State(state): State<GatewayState>) -> Json<StatsResponse> {
    let pipeline = &state.pipeline;

    Json(StatsResponse {
        status: pipeline.status(),
        subscribers: pipeline.registry.connection_count(),
        counters: pipeline.stats.snapshot(),
        recent_write_failures: pipeline.stats.recent_failures(),
    })
}
