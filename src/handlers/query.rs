use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, warn};

use crate::query::{AggregateQuery, QueryError};
use crate::state::GatewayState;

/// Error body for failed queries
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Run an aggregate query against the time-series store
pub async fn aggregate_query(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    let query = AggregateQuery::from_params(&params).map_err(|e| {
        debug!("Rejected aggregate query: {}", e);
        error_response(StatusCode::BAD_REQUEST, e.to_string())
    })?;

    match state.query_store.aggregate(&query).await {
        Ok(result) => Ok(Json(result)),
        Err(QueryError::InvalidQuery(message)) => {
            Err(error_response(StatusCode::BAD_REQUEST, message))
        }
        Err(e @ QueryError::Upstream { .. }) => {
            warn!("Aggregate query {} failed upstream: {}", query, e);
            Err(error_response(StatusCode::BAD_GATEWAY, e.to_string()))
        }
        Err(e) => {
            error!("Aggregate query {} failed: {}", query, e);
            Err(error_response(
                StatusCode::BAD_GATEWAY,
                "Time-series store unavailable",
            ))
        }
    }
}
