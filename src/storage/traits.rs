use async_trait::async_trait;

use crate::pipeline::Batch;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the durable store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Batch rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether a retry of the same write may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => is_transient_sqlx(e),
            StoreError::Unavailable(_) => true,
            StoreError::Rejected(_) => false,
        }
    }
}

fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        // Connection exceptions (class 08), serialization failures and deadlocks
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || code == "40001" || code == "40P01")
            .unwrap_or(false),
        _ => false,
    }
}

/// Durable storage for closed batches
///
/// Implementations must write a batch atomically and treat a repeated write
/// of the same batch as a no-op, since the sink retries on transient errors.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist a whole batch
    async fn write_batch(&self, batch: &Batch) -> StoreResult<()>;
}
