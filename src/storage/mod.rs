mod postgres;
mod sink;
mod traits;

pub use postgres::PostgresBatchStore;
pub use sink::{PersistenceSink, RetryPolicy};
pub use traits::{BatchStore, StoreError, StoreResult};
