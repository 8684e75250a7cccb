pub mod cli;
pub mod config;
pub mod handlers;
pub mod pipeline;
pub mod query;
pub mod routes;
pub mod source;
pub mod state;
pub mod storage;
pub mod subscribers;

pub use config::{ConfigError, GatewayConfig};
pub use pipeline::{Pipeline, PipelineError, PipelineResult};
pub use routes::{cors_layer, router};
pub use state::{GatewayState, PipelineState, PipelineStatus};
