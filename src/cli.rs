use clap::{Parser, Subcommand};

/// Doppler Gateway - Kafka ingestion with batched persistence and WebSocket fan-out
#[derive(Parser)]
#[command(name = "doppler-gateway")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the gateway (default)
    Serve,

    /// Create the batch tables if absent, then exit
    InitSchema,

    /// Validate configuration and print the effective values
    CheckConfig,
}
