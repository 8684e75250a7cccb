use clap::Parser;
use doppler_gateway::{
    cli::{Cli, Commands},
    config::GatewayConfig,
    pipeline::Pipeline,
    query::InfluxClient,
    routes::{cors_layer, router},
    source::LogSource,
    state::GatewayState,
    storage::{PersistenceSink, PostgresBatchStore},
    subscribers::ConnectionRegistry,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long to wait for the Kafka metadata request at startup
const SOURCE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doppler_gateway=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = GatewayConfig::from_env()?;

    if cli.command == Some(Commands::CheckConfig) {
        for (name, value) in config.summary() {
            println!("{:<22} {}", name, value);
        }
        return Ok(());
    }

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    let store = PostgresBatchStore::new(pool.clone());
    store.initialize().await?;
    info!("✅ Database schema initialized");

    match cli.command {
        Some(Commands::InitSchema) => {
            pool.close().await;
            return Ok(());
        }
        Some(Commands::Serve) | Some(Commands::CheckConfig) | None => {}
    }

    info!("🚀 Starting Doppler Gateway v{}", VERSION);
    config.log_summary();

    let source = connect_source(&config)?;
    let query_store = InfluxClient::new(config.influx.clone())?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let registry = ConnectionRegistry::new(config.registry.clone());
    let sink = PersistenceSink::new(Arc::new(store), config.store_retry.clone());
    let pipeline = Pipeline::new(
        config.batch.clone(),
        sink,
        registry,
        config.source_retry.clone(),
        shutdown.clone(),
    )?;

    let state = GatewayState::new(
        pipeline.state(),
        Arc::new(query_store),
        config.subscribers.clone(),
    );

    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&config.cors_origins)),
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("🎧 Listening on http://{}", addr);
    info!("📡 WebSocket endpoint: ws://{}/receive/ws", addr);

    let mut pipeline_task = tokio::spawn(pipeline.run(source));
    let mut server_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        })
    };

    // Wait for a signal or for the pipeline to stop on its own
    let early_exit = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = &mut pipeline_task => Some(result),
    };
    shutdown.cancel();

    let pipeline_result = match early_exit {
        Some(result) => Some(result),
        None => match tokio::time::timeout(config.shutdown_grace, &mut pipeline_task).await {
            Ok(result) => Some(result),
            Err(_) => {
                error!(
                    "Pipeline did not drain within {:?}, abandoning in-flight batches",
                    config.shutdown_grace
                );
                pipeline_task.abort();
                None
            }
        },
    };

    if tokio::time::timeout(config.shutdown_grace, &mut server_task)
        .await
        .is_err()
    {
        warn!("HTTP server did not stop within {:?}", config.shutdown_grace);
        server_task.abort();
    }

    pool.close().await;

    match pipeline_result {
        Some(Ok(Ok(exit))) => {
            info!(
                "👋 Shutdown complete ({} events consumed)",
                exit.events_consumed
            );
            Ok(())
        }
        Some(Ok(Err(e))) => Err(e.into()),
        Some(Err(e)) => Err(e.into()),
        None => Err("shutdown grace period exceeded".into()),
    }
}

#[cfg(feature = "kafka")]
fn connect_source(config: &GatewayConfig) -> Result<Box<dyn LogSource>, Box<dyn std::error::Error>> {
    let source = doppler_gateway::source::KafkaLogSource::connect(
        &config.log,
        &config.kafka_group_id,
        SOURCE_CONNECT_TIMEOUT,
    )?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "kafka"))]
fn connect_source(config: &GatewayConfig) -> Result<Box<dyn LogSource>, Box<dyn std::error::Error>> {
    let _ = SOURCE_CONNECT_TIMEOUT;
    Err(format!(
        "cannot consume {}: built without the `kafka` feature",
        config.log
    )
    .into())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
