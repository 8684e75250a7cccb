use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::pipeline::{BatchPolicy, SourceRetryPolicy};
use crate::query::InfluxConfig;
use crate::source::LogDescriptor;
use crate::storage::RetryPolicy;
use crate::subscribers::{RegistryConfig, SlowConsumerPolicy, SubscriberConfig};

/// Upper bound for exponential store retry backoff
const STORE_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Gateway configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,
    /// Log partition to consume
    pub log: LogDescriptor,
    pub kafka_group_id: String,
    /// PostgreSQL database URL
    pub database_url: String,
    pub database_max_connections: u32,
    pub influx: InfluxConfig,
    pub batch: BatchPolicy,
    pub registry: RegistryConfig,
    pub subscribers: SubscriberConfig,
    pub store_retry: RetryPolicy,
    pub source_retry: SourceRetryPolicy,
    /// How long shutdown waits for the final batch
    pub shutdown_grace: Duration,
    /// CORS allowed origins (comma-separated in env var)
    pub cors_origins: Vec<String>,
}

impl GatewayConfig {
    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };

        let log = LogDescriptor::parse(&vars.required("KAFKA_CONN")?)?;
        let database_url = vars.required("DATABASE_URL")?;

        let config = Self {
            bind_addr: vars.parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            log,
            kafka_group_id: vars.string_or("KAFKA_GROUP_ID", "doppler-gateway"),
            database_url,
            database_max_connections: vars.parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
            influx: InfluxConfig {
                url: vars.string_or("INFLUX_URL", "http://localhost:8086"),
                username: vars.optional("INFLUX_USERNAME"),
                password: vars.optional("INFLUX_PASSWORD"),
                database: vars.string_or("INFLUX_DATABASE", "doppler"),
            },
            batch: BatchPolicy {
                max_batch_size: vars.parse_or("MAX_BATCH_SIZE", 100)?,
                min_batch_size: vars.parse_or("MIN_BATCH_SIZE", 1)?,
                batch_interval: vars.millis_or("BATCH_INTERVAL_MS", 2000)?,
                truncate_size: vars.parse_or("TRUNCATE_SIZE", 1)?,
            },
            registry: RegistryConfig {
                max_subscribers: vars.parse_or("MAX_SUBSCRIBERS", 10_000)?,
                slow_consumer_policy: vars
                    .parse_or("SLOW_CONSUMER_POLICY", SlowConsumerPolicy::Evict)?,
            },
            subscribers: SubscriberConfig {
                buffer: vars.parse_or("SUBSCRIBER_BUFFER", 16)?,
                send_timeout: vars.millis_or("SUBSCRIBER_SEND_TIMEOUT_MS", 5000)?,
            },
            store_retry: RetryPolicy {
                max_retries: vars.parse_or("STORE_MAX_RETRIES", 3)?,
                initial_backoff: vars.millis_or("STORE_RETRY_BACKOFF_MS", 200)?,
                max_backoff: STORE_MAX_BACKOFF,
            },
            source_retry: SourceRetryPolicy {
                max_retries: vars.parse_or("SOURCE_MAX_RETRIES", 5)?,
                backoff: vars.millis_or("SOURCE_RETRY_BACKOFF_MS", 500)?,
            },
            shutdown_grace: Duration::from_secs(vars.parse_or("SHUTDOWN_GRACE_SECONDS", 5)?),
            cors_origins: vars
                .optional("CORS_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["*".to_string()]),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let batch = &self.batch;

        if batch.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if batch.min_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "MIN_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if batch.min_batch_size > batch.max_batch_size {
            return Err(ConfigError::InvalidValue(format!(
                "MIN_BATCH_SIZE ({}) must not exceed MAX_BATCH_SIZE ({})",
                batch.min_batch_size, batch.max_batch_size
            )));
        }
        if batch.batch_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "BATCH_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.subscribers.buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "SUBSCRIBER_BUFFER must be at least 1".to_string(),
            ));
        }
        if self.subscribers.send_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SUBSCRIBER_SEND_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        if self.registry.max_subscribers == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_SUBSCRIBERS must be at least 1".to_string(),
            ));
        }
        if self.database_max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "DATABASE_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective settings with credentials redacted
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Bind address", self.bind_addr.to_string()),
            ("Log source", self.log.to_string()),
            ("Kafka group", self.kafka_group_id.clone()),
            ("Database", redact_url(&self.database_url)),
            ("Database connections", self.database_max_connections.to_string()),
            (
                "InfluxDB",
                format!("{} (db={})", redact_url(&self.influx.url), self.influx.database),
            ),
            (
                "Batch size",
                format!("{}..={}", self.batch.min_batch_size, self.batch.max_batch_size),
            ),
            ("Batch interval", format!("{:?}", self.batch.batch_interval)),
            ("Truncate size", self.batch.truncate_size.to_string()),
            ("Subscriber buffer", self.subscribers.buffer.to_string()),
            ("Max subscribers", self.registry.max_subscribers.to_string()),
            (
                "Slow consumer policy",
                format!("{:?}", self.registry.slow_consumer_policy),
            ),
            ("Shutdown grace", format!("{:?}", self.shutdown_grace)),
            ("CORS origins", self.cors_origins.join(",")),
        ]
    }

    pub fn log_summary(&self) {
        info!("📋 Configuration loaded:");
        for (name, value) in self.summary() {
            info!("   {}: {}", name, value);
        }
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.optional(name)
            .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
    }

    fn string_or(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("{}='{}': {}", name, raw, e))),
            None => Ok(default),
        }
    }

    fn millis_or(&self, name: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse_or(name, default).map(Duration::from_millis)
    }
}

fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("Invalid log descriptor: {0}")]
    InvalidDescriptor(String),
}
