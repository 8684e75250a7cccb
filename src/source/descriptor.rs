use std::fmt;
use url::Url;

use crate::config::ConfigError;

/// Where to consume from: broker address, topic and partition
///
/// Parsed from a single connection string of the form
/// `kafka://host:port/topic` with an optional `?partition=N` (default 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDescriptor {
    pub brokers: String,
    pub topic: String,
    pub partition: i32,
}

impl LogDescriptor {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw)
            .map_err(|e| ConfigError::InvalidDescriptor(format!("{}: {}", raw, e)))?;

        if url.scheme() != "kafka" {
            return Err(ConfigError::InvalidDescriptor(format!(
                "unsupported scheme '{}', expected kafka://",
                url.scheme()
            )));
        }

        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| {
            ConfigError::InvalidDescriptor("Kafka address is not specified".to_string())
        })?;
        let brokers = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let topic = url.path().trim_start_matches('/');
        if topic.is_empty() {
            return Err(ConfigError::InvalidDescriptor(
                "Kafka topic is not specified".to_string(),
            ));
        }
        if topic.contains('/') {
            return Err(ConfigError::InvalidDescriptor(format!(
                "invalid Kafka topic '{}'",
                topic
            )));
        }

        let mut partition = 0;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "partition" => {
                    partition = value
                        .parse::<i32>()
                        .ok()
                        .filter(|p| *p >= 0)
                        .ok_or_else(|| {
                            ConfigError::InvalidDescriptor(format!("invalid partition '{}'", value))
                        })?;
                }
                other => {
                    return Err(ConfigError::InvalidDescriptor(format!(
                        "unknown descriptor option '{}'",
                        other
                    )))
                }
            }
        }

        Ok(Self {
            brokers,
            topic: topic.to_string(),
            partition,
        })
    }
}

impl fmt::Display for LogDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kafka://{}/{}?partition={}", self.brokers, self.topic, self.partition)
    }
}
