use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::query::{AggregateQuery, QueryError, QueryResult, TimeSeriesStore};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Connection settings for an InfluxDB 1.x server
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            username: None,
            password: None,
            database: "doppler".to_string(),
        }
    }
}

/// Client for the InfluxDB 1.x `/query` endpoint
pub struct InfluxClient {
    client: Client,
    endpoint: Url,
    config: InfluxConfig,
}

impl InfluxClient {
    pub fn new(config: InfluxConfig) -> QueryResult<Self> {
        let mut base = Url::parse(&config.url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("query")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxClient {
    async fn aggregate(&self, query: &AggregateQuery) -> QueryResult<Value> {
        let statement = query.to_influxql();
        debug!("InfluxQL: {}", statement);

        let mut request = self.client.get(self.endpoint.clone()).query(&[
            ("db", self.config.database.as_str()),
            ("q", statement.as_str()),
            ("epoch", "ms"),
        ]);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("InfluxDB returned {}: {}", status, message);
            return Err(QueryError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await?;
        if let Some(message) = statement_error(&body) {
            return Err(QueryError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        Ok(body)
    }
}

/// InfluxDB reports statement errors inside a 200 response
fn statement_error(body: &Value) -> Option<String> {
    body.get("error")
        .or_else(|| {
            body.get("results")
                .and_then(|r| r.get(0))
                .and_then(|r| r.get("error"))
        })
        .and_then(Value::as_str)
        .map(str::to_string)
}
