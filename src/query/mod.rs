// Aggregate queries against the time-series store
//
// Request parameters are validated and quoted here before any InfluxQL is
// built, so nothing from the query string reaches the store unescaped.

mod influx;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use influx::{InfluxClient, InfluxConfig};

/// Longest accepted measurement, field or tag name
const MAX_IDENTIFIER_LENGTH: usize = 128;
/// Longest accepted tag value
const MAX_TAG_VALUE_LENGTH: usize = 256;
/// Maximum number of tag filters per query
const MAX_TAG_FILTERS: usize = 16;
/// Prefix marking a tag filter parameter
const TAG_PREFIX: &str = "tag.";

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid store URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store returned {status}: {message}")]
    Upstream { status: u16, message: String },
}

/// Aggregate function applied to a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

impl Aggregate {
    pub fn as_influxql(&self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Sum => "SUM",
            Aggregate::Mean => "MEAN",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

impl FromStr for Aggregate {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(Aggregate::Count),
            "sum" => Ok(Aggregate::Sum),
            "mean" | "avg" => Ok(Aggregate::Mean),
            "min" => Ok(Aggregate::Min),
            "max" => Ok(Aggregate::Max),
            other => Err(QueryError::InvalidQuery(format!(
                "unknown aggregate '{}'",
                other
            ))),
        }
    }
}

/// A validated aggregate query over one field of one measurement
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub measurement: String,
    pub field: String,
    pub aggregate: Aggregate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Group-by bucket such as `1m`
    pub interval: Option<String>,
    /// Equality filters, sorted by tag name
    pub tags: Vec<(String, String)>,
}

impl AggregateQuery {
    /// Build a query from HTTP query-string parameters
    pub fn from_params(params: &HashMap<String, String>) -> QueryResult<Self> {
        let measurement = identifier(required(params, "measurement")?, "measurement")?;
        let field = identifier(required(params, "field")?, "field")?;
        let aggregate = required(params, "aggregate")?.parse()?;
        let start = timestamp(required(params, "start")?, "start")?;
        let end = timestamp(required(params, "end")?, "end")?;

        if start >= end {
            return Err(QueryError::InvalidQuery(
                "start must be before end".to_string(),
            ));
        }

        let interval = params
            .get("interval")
            .map(|raw| duration_literal(raw))
            .transpose()?;

        let mut tags = Vec::new();
        for (key, value) in params {
            if let Some(name) = key.strip_prefix(TAG_PREFIX) {
                tags.push((identifier(name, "tag name")?, tag_value(value)?));
            }
        }
        if tags.len() > MAX_TAG_FILTERS {
            return Err(QueryError::InvalidQuery(format!(
                "too many tag filters (max {})",
                MAX_TAG_FILTERS
            )));
        }
        tags.sort();

        Ok(Self {
            measurement,
            field,
            aggregate,
            start,
            end,
            interval,
            tags,
        })
    }

    /// Render as an InfluxQL statement
    pub fn to_influxql(&self) -> String {
        let mut sql = format!(
            "SELECT {}(\"{}\") AS \"value\" FROM \"{}\" WHERE time >= '{}' AND time < '{}'",
            self.aggregate.as_influxql(),
            self.field,
            self.measurement,
            self.start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.end.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );

        for (name, value) in &self.tags {
            sql.push_str(&format!(" AND \"{}\" = '{}'", name, escape_string(value)));
        }

        if let Some(interval) = &self.interval {
            sql.push_str(&format!(" GROUP BY time({}) fill(none)", interval));
        }

        sql
    }
}

impl fmt::Display for AggregateQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}.{})",
            self.aggregate.as_influxql(),
            self.measurement,
            self.field
        )
    }
}

/// Store that answers aggregate queries with a JSON result
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn aggregate(&self, query: &AggregateQuery) -> QueryResult<serde_json::Value>;
}

fn required<'a>(params: &'a HashMap<String, String>, name: &str) -> QueryResult<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| QueryError::InvalidQuery(format!("missing parameter '{}'", name)))
}

fn identifier(raw: &str, what: &str) -> QueryResult<String> {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_IDENTIFIER_LENGTH
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));

    if valid {
        Ok(raw.to_string())
    } else {
        Err(QueryError::InvalidQuery(format!("invalid {} '{}'", what, raw)))
    }
}

fn tag_value(raw: &str) -> QueryResult<String> {
    if raw.len() > MAX_TAG_VALUE_LENGTH || raw.chars().any(char::is_control) {
        return Err(QueryError::InvalidQuery("invalid tag value".to_string()));
    }
    Ok(raw.to_string())
}

fn timestamp(raw: &str, what: &str) -> QueryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueryError::InvalidQuery(format!("invalid {} '{}': {}", what, raw, e)))
}

/// Accept InfluxQL duration literals like `10s`, `1m`, `500ms`
fn duration_literal(raw: &str) -> QueryResult<String> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (amount, unit) = raw.split_at(split);

    let amount_ok = amount.parse::<u64>().map(|n| n > 0).unwrap_or(false);
    let unit_ok = matches!(unit, "ns" | "u" | "µ" | "ms" | "s" | "m" | "h" | "d" | "w");

    if amount_ok && unit_ok {
        Ok(raw.to_string())
    } else {
        Err(QueryError::InvalidQuery(format!("invalid interval '{}'", raw)))
    }
}

fn escape_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
