use axum::extract::ws::Utf8Bytes;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::pipeline::{Batch, FlushReason, RawEvent};

/// Unique identifier for a subscriber connection
pub type SubscriberId = Uuid;

/// Which projection of each batch a subscriber receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadView {
    /// Every event in the batch
    #[default]
    Full,
    /// Truncated view with the batch's total count
    Summary,
}

impl FromStr for PayloadView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(PayloadView::Full),
            "summary" | "truncated" => Ok(PayloadView::Summary),
            other => Err(format!("unknown payload view: {}", other)),
        }
    }
}

/// What to do with a subscriber whose buffer is full at broadcast time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Unregister the subscriber; it must reconnect
    #[default]
    Evict,
    /// Drop this batch for the subscriber and keep it registered
    Skip,
}

impl FromStr for SlowConsumerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "evict" => Ok(SlowConsumerPolicy::Evict),
            "skip" => Ok(SlowConsumerPolicy::Skip),
            other => Err(format!("unknown slow consumer policy: {}", other)),
        }
    }
}

/// Per-connection settings used by the WebSocket gateway
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Outgoing frames buffered per subscriber
    pub buffer: usize,
    /// Upper bound on a single socket write
    pub send_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            buffer: 16,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// One event as delivered to subscribers
///
/// JSON payloads are embedded as-is; anything else is base64 encoded and
/// flagged through `encoding`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub partition: i32,
    pub offset: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub encoding: Option<String>,
}

impl From<&RawEvent> for EventFrame {
    fn from(event: &RawEvent) -> Self {
        let (payload, encoding) = match serde_json::from_slice(&event.payload) {
            Ok(value) => (value, None),
            Err(_) => (
                serde_json::Value::String(BASE64.encode(&event.payload)),
                Some("base64".to_string()),
            ),
        };

        Self {
            partition: event.partition,
            offset: event.offset,
            key: event
                .key
                .as_ref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            timestamp: event.timestamp,
            payload,
            encoding,
        }
    }
}

/// Messages sent from the gateway to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after registration
    Connected {
        subscriber_id: SubscriberId,
        view: PayloadView,
    },

    /// A complete batch
    Batch {
        batch_id: Uuid,
        sequence: u64,
        reason: FlushReason,
        closed_at: DateTime<Utc>,
        count: usize,
        events: Vec<EventFrame>,
    },

    /// A truncated batch; `count` is the size of the whole batch
    Summary {
        batch_id: Uuid,
        sequence: u64,
        reason: FlushReason,
        closed_at: DateTime<Utc>,
        count: usize,
        events: Vec<EventFrame>,
    },

    /// Acknowledge a client message
    Ack,

    /// Error response
    Error { message: String, code: String },

    /// The subscriber fell behind and was dropped
    Evicted { reason: String },
}

/// Messages accepted from subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Heartbeat,
    SetView { view: PayloadView },
    Disconnect,
}

/// A batch serialized once per view, shared by every subscriber
#[derive(Debug, Clone)]
pub struct BatchFrames {
    pub full: Utf8Bytes,
    pub summary: Utf8Bytes,
}

impl BatchFrames {
    pub fn new(full: impl Into<Utf8Bytes>, summary: impl Into<Utf8Bytes>) -> Self {
        Self {
            full: full.into(),
            summary: summary.into(),
        }
    }

    pub fn encode(batch: &Batch, truncate_size: usize) -> Result<Self, serde_json::Error> {
        let full = ServerMessage::Batch {
            batch_id: batch.id(),
            sequence: batch.sequence(),
            reason: batch.reason(),
            closed_at: batch.closed_at(),
            count: batch.len(),
            events: batch.events().iter().map(EventFrame::from).collect(),
        };

        let view = batch.truncated(truncate_size);
        let summary = ServerMessage::Summary {
            batch_id: batch.id(),
            sequence: batch.sequence(),
            reason: batch.reason(),
            closed_at: batch.closed_at(),
            count: view.total(),
            events: view.events().iter().map(EventFrame::from).collect(),
        };

        Ok(Self::new(
            serde_json::to_string(&full)?,
            serde_json::to_string(&summary)?,
        ))
    }

    pub fn for_view(&self, view: PayloadView) -> Utf8Bytes {
        match view {
            PayloadView::Full => self.full.clone(),
            PayloadView::Summary => self.summary.clone(),
        }
    }
}
