//! Kafka log source.
//!
//! Consumes a single topic partition with rdkafka's `StreamConsumer`,
//! assigned explicitly at the newest offset so no historical backlog is
//! replayed. Offsets are never committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{info, warn};

use crate::pipeline::RawEvent;
use crate::source::{LogDescriptor, LogSource, SourceError, SourceResult};

/// Kafka source positioned at the newest offset of one partition
pub struct KafkaLogSource {
    consumer: StreamConsumer,
    descriptor: LogDescriptor,
}

impl KafkaLogSource {
    /// Connect, verify the topic partition exists and assign it at the end offset
    ///
    /// Blocks the calling thread for up to `timeout` while fetching metadata,
    /// so call it during startup.
    pub fn connect(
        descriptor: &LogDescriptor,
        group_id: &str,
        timeout: Duration,
    ) -> SourceResult<Self> {
        info!(
            "Connecting to Kafka at {} (topic={}, partition={})",
            descriptor.brokers, descriptor.topic, descriptor.partition
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &descriptor.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| SourceError::Connection(format!("failed to create consumer: {}", e)))?;

        let metadata = consumer
            .fetch_metadata(Some(&descriptor.topic), timeout)
            .map_err(|e| SourceError::Connection(format!("failed to fetch metadata: {}", e)))?;

        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == descriptor.topic)
            .ok_or_else(|| {
                SourceError::Connection(format!("topic '{}' not found", descriptor.topic))
            })?;

        if let Some(err) = topic.error() {
            return Err(SourceError::Connection(format!(
                "topic '{}' unavailable: {:?}",
                descriptor.topic, err
            )));
        }

        if !topic
            .partitions()
            .iter()
            .any(|p| p.id() == descriptor.partition)
        {
            return Err(SourceError::Connection(format!(
                "partition {} not found in topic '{}'",
                descriptor.partition, descriptor.topic
            )));
        }

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&descriptor.topic, descriptor.partition, Offset::End)
            .map_err(|e| SourceError::Connection(format!("invalid assignment: {}", e)))?;
        consumer
            .assign(&assignment)
            .map_err(|e| SourceError::Connection(format!("failed to assign partition: {}", e)))?;

        info!("Kafka source assigned at newest offset");

        Ok(Self {
            consumer,
            descriptor: descriptor.clone(),
        })
    }
}

/// Errors that cannot clear up by retrying the pull
fn classify(error: KafkaError) -> SourceError {
    let terminal = matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownPartition
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::Fatal
        )
    );

    if terminal {
        SourceError::Terminal(error.to_string())
    } else {
        SourceError::Transient(error.to_string())
    }
}

#[async_trait]
impl LogSource for KafkaLogSource {
    async fn next_event(&mut self) -> SourceResult<RawEvent> {
        let message = self.consumer.recv().await.map_err(classify)?;

        Ok(RawEvent {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
            received_at: Utc::now(),
        })
    }

    async fn close(&mut self) {
        if let Err(e) = self.consumer.unassign() {
            warn!("Failed to unassign Kafka partition: {}", e);
        }
        info!("Kafka source released");
    }

    fn describe(&self) -> String {
        self.descriptor.to_string()
    }
}
