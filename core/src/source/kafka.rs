use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::KafkaOptions;
use crate::errors::SourceError;
use crate::message::InboundMessage;
use crate::source::{PolledBatch, Source, SourceOffsets};

const MESSAGE_TIMEOUT_MS: u64 = 5_000;
const RETRY_BACKOFF_MS: u64 = 200;
const MAX_RETRY_BACKOFF_MS: u64 = 5_000;

pub struct KafkaSource {
    client: KafkaConsumerClient,
    batch_size: usize,
    batch_timeout_ms: u64,
}

impl KafkaSource {
    pub async fn new(config: &KafkaOptions) -> std::result::Result<Self, SourceError> {
        let client = KafkaConsumerClient::new(config)
            .map_err(|e| SourceError::Unrecoverable(e.into()))?;
        client.subscribe().await.map_err(|e| SourceError::Connection {
            source: e.into(),
        })?;

        Ok(Self {
            client,
            batch_size: config.max_poll_records.unwrap_or(100) as usize,
            batch_timeout_ms: 1000,
        })
    }
}

impl Source for KafkaSource {
    async fn poll_batch(&mut self) -> std::result::Result<PolledBatch, SourceError> {
        let records = self
            .client
            .consume_batch(self.batch_size, self.batch_timeout_ms)
            .await?;

        let mut batch = PolledBatch::default();
        for record in records {
            let Some(payload) = record.payload else {
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    "dropping record with no payload"
                );
                batch.rejected += 1;
                continue;
            };
            match InboundMessage::from_parts(
                payload,
                record.headers,
                record.partition,
                record.offset,
            ) {
                Ok(message) => batch.messages.push(message),
                Err(e) => {
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "rejecting record at intake"
                    );
                    batch.rejected += 1;
                }
            }
        }
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &SourceOffsets) -> std::result::Result<(), SourceError> {
        self.client.commit_offsets(offsets).await
    }

    async fn seek(&mut self, offsets: &SourceOffsets) -> std::result::Result<(), SourceError> {
        self.client.seek(offsets).await
    }

    async fn shutdown(&mut self) -> std::result::Result<(), SourceError> {
        // the rdkafka consumer closes when dropped
        Ok(())
    }
}

/// A record pulled off the wire before the intake gate runs.
#[derive(Debug, Clone)]
pub struct KafkaRecord {
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<String>,
    pub headers: HashMap<String, String>,
}

pub struct KafkaConsumerClient {
    consumer: StreamConsumer,
    config: KafkaOptions,
}

impl KafkaConsumerClient {
    pub fn new(config: &KafkaOptions) -> Result<Self> {
        let consumer: StreamConsumer = build_client_config(config)
            .create()
            .context("Failed to create Kafka consumer")?;

        Ok(Self {
            consumer,
            config: config.clone(),
        })
    }

    pub async fn subscribe(&self) -> Result<()> {
        let topics = vec![self.config.topic.as_str()];
        self.consumer
            .subscribe(&topics)
            .context("Failed to subscribe to Kafka topic")?;

        info!("Subscribed to Kafka topic: {}", self.config.topic);
        Ok(())
    }

    /// Collect up to `batch_size` records, waiting at most `timeout_ms`.
    /// Transient broker errors are retried internally with capped backoff;
    /// authorization failures surface as unrecoverable.
    pub async fn consume_batch(
        &self,
        batch_size: usize,
        timeout_ms: u64,
    ) -> std::result::Result<Vec<KafkaRecord>, SourceError> {
        let mut records = Vec::new();
        let batch_timeout = Duration::from_millis(timeout_ms);
        let message_timeout = Duration::from_millis(MESSAGE_TIMEOUT_MS);

        let start_time = std::time::Instant::now();
        let mut retries: u32 = 0;

        while records.len() < batch_size && start_time.elapsed() < batch_timeout {
            match timeout(message_timeout, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    retries = 0;
                    records.push(convert_message(&message));
                    debug!(
                        "Received message from partition {} offset {}",
                        message.partition(),
                        message.offset()
                    );
                }
                Ok(Err(e)) => {
                    if is_authorization_failure(&e) {
                        return Err(SourceError::Unrecoverable(Box::new(e)));
                    }
                    retries += 1;
                    let backoff = Duration::from_millis(
                        (RETRY_BACKOFF_MS * u64::from(retries)).min(MAX_RETRY_BACKOFF_MS),
                    );
                    warn!(error = %e, retry = retries, "transient consume error, backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(_) => {
                    debug!("Message receive timeout, continuing...");
                    if records.is_empty() {
                        continue;
                    } else {
                        break;
                    }
                }
            }
        }

        if !records.is_empty() {
            debug!("Consumed batch of {} messages", records.len());
        }

        Ok(records)
    }

    pub async fn commit_offsets(
        &self,
        offsets: &SourceOffsets,
    ) -> std::result::Result<(), SourceError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for (&partition, &next_offset) in offsets {
            tpl.add_partition_offset(&self.config.topic, partition, Offset::Offset(next_offset))
                .map_err(|e| SourceError::Connection {
                    source: Box::new(e),
                })?;
        }

        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Sync)
            .map_err(|e| {
                if is_authorization_failure(&e) {
                    SourceError::Unrecoverable(Box::new(e))
                } else {
                    SourceError::Transient {
                        source: Box::new(e),
                    }
                }
            })?;

        debug!(?offsets, "Committed consumer offsets");
        Ok(())
    }

    /// Reposition assigned partitions to recovered offsets. When no
    /// assignment exists yet the committed group offsets already match the
    /// recovered checkpoint, so there is nothing to do.
    pub async fn seek(&self, offsets: &SourceOffsets) -> std::result::Result<(), SourceError> {
        let assignment = self.consumer.assignment().map_err(|e| SourceError::Connection {
            source: Box::new(e),
        })?;
        if assignment.count() == 0 {
            debug!("no partition assignment yet, resuming from committed offsets");
            return Ok(());
        }

        for (&partition, &next_offset) in offsets {
            self.consumer
                .seek(
                    &self.config.topic,
                    partition,
                    Offset::Offset(next_offset),
                    Duration::from_secs(10),
                )
                .map_err(|e| SourceError::Connection {
                    source: Box::new(e),
                })?;
        }
        info!(?offsets, "repositioned consumer to checkpoint offsets");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.config.topic), Duration::from_secs(10))
            .context("Failed to fetch metadata for health check")?;

        if metadata.topics().is_empty() {
            return Err(anyhow::anyhow!("Topic {} not found", self.config.topic));
        }

        let topic_metadata = &metadata.topics()[0];
        if topic_metadata.partitions().is_empty() {
            return Err(anyhow::anyhow!(
                "No partitions found for topic {}",
                self.config.topic
            ));
        }

        info!(
            "Health check passed for topic {} with {} partitions",
            self.config.topic,
            topic_metadata.partitions().len()
        );

        Ok(())
    }
}

fn build_client_config(config: &KafkaOptions) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", &config.consumer_group)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        // progress is committed by the checkpoint coordinator, never by the
        // consumer library's own timer
        .set("enable.auto.commit", "false")
        .set(
            "auto.offset.reset",
            config.auto_offset_reset.as_deref().unwrap_or("earliest"),
        );

    if let Some(timeout) = config.session_timeout_ms {
        client_config.set("session.timeout.ms", timeout.to_string());
    }

    if let Some(heartbeat) = config.heartbeat_interval_ms {
        client_config.set("heartbeat.interval.ms", heartbeat.to_string());
    }

    if let Some(security_protocol) = &config.security_protocol {
        client_config.set("security.protocol", security_protocol);
    }

    if let Some(sasl_mechanisms) = &config.sasl_mechanisms {
        client_config.set("sasl.mechanisms", sasl_mechanisms);
    }

    if let Some(sasl_username) = &config.sasl_username {
        client_config.set("sasl.username", sasl_username);
    }

    if let Some(sasl_password) = &config.sasl_password {
        client_config.set("sasl.password", sasl_password);
    }

    if let Some(ssl_ca_location) = &config.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }

    client_config
}

fn is_authorization_failure(e: &rdkafka::error::KafkaError) -> bool {
    matches!(
        e.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
        )
    )
}

fn convert_message(message: &rdkafka::message::BorrowedMessage) -> KafkaRecord {
    let payload = message
        .payload()
        .map(|p| String::from_utf8_lossy(p).to_string());

    let mut headers = HashMap::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).to_string(),
                );
            }
        }
    }

    KafkaRecord {
        partition: message.partition(),
        offset: message.offset(),
        payload,
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> KafkaOptions {
        KafkaOptions {
            bootstrap_servers: "localhost:9092".to_string(),
            topic: "cbec-orders".to_string(),
            consumer_group: "order-ingest".to_string(),
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            auto_offset_reset: None,
            session_timeout_ms: Some(30_000),
            heartbeat_interval_ms: Some(3_000),
            max_poll_records: Some(500),
        }
    }

    #[test]
    fn client_config_disables_auto_commit() {
        let config = build_client_config(&options());
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("group.id"), Some("order-ingest"));
        assert_eq!(config.get("session.timeout.ms"), Some("30000"));
    }
}
