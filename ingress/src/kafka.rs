use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::debug;

use crate::{PublishError, QueuePublisher};

/// Forwards accepted submissions onto the order topic, headers included.
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(bootstrap_servers: &str, topic: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("Failed to create Kafka producer")?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

impl QueuePublisher for KafkaPublisher {
    async fn publish(
        &self,
        payload: &str,
        headers: &HashMap<String, String>,
    ) -> std::result::Result<(), PublishError> {
        let mut kafka_headers = OwnedHeaders::new();
        for (key, value) in headers {
            kafka_headers = kafka_headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::<(), str>::to(&self.topic)
            .payload(payload)
            .headers(kafka_headers);

        let (partition, offset) = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| PublishError::Failed {
                reason: e.to_string(),
            })?;

        debug!(partition, offset, "forwarded order message to queue");
        Ok(())
    }
}
