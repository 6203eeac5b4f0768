//! Kafka sink (`type = "kafka"`)
//!
//! Produces one message per line: a fresh UUID v4 as key, the raw line text
//! as value. `close` flushes whatever the producer still has queued.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use uuid::Uuid;

use super::Sink;
use crate::config::KafkaSinkConfig;
use crate::error::{Error, Result};
use crate::types::LogLine;

/// How long a message may wait in the producer queue.
const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close` waits for outstanding deliveries.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Sink producing to one topic.
pub struct BrokerSink {
    name: String,
    topic: String,
    producer: FutureProducer,
}

impl std::fmt::Debug for BrokerSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSink")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl BrokerSink {
    pub fn new(name: &str, config: &KafkaSinkConfig) -> Result<Self> {
        let bootstrap = config.bootstrap_servers();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap)
            .set("client.id", format!("isengard-{}", name))
            .set("message.timeout.ms", "30000")
            .create()?;

        tracing::debug!(sink = name, brokers = %bootstrap, topic = %config.topic, "Created Kafka producer");

        Ok(Self {
            name: name.to_string(),
            topic: config.topic.clone(),
            producer,
        })
    }
}

#[async_trait]
impl Sink for BrokerSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, line: &LogLine) -> Result<()> {
        let key = Uuid::new_v4().to_string();
        let record = FutureRecord::to(&self.topic)
            .key(key.as_str())
            .payload(line.text.as_str());

        let (partition, offset) = self
            .producer
            .send(record, QUEUE_TIMEOUT)
            .await
            .map_err(|(e, _)| e)?;

        tracing::trace!(sink = %self.name, partition, offset, "Produced line");
        Ok(())
    }

    /// Flushes on the blocking pool, so a caller's timeout can give up on it
    /// without stalling a runtime worker.
    async fn close(&self) -> Result<()> {
        tracing::debug!(sink = %self.name, "Flushing Kafka producer");
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(FLUSH_TIMEOUT)))
            .await
            .map_err(|e| Error::Sink {
                sink: self.name.clone(),
                message: format!("flush task failed: {}", e),
            })??;
        Ok(())
    }
}
