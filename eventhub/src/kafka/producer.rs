use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info};

use super::{client_config, event_headers, parse_partition, METADATA_TIMEOUT};
use crate::broker::ProducerClient;
use crate::config::KafkaConfig;
use crate::connection::NamespaceEndpoint;
use crate::error::{EventHubError, Result};
use crate::types::{EventData, SendTarget};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Producer bound to one topic.
pub struct KafkaProducerClient {
    producer: FutureProducer,
    topic: String,
    queue_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaProducerClient {
    pub async fn connect(
        endpoint: &NamespaceEndpoint,
        config: &KafkaConfig,
        topic: &str,
    ) -> Result<Self> {
        let mut client_config = client_config(endpoint, config);
        client_config
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        let producer = create_producer(client_config, topic.to_string(), METADATA_TIMEOUT).await?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
            queue_timeout: Duration::from_millis(u64::from(config.kafka_message_timeout_ms)),
            closed: AtomicBool::new(false),
        })
    }
}

/// Create the producer and "ping" the brokers by requesting metadata. Both block, so
/// they run off the async workers.
async fn create_producer(
    client_config: ClientConfig,
    topic: String,
    metadata_timeout: Duration,
) -> Result<FutureProducer> {
    tokio::task::spawn_blocking(move || -> Result<FutureProducer> {
        let producer: FutureProducer = client_config.create()?;
        match producer.client().fetch_metadata(None, metadata_timeout) {
            Ok(metadata) => {
                info!(
                    topic,
                    brokers = metadata.brokers().len(),
                    "connected producer to kafka brokers"
                );
                Ok(producer)
            }
            Err(e) => {
                error!(topic, error = %e, "failed to fetch metadata from kafka brokers");
                Err(e.into())
            }
        }
    })
    .await
    .map_err(|e| EventHubError::connection(format!("producer connect task failed: {e}")))?
}

#[async_trait]
impl ProducerClient for KafkaProducerClient {
    async fn send(&self, event: EventData, target: &SendTarget) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventHubError::connection(format!(
                "producer for {} is closed",
                self.topic
            )));
        }

        let mut record: FutureRecord<'_, str, [u8]> =
            FutureRecord::to(&self.topic).payload(event.body.as_ref());
        if let Some(headers) = event_headers(&event) {
            record = record.headers(headers);
        }
        record = match target {
            SendTarget::Partition(partition_id) => record.partition(parse_partition(partition_id)?),
            SendTarget::Key(key) => record.key(key.as_str()),
            SendTarget::Any => record,
        };

        match self
            .producer
            .send(record, Timeout::After(self.queue_timeout))
            .await
        {
            Ok(_) => Ok(()),
            Err((e, _)) => {
                error!(topic = %self.topic, error = %e, "failed to produce to kafka");
                Err(e.into())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
            .await
            .map_err(|e| EventHubError::connection(format!("producer flush task failed: {e}")))?;
        flushed?;
        debug!(topic = %self.topic, "kafka producer flushed and closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test(flavor = "current_thread")]
    async fn test_unreachable_brokers_do_not_stall_the_runtime() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", "127.0.0.1:1");
        let result =
            create_producer(client_config, "orders".to_string(), Duration::from_millis(500)).await;
        ticker.abort();

        assert!(matches!(result, Err(EventHubError::ConnectionFailure(_))));
        assert!(ticks.load(Ordering::SeqCst) >= 10);
    }
}
