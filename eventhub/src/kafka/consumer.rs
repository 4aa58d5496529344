use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::{client_config, parse_partition, received_event, topic_partitions, METADATA_TIMEOUT};
use crate::broker::ConsumerClient;
use crate::config::KafkaConfig;
use crate::connection::NamespaceEndpoint;
use crate::error::{EventHubError, Result};
use crate::types::ReceivedEvent;

/// After the first record, how long to keep waiting for more to fill a read.
const FILL_WAIT: Duration = Duration::from_millis(50);

/// Direct partition reader. Never joins the consumer group and never commits;
/// each read assigns the requested partition at the requested offset.
pub struct KafkaConsumerClient {
    consumer: StreamConsumer,
    topic: String,
    consumer_group: String,
    // one assignment at a time
    read_lock: Mutex<()>,
    closed: AtomicBool,
}

impl KafkaConsumerClient {
    pub async fn connect(
        endpoint: &NamespaceEndpoint,
        config: &KafkaConfig,
        topic: &str,
        consumer_group: &str,
    ) -> Result<Self> {
        let mut client_config = client_config(endpoint, config);
        client_config
            .set("group.id", consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        // the metadata check blocks, keep it off the async workers
        let owned_topic = topic.to_string();
        let (consumer, partitions) = tokio::task::spawn_blocking(move || -> Result<_> {
            let consumer: StreamConsumer = client_config.create()?;
            let metadata = consumer.fetch_metadata(Some(owned_topic.as_str()), METADATA_TIMEOUT)?;
            let partitions = topic_partitions(&metadata, &owned_topic)?;
            Ok((consumer, partitions))
        })
        .await
        .map_err(|e| EventHubError::connection(format!("consumer connect task failed: {e}")))??;

        debug!(
            topic,
            consumer_group,
            partitions = partitions.len(),
            "connected kafka consumer"
        );

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            consumer_group: consumer_group.to_string(),
            read_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventHubError::connection(format!(
                "consumer for {}/{} is closed",
                self.topic, self.consumer_group
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    async fn partition_ids(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let metadata = self
            .consumer
            .fetch_metadata(Some(self.topic.as_str()), METADATA_TIMEOUT)?;
        Ok(topic_partitions(&metadata, &self.topic)?
            .into_iter()
            .map(|p| p.to_string())
            .collect())
    }

    async fn read_partition(
        &self,
        partition_id: &str,
        from_offset: i64,
        max_events: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedEvent>> {
        self.ensure_open()?;
        let partition = parse_partition(partition_id)?;
        if from_offset < 0 {
            return Err(EventHubError::invalid_argument(format!(
                "offset can't be negative: {from_offset}"
            )));
        }

        let _guard = self.read_lock.lock().await;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(from_offset))?;
        self.consumer.assign(&tpl)?;

        let mut events = Vec::new();
        let deadline = Instant::now() + max_wait;
        while events.len() < max_events {
            let wait = if events.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                FILL_WAIT
            };

            match timeout(wait, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    if message.partition() == partition && message.offset() >= from_offset {
                        events.push(received_event(&message));
                    }
                }
                Ok(Err(e)) => {
                    warn!(topic = %self.topic, partition, error = %e, "error reading partition");
                    if events.is_empty() {
                        return Err(e.into());
                    }
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(events)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.read_lock.lock().await;
        self.consumer.unassign()?;
        debug!(topic = %self.topic, consumer_group = %self.consumer_group, "kafka consumer closed");
        Ok(())
    }
}
