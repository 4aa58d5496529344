//! Kafka protocol backend, usable against plain Kafka clusters and Event Hubs
//! namespaces exposing their Kafka endpoint.
//!
//! Entities map to topics and partition ids are the decimal topic partition numbers.
//! Processor groups are Kafka consumer groups; checkpoints go to the configured
//! checkpoint store and are mirrored into the group's committed offsets, so a
//! restarted group resumes after the last checkpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::metadata::Metadata;
use rdkafka::{ClientConfig, Message};
use tracing::debug;

use crate::broker::{Connector, ConsumerClient, ProcessorHandle, ProcessorOptions, ProducerClient};
use crate::checkpoint_store::{CheckpointStorage, CheckpointStore};
use crate::config::{EventHubConfig, KafkaConfig};
use crate::connection::{ConnectionStringProvider, NamespaceEndpoint, StaticConnectionString};
use crate::error::{EventHubError, Result};
use crate::processor::ProcessorCallbacks;
use crate::types::{EventData, ReceivedEvent};

mod consumer;
mod processor;
mod producer;

pub use consumer::KafkaConsumerClient;
pub use processor::KafkaProcessor;
pub use producer::KafkaProducerClient;

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

pub struct KafkaConnector {
    endpoint: NamespaceEndpoint,
    config: KafkaConfig,
    storage: CheckpointStorage,
}

impl KafkaConnector {
    pub fn new(
        provider: &dyn ConnectionStringProvider,
        config: KafkaConfig,
        storage: CheckpointStorage,
    ) -> Result<Self> {
        let endpoint = NamespaceEndpoint::parse(&provider.connection_string()?)?;
        debug!(
            bootstrap_servers = endpoint.bootstrap_servers(),
            "kafka connector configured"
        );
        Ok(Self {
            endpoint,
            config,
            storage,
        })
    }

    /// Connector and checkpoint storage both resolved from environment configuration.
    pub async fn from_config(config: &EventHubConfig) -> Result<Self> {
        let storage = CheckpointStorage::connect(
            &config.checkpoint_storage_connection_string,
            config.checkpoint_storage_region.as_deref(),
        )
        .await?;
        Self::new(
            &StaticConnectionString::new(config.eventhub_connection_string.as_str()),
            config.kafka.clone(),
            storage,
        )
    }

    pub fn endpoint(&self) -> &NamespaceEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    async fn producer(&self, entity_name: &str) -> Result<Arc<dyn ProducerClient>> {
        let producer: Arc<dyn ProducerClient> =
            Arc::new(
            KafkaProducerClient::connect(&self.endpoint, &self.config, entity_name).await?,
        );
        Ok(producer)
    }

    async fn consumer(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Result<Arc<dyn ConsumerClient>> {
        let consumer: Arc<dyn ConsumerClient> = Arc::new(KafkaConsumerClient::connect(
            &self.endpoint,
            &self.config,
            entity_name,
            consumer_group,
        )
        .await?);
        Ok(consumer)
    }

    async fn checkpoint_store(&self, container: &str) -> Result<Arc<dyn CheckpointStore>> {
        Ok(self.storage.store(container))
    }

    async fn start_processor(
        &self,
        entity_name: &str,
        consumer_group: &str,
        options: ProcessorOptions,
        store: Arc<dyn CheckpointStore>,
        callbacks: ProcessorCallbacks,
    ) -> Result<Box<dyn ProcessorHandle>> {
        let processor = KafkaProcessor::start(
            &self.endpoint,
            &self.config,
            entity_name,
            consumer_group,
            options,
            store,
            callbacks,
        )?;
        Ok(Box::new(processor))
    }
}

/// Settings shared by every client: brokers, statistics, and transport security.
fn client_config(endpoint: &NamespaceEndpoint, config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", endpoint.bootstrap_servers())
        .set("statistics.interval.ms", "10000");

    match endpoint {
        NamespaceEndpoint::Namespace {
            sasl_username,
            sasl_password,
            ..
        } => {
            client_config
                .set("security.protocol", "sasl_ssl")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", sasl_username)
                .set("sasl.password", sasl_password);
        }
        NamespaceEndpoint::Bootstrap(_) => {
            if config.kafka_tls {
                client_config
                    .set("security.protocol", "ssl")
                    .set("enable.ssl.certificate.verification", "false");
            }
        }
    }

    client_config
}

/// Partition numbers of `topic`, failing when the broker does not know it.
fn topic_partitions(metadata: &Metadata, topic: &str) -> Result<Vec<i32>> {
    let Some(found) = metadata.topics().iter().find(|t| t.name() == topic) else {
        return Err(EventHubError::connection(format!("topic {topic} not found")));
    };
    if let Some(e) = found.error() {
        return Err(EventHubError::connection(format!(
            "metadata for topic {topic} returned {e:?}"
        )));
    }

    let mut partitions: Vec<i32> = found.partitions().iter().map(|p| p.id()).collect();
    partitions.sort_unstable();
    Ok(partitions)
}

fn parse_partition(partition_id: &str) -> Result<i32> {
    partition_id
        .parse::<i32>()
        .ok()
        .filter(|p| *p >= 0)
        .ok_or_else(|| {
            EventHubError::invalid_argument(format!("invalid partition id: {partition_id}"))
        })
}

fn event_headers(event: &EventData) -> Option<OwnedHeaders> {
    if event.properties.is_empty() {
        return None;
    }
    let headers = event
        .properties
        .iter()
        .fold(OwnedHeaders::new(), |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        });
    Some(headers)
}

/// Convert a consumed record. Header values that are not UTF-8 are skipped.
fn received_event<M: Message>(message: &M) -> ReceivedEvent {
    let body = message
        .payload()
        .map(Bytes::copy_from_slice)
        .unwrap_or_default();

    let mut data = EventData::new(body);
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) {
                data.properties
                    .insert(header.key.to_string(), value.to_string());
            }
        }
    }

    ReceivedEvent {
        data,
        partition_id: message.partition().to_string(),
        offset: message.offset(),
        sequence_number: message.offset(),
        enqueued_time: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
    }
}
