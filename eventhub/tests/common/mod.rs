#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eventhub::checkpoint_store::{CheckpointStorage, CheckpointStore};
use eventhub::processor::ProcessorCallbacks;
use eventhub::types::Checkpoint;
use eventhub::{
    BatchConsumer, ClientFactory, ClientFactoryOptions, Connector, ConsumerClient, EventBatch,
    EventHubTemplate, InMemoryBroker, ProcessorHandle, ProcessorOptions, ProducerClient,
    Result,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Records every batch it is handed.
#[derive(Default)]
pub struct RecordingConsumer {
    batches: Mutex<Vec<EventBatch>>,
}

impl RecordingConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<EventBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.batches()
            .iter()
            .flat_map(|batch| batch.events.iter())
            .map(|e| e.data.body_as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.batches().iter().map(EventBatch::len).sum()
    }
}

#[async_trait]
impl BatchConsumer for RecordingConsumer {
    async fn consume(&self, batch: EventBatch) {
        self.batches.lock().unwrap().push(batch);
    }
}

/// A recording consumer and the trait object registered with the template. Subscribe
/// and unsubscribe with the same `handle`.
pub fn recorder() -> (Arc<RecordingConsumer>, Arc<dyn BatchConsumer>) {
    let recording = RecordingConsumer::new();
    let handle: Arc<dyn BatchConsumer> = recording.clone();
    (recording, handle)
}

pub fn factory_options() -> ClientFactoryOptions {
    ClientFactoryOptions {
        shutdown_grace: Duration::from_secs(1),
        ..ClientFactoryOptions::default()
    }
}

pub fn template(broker: &Arc<InMemoryBroker>) -> EventHubTemplate {
    let factory = ClientFactory::new(broker.clone(), factory_options());
    EventHubTemplate::new(Arc::new(factory))
}

/// Broker whose checkpoints land in `storage`, so tests can read them back.
pub fn broker_with_storage(partitions: usize) -> (Arc<InMemoryBroker>, CheckpointStorage) {
    let storage = CheckpointStorage::in_memory();
    let broker = Arc::new(InMemoryBroker::new(partitions).with_checkpoint_storage(storage.clone()));
    (broker, storage)
}

pub async fn checkpoints(storage: &CheckpointStorage, entity: &str, group: &str) -> Vec<Checkpoint> {
    storage
        .store(entity)
        .list_checkpoints(entity, group)
        .await
        .unwrap()
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Wait until the committed checkpoint of one partition reaches `offset`.
pub async fn wait_for_checkpoint(
    storage: &CheckpointStorage,
    entity: &str,
    group: &str,
    partition_id: &str,
    offset: i64,
) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let committed = checkpoints(storage, entity, group)
                .await
                .into_iter()
                .find(|c| c.partition_id == partition_id)
                .map(|c| c.offset);
            if committed == Some(offset) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("checkpoint not committed in time");
}

/// Connector over an in-memory broker that keeps the callbacks of every processor it
/// starts, so tests can drive them directly.
pub struct CallbackCapture {
    broker: Arc<InMemoryBroker>,
    callbacks: Mutex<Vec<ProcessorCallbacks>>,
}

impl CallbackCapture {
    pub fn new(broker: Arc<InMemoryBroker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn callbacks(&self) -> Vec<ProcessorCallbacks> {
        self.callbacks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for CallbackCapture {
    async fn producer(&self, entity_name: &str) -> Result<Arc<dyn ProducerClient>> {
        self.broker.producer(entity_name).await
    }

    async fn consumer(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Result<Arc<dyn ConsumerClient>> {
        self.broker.consumer(entity_name, consumer_group).await
    }

    async fn checkpoint_store(&self, container: &str) -> Result<Arc<dyn CheckpointStore>> {
        self.broker.checkpoint_store(container).await
    }

    async fn start_processor(
        &self,
        entity_name: &str,
        consumer_group: &str,
        options: ProcessorOptions,
        store: Arc<dyn CheckpointStore>,
        callbacks: ProcessorCallbacks,
    ) -> Result<Box<dyn ProcessorHandle>> {
        self.callbacks.lock().unwrap().push(callbacks.clone());
        self.broker
            .start_processor(entity_name, consumer_group, options, store, callbacks)
            .await
    }
}
