//! Broker client surface consumed by the operation layer.
//!
//! Each backend (rdkafka, in-memory) implements these traits; nothing above this module
//! knows which broker it talks to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::checkpoint_store::CheckpointStore;
use crate::error::Result;
use crate::processor::ProcessorCallbacks;
use crate::types::{EventData, ReceivedEvent, SendTarget, StartPosition};

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a sending connection to one entity.
    async fn producer(&self, entity_name: &str) -> Result<Arc<dyn ProducerClient>>;

    /// Open a direct-read connection scoped to one consumer group of an entity.
    async fn consumer(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Result<Arc<dyn ConsumerClient>>;

    /// Handle on the checkpoint container; does not create it.
    async fn checkpoint_store(&self, container: &str) -> Result<Arc<dyn CheckpointStore>>;

    /// Register a processor for `(entity, group)` and start the broker driven
    /// rebalance and delivery loop.
    async fn start_processor(
        &self,
        entity_name: &str,
        consumer_group: &str,
        options: ProcessorOptions,
        store: Arc<dyn CheckpointStore>,
        callbacks: ProcessorCallbacks,
    ) -> Result<Box<dyn ProcessorHandle>>;
}

#[async_trait]
pub trait ProducerClient: Send + Sync {
    async fn send(&self, event: EventData, target: &SendTarget) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ConsumerClient: Send + Sync {
    async fn partition_ids(&self) -> Result<Vec<String>>;

    /// Read up to `max_events` starting at `from_offset`, waiting at most `max_wait`
    /// for the first one.
    async fn read_partition(
        &self,
        partition_id: &str,
        from_offset: i64,
        max_events: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedEvent>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ProcessorHandle: Send + Sync {
    /// Stop delivery. In-flight batches get up to `grace` to finish before the
    /// partitions are closed regardless.
    async fn stop(&self, grace: Duration) -> Result<()>;

    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Where partitions without a stored checkpoint start reading.
    pub start_position: StartPosition,
    pub max_batch_size: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            start_position: StartPosition::Latest,
            max_batch_size: 100,
        }
    }
}
