use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::checkpoint_store::CheckpointStore;
use crate::error::{EventHubError, Result};
use crate::types::{Checkpoint, CloseReason, EntityRef, ReceivedEvent};

pub type OpenFn = Arc<dyn Fn(PartitionContext) + Send + Sync>;
pub type CloseFn = Arc<dyn Fn(PartitionContext, CloseReason) + Send + Sync>;
pub type EventsFn =
    Arc<dyn Fn(PartitionContext, Vec<ReceivedEvent>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(Option<PartitionContext>, EventHubError) + Send + Sync>;

/// The four callbacks a broker invokes on a processor group.
///
/// `on_open`/`on_close` are never invoked concurrently for the same partition: a
/// partition is reopened only after its previous owner has been closed. `on_events` is
/// invoked sequentially per partition but concurrently across partitions.
#[derive(Clone)]
pub struct ProcessorCallbacks {
    pub on_open: OpenFn,
    pub on_close: CloseFn,
    pub on_events: EventsFn,
    pub on_error: ErrorFn,
}

impl ProcessorCallbacks {
    /// Callbacks that do nothing, for tests and for backends to fill in piecemeal.
    pub fn noop() -> Self {
        Self {
            on_open: Arc::new(|_| {}),
            on_close: Arc::new(|_, _| {}),
            on_events: Arc::new(|_, _| Box::pin(async {})),
            on_error: Arc::new(|_, _| {}),
        }
    }
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Ownership token for one partition, handed out by the broker on open.
///
/// Every call to [`PartitionContext::new`] is a distinct ownership; clones share it.
#[derive(Clone)]
pub struct PartitionContext {
    entity: EntityRef,
    partition_id: String,
    generation: u64,
    store: Arc<dyn CheckpointStore>,
}

impl PartitionContext {
    pub fn new(entity: EntityRef, partition_id: String, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            entity,
            partition_id,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            store,
        }
    }

    /// True when both tokens stand for the same ownership of the same partition.
    pub fn same_ownership(&self, other: &PartitionContext) -> bool {
        self.generation == other.generation && self.partition_id == other.partition_id
    }

    /// Offset of the durable checkpoint for this partition, if any.
    pub async fn committed_offset(&self) -> Result<Option<i64>> {
        let checkpoints = self
            .store
            .list_checkpoints(self.entity.entity_name(), self.entity.consumer_group())
            .await?;
        Ok(checkpoints
            .into_iter()
            .find(|c| c.partition_id == self.partition_id)
            .map(|c| c.offset))
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub async fn update_checkpoint(&self, event: &ReceivedEvent) -> Result<()> {
        if event.partition_id != self.partition_id {
            return Err(EventHubError::checkpoint(
                event.partition_id.clone(),
                format!(
                    "event belongs to partition {} but context owns {}",
                    event.partition_id, self.partition_id
                ),
            ));
        }

        self.store
            .update_checkpoint(Checkpoint::for_event(&self.entity, event))
            .await
    }
}

impl fmt::Debug for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionContext")
            .field("entity", &self.entity)
            .field("partition_id", &self.partition_id)
            .field("generation", &self.generation)
            .field("container", &self.store.container())
            .finish()
    }
}
