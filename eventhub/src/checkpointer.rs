//! Checkpointer - tracks owned partitions of one processor group and commits their positions
//!
//! Partitions are added when the broker opens them and removed when it closes them.
//! Commits are serialized per partition and only ever move forward: an older position
//! than the last committed one is a caller error, an equal one is a no-op. The committed
//! position outlives ownership, so a partition that is closed and reopened keeps it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EventHubError, Result};
use crate::metrics_consts::{CHECKPOINTS, PARTITIONS_OWNED};
use crate::processor::PartitionContext;
use crate::types::{EntityRef, ReceivedEvent};

struct OwnedPartition {
    context: PartitionContext,
    /// Last event handed to local consumers for this partition
    last_delivered: Option<ReceivedEvent>,
}

/// Offset of the last successful commit; the lock serializes commits
type CommitWatermark = Arc<Mutex<Option<i64>>>;

pub struct Checkpointer {
    entity: EntityRef,
    partitions: DashMap<String, OwnedPartition>,
    committed: DashMap<String, CommitWatermark>,
}

impl Checkpointer {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            partitions: DashMap::new(),
            committed: DashMap::new(),
        }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Register a partition the broker just opened for this process. A newer ownership
    /// of the same partition replaces the older one.
    pub fn add_partition(&self, context: PartitionContext) {
        let partition_id = context.partition_id().to_string();
        self.partitions.insert(
            partition_id.clone(),
            OwnedPartition {
                context,
                last_delivered: None,
            },
        );

        info!(
            entity = %self.entity,
            partition = partition_id,
            "partition opened"
        );
        self.report_owned();
    }

    /// Forget the ownership `context` stands for. Checkpoints for the partition fail
    /// from now on, unless it has been reopened under a newer ownership.
    pub fn remove_partition(&self, context: &PartitionContext) {
        let removed = self
            .partitions
            .remove_if(context.partition_id(), |_, owned| {
                owned.context.same_ownership(context)
            });
        match removed {
            Some(_) => debug!(
                entity = %self.entity,
                partition = context.partition_id(),
                "released partition"
            ),
            None if self.owns(context.partition_id()) => debug!(
                entity = %self.entity,
                partition = context.partition_id(),
                "close of a previous ownership, partition stays owned"
            ),
            None => {}
        }
        self.report_owned();
    }

    /// Remember the newest event handed out for a partition so that `checkpoint()`
    /// commits it. Returns false when the partition is not owned.
    pub fn record_delivery(&self, partition_id: &str, event: &ReceivedEvent) -> bool {
        match self.partitions.get_mut(partition_id) {
            Some(mut owned) => {
                owned.last_delivered = Some(event.clone());
                true
            }
            None => false,
        }
    }

    pub fn owns(&self, partition_id: &str) -> bool {
        self.partitions.contains_key(partition_id)
    }

    pub fn owned_partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> = self
            .partitions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        partitions.sort();
        partitions
    }

    /// Commit the most recently delivered event of every owned partition.
    ///
    /// Every partition is attempted; if any commit fails the first failure is returned.
    pub async fn checkpoint(&self) -> Result<()> {
        let pending: Vec<ReceivedEvent> = self
            .partitions
            .iter()
            .filter_map(|entry| entry.value().last_delivered.clone())
            .collect();

        let mut first_error = None;
        for event in pending {
            if let Err(e) = self.checkpoint_event(&event).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Commit the position of one specific event, independent of delivery order.
    pub async fn checkpoint_event(&self, event: &ReceivedEvent) -> Result<()> {
        let partition_id = event.partition_id.as_str();

        let Some(context) = self
            .partitions
            .get(partition_id)
            .map(|owned| owned.context.clone())
        else {
            return Err(self.not_owned(partition_id));
        };

        let commit_lock = self
            .committed
            .entry(partition_id.to_string())
            .or_default()
            .value()
            .clone();
        let mut committed = commit_lock.lock().await;

        // The partition may have been closed while this commit waited for the lock.
        let still_owned = self
            .partitions
            .get(partition_id)
            .map(|owned| owned.context.same_ownership(&context))
            .unwrap_or(false);
        if !still_owned {
            return Err(self.not_owned(partition_id));
        }

        if committed.is_none() {
            match context.committed_offset().await {
                Ok(stored) => *committed = stored,
                Err(e) => warn!(
                    entity = %self.entity,
                    partition = partition_id,
                    error = %e,
                    "could not read the stored checkpoint"
                ),
            }
        }

        if let Some(last) = *committed {
            if event.offset == last {
                debug!(
                    entity = %self.entity,
                    partition = partition_id,
                    offset = event.offset,
                    "checkpoint already committed"
                );
                return Ok(());
            }
            if event.offset < last {
                metrics::counter!(CHECKPOINTS, "outcome" => "stale").increment(1);
                warn!(
                    entity = %self.entity,
                    partition = partition_id,
                    offset = event.offset,
                    committed = last,
                    "rejecting checkpoint older than the committed one"
                );
                return Err(EventHubError::checkpoint(
                    partition_id,
                    format!("offset {} is older than committed offset {last}", event.offset),
                ));
            }
        }

        match context.update_checkpoint(event).await {
            Ok(()) => {
                *committed = Some(event.offset);
                metrics::counter!(CHECKPOINTS, "outcome" => "ok").increment(1);
                debug!(
                    entity = %self.entity,
                    partition = partition_id,
                    offset = event.offset,
                    "checkpoint committed"
                );
                Ok(())
            }
            Err(e) => {
                metrics::counter!(CHECKPOINTS, "outcome" => "failed").increment(1);
                warn!(
                    entity = %self.entity,
                    partition = partition_id,
                    offset = event.offset,
                    error = %e,
                    "checkpoint commit failed"
                );
                Err(match e {
                    EventHubError::CheckpointFailure { .. } => e,
                    other => EventHubError::checkpoint(partition_id, other.to_string()),
                })
            }
        }
    }

    fn not_owned(&self, partition_id: &str) -> EventHubError {
        metrics::counter!(CHECKPOINTS, "outcome" => "not_owned").increment(1);
        debug!(
            entity = %self.entity,
            partition = partition_id,
            "checkpoint for partition that is not owned"
        );
        EventHubError::checkpoint(partition_id, "partition is not owned by this processor")
    }

    fn report_owned(&self) {
        metrics::gauge!(
            PARTITIONS_OWNED,
            "entity" => self.entity.entity_name().to_string(),
            "consumer_group" => self.entity.consumer_group().to_string()
        )
        .set(self.partitions.len() as f64);
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("entity", &self.entity)
            .field("owned_partitions", &self.owned_partitions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_store::{CheckpointStore, InMemoryCheckpointStore};
    use crate::types::{Checkpoint, EventData};

    fn event(partition_id: &str, offset: i64) -> ReceivedEvent {
        ReceivedEvent {
            data: EventData::new(format!("event-{offset}")),
            partition_id: partition_id.to_string(),
            offset,
            sequence_number: offset,
            enqueued_time: None,
        }
    }

    fn setup() -> (Checkpointer, Arc<InMemoryCheckpointStore>) {
        let entity = EntityRef::new("orders", "g1");
        let store = Arc::new(InMemoryCheckpointStore::provisioned("orders"));
        let checkpointer = Checkpointer::new(entity);
        (checkpointer, store)
    }

    fn context(store: &Arc<InMemoryCheckpointStore>, partition_id: &str) -> PartitionContext {
        let store: Arc<dyn CheckpointStore> = store.clone();
        PartitionContext::new(
            EntityRef::new("orders", "g1"),
            partition_id.to_string(),
            store,
        )
    }

    #[tokio::test]
    async fn test_checkpoint_commits_last_delivered_per_partition() {
        let (checkpointer, store) = setup();
        checkpointer.add_partition(context(&store, "0"));
        checkpointer.add_partition(context(&store, "1"));

        assert!(checkpointer.record_delivery("0", &event("0", 3)));
        assert!(checkpointer.record_delivery("0", &event("0", 4)));
        assert!(checkpointer.record_delivery("1", &event("1", 7)));

        checkpointer.checkpoint().await.unwrap();

        assert_eq!(store.get("orders", "g1", "0").unwrap().offset, 4);
        assert_eq!(store.get("orders", "g1", "1").unwrap().offset, 7);
    }

    #[tokio::test]
    async fn test_checkpoint_without_deliveries_is_ok() {
        let (checkpointer, store) = setup();
        checkpointer.add_partition(context(&store, "0"));

        checkpointer.checkpoint().await.unwrap();
        assert!(store.get("orders", "g1", "0").is_none());
    }

    #[tokio::test]
    async fn test_older_commit_is_rejected_equal_is_noop() {
        let (checkpointer, store) = setup();
        checkpointer.add_partition(context(&store, "0"));

        checkpointer.checkpoint_event(&event("0", 10)).await.unwrap();
        checkpointer.checkpoint_event(&event("0", 10)).await.unwrap();

        let err = checkpointer
            .checkpoint_event(&event("0", 9))
            .await
            .unwrap_err();
        assert!(matches!(err, EventHubError::CheckpointFailure { .. }));
        assert_eq!(store.get("orders", "g1", "0").unwrap().offset, 10);

        checkpointer.checkpoint_event(&event("0", 12)).await.unwrap();
        assert_eq!(store.get("orders", "g1", "0").unwrap().offset, 12);
    }

    #[tokio::test]
    async fn test_checkpoint_after_close_fails_softly() {
        let (checkpointer, store) = setup();
        let ctx = context(&store, "0");
        checkpointer.add_partition(ctx.clone());
        checkpointer.record_delivery("0", &event("0", 1));

        checkpointer.remove_partition(&ctx);

        assert!(!checkpointer.owns("0"));
        assert!(!checkpointer.record_delivery("0", &event("0", 2)));
        let err = checkpointer
            .checkpoint_event(&event("0", 1))
            .await
            .unwrap_err();
        match err {
            EventHubError::CheckpointFailure { partition_id, .. } => assert_eq!(partition_id, "0"),
            other => panic!("unexpected error: {other:?}"),
        }
        // nothing owned, nothing to commit
        checkpointer.checkpoint().await.unwrap();
    }

    #[tokio::test]
    async fn test_late_close_of_previous_ownership_keeps_partition() {
        let (checkpointer, store) = setup();
        let previous = context(&store, "0");
        let current = context(&store, "0");
        checkpointer.add_partition(previous.clone());
        checkpointer.add_partition(current.clone());

        checkpointer.remove_partition(&previous);

        assert!(checkpointer.owns("0"));
        checkpointer.checkpoint_event(&event("0", 3)).await.unwrap();
        assert_eq!(store.get("orders", "g1", "0").unwrap().offset, 3);

        checkpointer.remove_partition(&current);
        assert!(!checkpointer.owns("0"));
    }

    #[tokio::test]
    async fn test_reopened_partition_keeps_committed_offset() {
        let (checkpointer, store) = setup();
        let first = context(&store, "0");
        checkpointer.add_partition(first.clone());
        checkpointer.checkpoint_event(&event("0", 10)).await.unwrap();

        checkpointer.remove_partition(&first);
        checkpointer.add_partition(context(&store, "0"));

        let result = checkpointer.checkpoint_event(&event("0", 5)).await;
        assert!(matches!(
            result,
            Err(EventHubError::CheckpointFailure { .. })
        ));
        assert_eq!(store.get("orders", "g1", "0").unwrap().offset, 10);
    }

    #[tokio::test]
    async fn test_stored_checkpoint_seeds_watermark() {
        let (_, store) = setup();
        let entity = EntityRef::new("orders", "g1");
        store
            .update_checkpoint(Checkpoint::for_event(&entity, &event("0", 8)))
            .await
            .unwrap();

        // a fresh checkpointer, as after a restart or on another instance
        let checkpointer = Checkpointer::new(entity);
        checkpointer.add_partition(context(&store, "0"));

        assert!(checkpointer.checkpoint_event(&event("0", 4)).await.is_err());
        checkpointer.checkpoint_event(&event("0", 8)).await.unwrap();
        checkpointer.checkpoint_event(&event("0", 9)).await.unwrap();
        assert_eq!(store.get("orders", "g1", "0").unwrap().offset, 9);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_checkpoint_failure() {
        let entity = EntityRef::new("orders", "g1");
        let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new("missing"));
        let checkpointer = Checkpointer::new(entity.clone());
        checkpointer.add_partition(PartitionContext::new(entity, "0".to_string(), store));

        let result = checkpointer.checkpoint_event(&event("0", 1)).await;
        assert!(matches!(
            result,
            Err(EventHubError::CheckpointFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_owned_partitions_sorted() {
        let (checkpointer, store) = setup();
        checkpointer.add_partition(context(&store, "2"));
        checkpointer.add_partition(context(&store, "0"));
        checkpointer.add_partition(context(&store, "1"));

        assert_eq!(checkpointer.owned_partitions(), vec!["0", "1", "2"]);
    }
}
