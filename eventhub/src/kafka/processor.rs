//! Consumer group processor.
//!
//! The group coordinator assigns and revokes partitions; the rebalance callbacks open and
//! close partitions on the processor callbacks. One polling loop receives records for
//! every owned partition and feeds a delivery worker per partition, which batches what
//! is queued and awaits `on_events` before taking the next batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientContext, Message};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{client_config, parse_partition, received_event};
use crate::broker::{ProcessorHandle, ProcessorOptions};
use crate::checkpoint_store::{CheckpointStore, ContainerCreation};
use crate::config::KafkaConfig;
use crate::connection::NamespaceEndpoint;
use crate::error::{EventHubError, Result};
use crate::processor::{EventsFn, PartitionContext, ProcessorCallbacks};
use crate::types::{Checkpoint, CloseReason, EntityRef, ReceivedEvent};

/// How long a revoked partition's in-flight batch may run before it is aborted.
const REVOKE_GRACE: Duration = Duration::from_secs(5);
const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OffsetCommand {
    partition: i32,
    offset: i64,
}

/// Checkpoint store wrapper that also queues every successful checkpoint to be stored
/// as the group's consumed offset.
struct MirroredCheckpointStore {
    inner: Arc<dyn CheckpointStore>,
    offsets: mpsc::UnboundedSender<OffsetCommand>,
}

#[async_trait]
impl CheckpointStore for MirroredCheckpointStore {
    fn container(&self) -> &str {
        self.inner.container()
    }

    async fn container_exists(&self) -> Result<bool> {
        self.inner.container_exists().await
    }

    async fn create_container(&self) -> Result<ContainerCreation> {
        self.inner.create_container().await
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        let command = OffsetCommand {
            partition: parse_partition(&checkpoint.partition_id)?,
            offset: checkpoint.offset,
        };
        self.inner.update_checkpoint(checkpoint).await?;

        if self.offsets.send(command).is_err() {
            debug!(
                partition = command.partition,
                offset = command.offset,
                "processor stopped, checkpoint not mirrored to group offsets"
            );
        }
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>> {
        self.inner.list_checkpoints(entity_name, consumer_group).await
    }
}

struct PartitionWorker {
    context: PartitionContext,
    events: mpsc::Sender<ReceivedEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ProcessorShared {
    entity: EntityRef,
    store: Arc<dyn CheckpointStore>,
    callbacks: ProcessorCallbacks,
    max_batch_size: usize,
    workers: DashMap<i32, PartitionWorker>,
    /// Revoked partitions whose close is still running; the token fires once it is done
    closing: DashMap<i32, CancellationToken>,
    /// Assigned partitions waiting for their previous close before opening
    pending_open: DashSet<i32>,
    /// Parent of every worker's token; cancelled on stop
    delivery: CancellationToken,
    running: AtomicBool,
}

impl ProcessorShared {
    fn topic(&self) -> &str {
        self.entity.entity_name()
    }

    /// Open a newly assigned partition, or queue the open behind a close of the same
    /// partition that is still running.
    fn assign_partition(self: &Arc<Self>, partition: i32, rt_handle: &Handle) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let Some(closed) = self.closing.get(&partition).map(|t| t.value().clone()) else {
            self.open_partition(partition, rt_handle);
            return;
        };

        debug!(entity = %self.entity, partition, "assigned while closing, opening after close");
        self.pending_open.insert(partition);
        let shared = self.clone();
        let handle = rt_handle.clone();
        rt_handle.spawn(async move {
            closed.cancelled().await;
            // A revoke in the meantime cancels the pending open.
            if shared.pending_open.remove(&partition).is_some() {
                shared.open_partition(partition, &handle);
            }
        });
    }

    /// Stop delivering a revoked partition and close it in the background.
    fn revoke_partition(self: &Arc<Self>, partition: i32, rt_handle: &Handle) {
        self.pending_open.remove(&partition);
        let Some((_, worker)) = self.workers.remove(&partition) else {
            return;
        };

        info!(entity = %self.entity, partition, "partition revoked");
        let closed = CancellationToken::new();
        self.closing.insert(partition, closed.clone());

        let shared = self.clone();
        rt_handle.spawn(async move {
            shared
                .close_partition(
                    worker,
                    Instant::now() + REVOKE_GRACE,
                    CloseReason::LostOwnership,
                )
                .await;
            shared.closing.remove(&partition);
            closed.cancel();
        });
    }

    fn open_partition(&self, partition: i32, rt_handle: &Handle) {
        if !self.running.load(Ordering::SeqCst) || self.workers.contains_key(&partition) {
            return;
        }

        let context = PartitionContext::new(
            self.entity.clone(),
            partition.to_string(),
            self.store.clone(),
        );
        (self.callbacks.on_open)(context.clone());

        let (tx, rx) = mpsc::channel(self.max_batch_size.saturating_mul(2));
        let cancel = self.delivery.child_token();
        let task = rt_handle.spawn(deliver(
            context.clone(),
            rx,
            self.max_batch_size,
            self.callbacks.on_events.clone(),
            cancel.clone(),
        ));

        self.workers.insert(
            partition,
            PartitionWorker {
                context,
                events: tx,
                cancel,
                task,
            },
        );
        info!(entity = %self.entity, partition, "partition assigned");
    }

    /// Wait for the worker's in-flight batch until `deadline`, then report the
    /// partition closed.
    async fn close_partition(
        &self,
        worker: PartitionWorker,
        deadline: Instant,
        reason: CloseReason,
    ) {
        worker.cancel.cancel();
        drop(worker.events);
        let mut task = worker.task;

        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                (self.callbacks.on_error)(
                    Some(worker.context.clone()),
                    EventHubError::connection(format!("partition worker failed: {e}")),
                );
            }
            Err(_) => {
                warn!(
                    entity = %self.entity,
                    partition = worker.context.partition_id(),
                    "in-flight delivery outlived the grace period, aborting"
                );
                task.abort();
            }
        }

        (self.callbacks.on_close)(worker.context, reason);
    }
}

struct GroupContext {
    shared: Arc<ProcessorShared>,
    // rebalance callbacks run on the polling thread, work is spawned from here
    rt_handle: Handle,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                for elem in partitions.elements() {
                    if elem.topic() == self.shared.topic() {
                        self.shared.revoke_partition(elem.partition(), &self.rt_handle);
                    }
                }
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    entity = %self.shared.entity,
                    partitions = partitions.count(),
                    "pre-rebalance assign"
                );
            }
            Rebalance::Error(e) => {
                error!(entity = %self.shared.entity, error = %e, "rebalance error");
                (self.shared.callbacks.on_error)(
                    None,
                    EventHubError::connection(format!("rebalance error: {e}")),
                );
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        let Rebalance::Assign(partitions) = rebalance else {
            return;
        };

        for elem in partitions.elements() {
            if elem.topic() == self.shared.topic() {
                self.shared.assign_partition(elem.partition(), &self.rt_handle);
            }
        }
    }
}

async fn deliver(
    context: PartitionContext,
    mut events: mpsc::Receiver<ReceivedEvent>,
    max_batch_size: usize,
    on_events: EventsFn,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let mut batch = Vec::with_capacity(max_batch_size);
        batch.push(first);
        while batch.len() < max_batch_size {
            match events.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }

        on_events(context.clone(), batch).await;
    }
}

enum Polled {
    Stop,
    Offset(OffsetCommand),
    Record(i32, ReceivedEvent),
    Error(KafkaError),
    Idle,
}

async fn poll_loop(
    consumer: Arc<StreamConsumer<GroupContext>>,
    shared: Arc<ProcessorShared>,
    mut offsets: mpsc::UnboundedReceiver<OffsetCommand>,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => Polled::Stop,
            Some(command) = offsets.recv() => Polled::Offset(command),
            result = timeout(RECV_TIMEOUT, consumer.recv()) => match result {
                Ok(Ok(message)) => Polled::Record(message.partition(), received_event(&message)),
                Ok(Err(e)) => Polled::Error(e),
                Err(_) => Polled::Idle,
            },
        };

        match polled {
            Polled::Stop => break,
            Polled::Offset(command) => store_offset(&consumer, &shared, command),
            Polled::Record(partition, event) => {
                let Some(worker) = shared.workers.get(&partition).map(|w| w.events.clone()) else {
                    debug!(
                        entity = %shared.entity,
                        partition,
                        offset = event.offset,
                        "skipping record from partition that is not owned"
                    );
                    continue;
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = worker.send(event) => {
                        if sent.is_err() {
                            debug!(entity = %shared.entity, partition, "partition closed while forwarding");
                        }
                    }
                }
            }
            Polled::Error(e) => {
                error!(entity = %shared.entity, error = %e, "error receiving message");
                (shared.callbacks.on_error)(None, e.into());
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
            Polled::Idle => {}
        }
    }

    // Checkpoints taken by the last in-flight batches
    while let Ok(command) = offsets.try_recv() {
        store_offset(&consumer, &shared, command);
    }
    match consumer.commit_consumer_state(CommitMode::Sync) {
        Ok(()) => debug!(entity = %shared.entity, "final group offsets committed"),
        Err(e) => debug!(entity = %shared.entity, error = %e, "no final group offsets committed"),
    }
    consumer.unsubscribe();
}

fn store_offset(
    consumer: &StreamConsumer<GroupContext>,
    shared: &ProcessorShared,
    command: OffsetCommand,
) {
    if let Err(e) = consumer.store_offset(shared.topic(), command.partition, command.offset + 1) {
        debug!(
            entity = %shared.entity,
            partition = command.partition,
            offset = command.offset,
            error = %e,
            "could not mirror checkpoint to group offsets"
        );
    }
}

pub struct KafkaProcessor {
    shared: Arc<ProcessorShared>,
    poll_cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaProcessor {
    /// Join the consumer group for `(entity, group)` and start polling.
    ///
    /// Partitions the group has no committed offset for start at the configured
    /// start position.
    pub fn start(
        endpoint: &NamespaceEndpoint,
        config: &KafkaConfig,
        entity_name: &str,
        consumer_group: &str,
        options: ProcessorOptions,
        store: Arc<dyn CheckpointStore>,
        callbacks: ProcessorCallbacks,
    ) -> Result<Self> {
        let entity = EntityRef::new(entity_name, consumer_group);
        let (offsets_tx, offsets_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ProcessorShared {
            entity: entity.clone(),
            store: Arc::new(MirroredCheckpointStore {
                inner: store,
                offsets: offsets_tx,
            }),
            callbacks,
            max_batch_size: options.max_batch_size.max(1),
            workers: DashMap::new(),
            closing: DashMap::new(),
            pending_open: DashSet::new(),
            delivery: CancellationToken::new(),
            running: AtomicBool::new(true),
        });

        let mut client_config = client_config(endpoint, config);
        client_config
            .set("group.id", consumer_group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", options.start_position.as_offset_reset())
            .set(
                "session.timeout.ms",
                config.kafka_session_timeout_ms.to_string(),
            );

        let context = GroupContext {
            shared: shared.clone(),
            rt_handle: Handle::current(),
        };
        let consumer: StreamConsumer<GroupContext> = client_config.create_with_context(context)?;
        consumer.subscribe(&[entity_name])?;

        let poll_cancel = CancellationToken::new();
        let poll_task = tokio::spawn(poll_loop(
            Arc::new(consumer),
            shared.clone(),
            offsets_rx,
            poll_cancel.clone(),
        ));

        info!(
            entity = %entity,
            start_position = options.start_position.as_offset_reset(),
            "kafka processor started"
        );
        Ok(Self {
            shared,
            poll_cancel,
            poll_task: Mutex::new(Some(poll_task)),
        })
    }
}

#[async_trait]
impl ProcessorHandle for KafkaProcessor {
    async fn stop(&self, grace: Duration) -> Result<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.delivery.cancel();
        self.shared.pending_open.clear();
        let deadline = Instant::now() + grace;

        let partitions: Vec<i32> = self
            .shared
            .workers
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for partition in partitions {
            if let Some((_, worker)) = self.shared.workers.remove(&partition) {
                self.shared
                    .close_partition(worker, deadline, CloseReason::Shutdown)
                    .await;
            }
        }

        // The loop keeps polling until the workers are done so their checkpoints
        // still reach the group offsets.
        self.poll_cancel.cancel();
        if let Some(task) = self.poll_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(entity = %self.shared.entity, error = %e, "kafka polling task failed");
            }
        }

        info!(entity = %self.shared.entity, "kafka processor stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_store::InMemoryCheckpointStore;
    use crate::checkpointer::Checkpointer;
    use crate::types::EventData;
    use std::sync::Mutex as StdMutex;

    fn event(partition_id: &str, offset: i64) -> ReceivedEvent {
        ReceivedEvent {
            data: EventData::new(format!("event-{offset}")),
            partition_id: partition_id.to_string(),
            offset,
            sequence_number: offset,
            enqueued_time: None,
        }
    }

    #[tokio::test]
    async fn test_mirrored_store_queues_offsets_after_write() {
        let inner = Arc::new(InMemoryCheckpointStore::provisioned("orders"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = MirroredCheckpointStore {
            inner: inner.clone(),
            offsets: tx,
        };
        let entity = EntityRef::new("orders", "g1");

        store
            .update_checkpoint(Checkpoint::for_event(&entity, &event("2", 9)))
            .await
            .unwrap();

        assert_eq!(inner.get("orders", "g1", "2").unwrap().offset, 9);
        assert_eq!(
            rx.try_recv().unwrap(),
            OffsetCommand {
                partition: 2,
                offset: 9
            }
        );
    }

    #[tokio::test]
    async fn test_mirrored_store_skips_offset_when_write_fails() {
        let inner: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new("missing"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = MirroredCheckpointStore { inner, offsets: tx };
        let entity = EntityRef::new("orders", "g1");

        assert!(store
            .update_checkpoint(Checkpoint::for_event(&entity, &event("0", 1)))
            .await
            .is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_batches_what_is_queued() {
        let store: Arc<dyn CheckpointStore> =
            Arc::new(InMemoryCheckpointStore::provisioned("orders"));
        let context = PartitionContext::new(EntityRef::new("orders", "g1"), "0".to_string(), store);

        let batches = Arc::new(StdMutex::new(Vec::new()));
        let sink = batches.clone();
        let on_events: EventsFn = Arc::new(move |_, events| {
            sink.lock()
                .unwrap()
                .push(events.iter().map(|e| e.offset).collect::<Vec<_>>());
            Box::pin(async {})
        });

        let (tx, rx) = mpsc::channel(10);
        for offset in 0..5 {
            tx.send(event("0", offset)).await.unwrap();
        }
        drop(tx);

        deliver(context, rx, 2, on_events, CancellationToken::new()).await;

        assert_eq!(
            *batches.lock().unwrap(),
            vec![vec![0, 1], vec![2, 3], vec![4]]
        );
    }

    #[tokio::test]
    async fn test_deliver_stops_on_cancel() {
        let store: Arc<dyn CheckpointStore> =
            Arc::new(InMemoryCheckpointStore::provisioned("orders"));
        let context = PartitionContext::new(EntityRef::new("orders", "g1"), "0".to_string(), store);
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let on_events: EventsFn = Arc::new(|_, _| Box::pin(async {}));
        tokio::time::timeout(
            Duration::from_secs(1),
            deliver(context, rx, 10, on_events, cancel),
        )
        .await
        .unwrap();
    }

    fn test_shared(callbacks: ProcessorCallbacks) -> Arc<ProcessorShared> {
        Arc::new(ProcessorShared {
            entity: EntityRef::new("orders", "g1"),
            store: Arc::new(InMemoryCheckpointStore::provisioned("orders")),
            callbacks,
            max_batch_size: 10,
            workers: DashMap::new(),
            closing: DashMap::new(),
            pending_open: DashSet::new(),
            delivery: CancellationToken::new(),
            running: AtomicBool::new(true),
        })
    }

    /// Callbacks wired to a checkpointer the way the template wires them, with a slow
    /// `on_events` so a revoke has an in-flight batch to wait for.
    fn slow_callbacks(
        checkpointer: Arc<Checkpointer>,
        log: Arc<StdMutex<Vec<&'static str>>>,
    ) -> ProcessorCallbacks {
        let opened = checkpointer.clone();
        let open_log = log.clone();
        let close_log = log;
        ProcessorCallbacks {
            on_open: Arc::new(move |ctx| {
                open_log.lock().unwrap().push("open");
                opened.add_partition(ctx);
            }),
            on_close: Arc::new(move |ctx, _| {
                close_log.lock().unwrap().push("close");
                checkpointer.remove_partition(&ctx);
            }),
            on_events: Arc::new(|_, _| {
                Box::pin(async { tokio::time::sleep(Duration::from_millis(100)).await })
            }),
            on_error: Arc::new(|_, _| {}),
        }
    }

    async fn start_slow_batch(shared: &ProcessorShared, partition: i32) {
        let events = shared.workers.get(&partition).unwrap().events.clone();
        events.send(event(&partition.to_string(), 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_reassigned_partition_opens_after_revoke_closes() {
        let checkpointer = Arc::new(Checkpointer::new(EntityRef::new("orders", "g1")));
        let log = Arc::new(StdMutex::new(Vec::new()));
        let shared = test_shared(slow_callbacks(checkpointer.clone(), log.clone()));
        let rt = Handle::current();

        shared.assign_partition(0, &rt);
        start_slow_batch(&shared, 0).await;

        shared.revoke_partition(0, &rt);
        shared.assign_partition(0, &rt);
        assert!(!shared.workers.contains_key(&0));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !shared.workers.contains_key(&0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["open", "close", "open"]);
        assert!(checkpointer.owns("0"));
        checkpointer.checkpoint_event(&event("0", 4)).await.unwrap();
    }

    #[tokio::test]
    async fn test_revoke_cancels_pending_reopen() {
        let checkpointer = Arc::new(Checkpointer::new(EntityRef::new("orders", "g1")));
        let log = Arc::new(StdMutex::new(Vec::new()));
        let shared = test_shared(slow_callbacks(checkpointer.clone(), log.clone()));
        let rt = Handle::current();

        shared.assign_partition(0, &rt);
        start_slow_batch(&shared, 0).await;

        shared.revoke_partition(0, &rt);
        shared.assign_partition(0, &rt);
        shared.revoke_partition(0, &rt);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!shared.workers.contains_key(&0));
        assert!(shared.closing.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["open", "close"]);
        assert!(!checkpointer.owns("0"));
    }
}
