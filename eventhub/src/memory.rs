//! In-process broker backend.
//!
//! Every entity is a fixed number of append-only partition logs. Processor groups run
//! one delivery task per partition, honor stored checkpoints and the configured start
//! position, and can have partitions revoked to simulate a rebalance. Nothing leaves
//! the process, which makes it the backend for tests and local runs.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{
    Connector, ConsumerClient, ProcessorHandle, ProcessorOptions, ProducerClient,
};
use crate::checkpoint_store::{CheckpointStorage, CheckpointStore};
use crate::error::{EventHubError, Result};
use crate::processor::{EventsFn, PartitionContext, ProcessorCallbacks};
use crate::types::{
    CloseReason, EntityRef, EventData, ReceivedEvent, SendTarget, StartPosition,
};

/// How long a revoked partition's in-flight batch may run before it is aborted.
const REVOKE_GRACE: Duration = Duration::from_secs(5);

struct PartitionLog {
    id: String,
    events: RwLock<Vec<ReceivedEvent>>,
    appended: watch::Sender<usize>,
}

impl PartitionLog {
    fn new(id: String) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            id,
            events: RwLock::new(Vec::new()),
            appended,
        }
    }

    async fn append(&self, data: EventData) -> ReceivedEvent {
        let mut events = self.events.write().await;
        let offset = events.len() as i64;
        let event = ReceivedEvent {
            data,
            partition_id: self.id.clone(),
            offset,
            sequence_number: offset,
            enqueued_time: Some(Utc::now()),
        };
        events.push(event.clone());
        self.appended.send_replace(events.len());
        event
    }

    async fn read(&self, from_offset: i64, max_events: usize) -> Vec<ReceivedEvent> {
        let events = self.events.read().await;
        let start = usize::try_from(from_offset).unwrap_or(0).min(events.len());
        events[start..].iter().take(max_events).cloned().collect()
    }

    async fn end_offset(&self) -> i64 {
        self.events.read().await.len() as i64
    }

    /// Resolves once an event exists at `offset`.
    async fn wait_for_offset(&self, offset: i64) {
        let mut appended = self.appended.subscribe();
        drop(appended.wait_for(|len| *len as i64 > offset).await);
    }
}

struct EntityLog {
    name: String,
    partitions: Vec<PartitionLog>,
    round_robin: AtomicUsize,
}

impl EntityLog {
    fn new(name: &str, partition_count: usize) -> Self {
        Self {
            name: name.to_string(),
            partitions: (0..partition_count)
                .map(|i| PartitionLog::new(i.to_string()))
                .collect(),
            round_robin: AtomicUsize::new(0),
        }
    }

    fn partition(&self, partition_id: &str) -> Result<&PartitionLog> {
        self.partitions
            .iter()
            .find(|p| p.id == partition_id)
            .ok_or_else(|| {
                EventHubError::invalid_argument(format!(
                    "partition {partition_id} does not exist on {}",
                    self.name
                ))
            })
    }

    fn route(&self, target: &SendTarget) -> Result<&PartitionLog> {
        let count = self.partitions.len();
        let index = match target {
            SendTarget::Partition(id) => return self.partition(id),
            SendTarget::Key(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            SendTarget::Any => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        };
        self.partition(&index.to_string())
    }
}

struct InMemoryProducer {
    log: Arc<EntityLog>,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerClient for InMemoryProducer {
    async fn send(&self, event: EventData, target: &SendTarget) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventHubError::connection(format!(
                "producer for {} is closed",
                self.log.name
            )));
        }

        let partition = self.log.route(target)?;
        let event = partition.append(event).await;
        debug!(
            entity = %self.log.name,
            partition = %event.partition_id,
            offset = event.offset,
            "appended event"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct InMemoryConsumer {
    log: Arc<EntityLog>,
    closed: AtomicBool,
}

#[async_trait]
impl ConsumerClient for InMemoryConsumer {
    async fn partition_ids(&self) -> Result<Vec<String>> {
        Ok(self.log.partitions.iter().map(|p| p.id.clone()).collect())
    }

    async fn read_partition(
        &self,
        partition_id: &str,
        from_offset: i64,
        max_events: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedEvent>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventHubError::connection(format!(
                "consumer for {} is closed",
                self.log.name
            )));
        }

        let partition = self.log.partition(partition_id)?;
        let events = partition.read(from_offset, max_events).await;
        if !events.is_empty() || max_wait.is_zero() {
            return Ok(events);
        }

        if tokio::time::timeout(max_wait, partition.wait_for_offset(from_offset))
            .await
            .is_err()
        {
            return Ok(Vec::new());
        }
        Ok(partition.read(from_offset, max_events).await)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct PartitionWorker {
    context: PartitionContext,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ProcessorState {
    entity: EntityRef,
    callbacks: ProcessorCallbacks,
    workers: DashMap<String, PartitionWorker>,
    cancel: CancellationToken,
    running: AtomicBool,
    partition_closes: Arc<AtomicUsize>,
}

impl ProcessorState {
    /// Stop one partition worker, waiting for its in-flight batch until `deadline`,
    /// then report the partition closed.
    async fn close_partition(
        &self,
        worker: PartitionWorker,
        deadline: Instant,
        reason: CloseReason,
    ) {
        worker.cancel.cancel();
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

        self.partition_closes.fetch_add(1, Ordering::SeqCst);
        (self.callbacks.on_close)(worker.context, reason);
    }
}

async fn deliver(
    log: Arc<EntityLog>,
    index: usize,
    mut next_offset: i64,
    max_batch_size: usize,
    context: PartitionContext,
    on_events: EventsFn,
    cancel: CancellationToken,
) {
    let Some(partition) = log.partitions.get(index) else {
        return;
    };

    // Cancellation is only observed between batches so an in-flight batch completes.
    while !cancel.is_cancelled() {
        let events = partition.read(next_offset, max_batch_size).await;
        if events.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = partition.wait_for_offset(next_offset) => {}
            }
            continue;
        }

        if let Some(last) = events.last() {
            next_offset = last.offset + 1;
        }
        on_events(context.clone(), events).await;
    }
}

pub struct InMemoryProcessor {
    state: Arc<ProcessorState>,
    registry: Arc<DashMap<EntityRef, Arc<ProcessorState>>>,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessorHandle for InMemoryProcessor {
    async fn stop(&self, grace: Duration) -> Result<()> {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.state.cancel.cancel();
        let deadline = Instant::now() + grace;

        let partition_ids: Vec<String> = self
            .state
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for partition_id in partition_ids {
            if let Some((_, worker)) = self.state.workers.remove(&partition_id) {
                self.state
                    .close_partition(worker, deadline, CloseReason::Shutdown)
                    .await;
            }
        }

        self.registry
            .remove_if(&self.state.entity, |_, state| Arc::ptr_eq(state, &self.state));
        self.stops.fetch_add(1, Ordering::SeqCst);
        info!(entity = %self.state.entity, "in-memory processor stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }
}

/// Process-local broker with a fixed partition count per entity.
pub struct InMemoryBroker {
    partition_count: usize,
    entities: DashMap<String, Arc<EntityLog>>,
    storage: CheckpointStorage,
    processors: Arc<DashMap<EntityRef, Arc<ProcessorState>>>,
    connect_delay: Duration,
    producer_connects: AtomicUsize,
    consumer_connects: AtomicUsize,
    processor_starts: AtomicUsize,
    processor_stops: Arc<AtomicUsize>,
    partition_closes: Arc<AtomicUsize>,
}

impl InMemoryBroker {
    pub fn new(partition_count: usize) -> Self {
        Self {
            partition_count: partition_count.max(1),
            entities: DashMap::new(),
            storage: CheckpointStorage::in_memory(),
            processors: Arc::new(DashMap::new()),
            connect_delay: Duration::ZERO,
            producer_connects: AtomicUsize::new(0),
            consumer_connects: AtomicUsize::new(0),
            processor_starts: AtomicUsize::new(0),
            processor_stops: Arc::new(AtomicUsize::new(0)),
            partition_closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulated connection setup cost for producer and consumer clients.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Keep checkpoints somewhere other than this broker's own memory.
    pub fn with_checkpoint_storage(mut self, storage: CheckpointStorage) -> Self {
        self.storage = storage;
        self
    }

    pub fn producer_connects(&self) -> usize {
        self.producer_connects.load(Ordering::SeqCst)
    }

    pub fn consumer_connects(&self) -> usize {
        self.consumer_connects.load(Ordering::SeqCst)
    }

    pub fn processor_starts(&self) -> usize {
        self.processor_starts.load(Ordering::SeqCst)
    }

    /// Processor groups stopped so far; stopping an already stopped group is not counted.
    pub fn processor_stops(&self) -> usize {
        self.processor_stops.load(Ordering::SeqCst)
    }

    /// Partitions closed so far, for any reason.
    pub fn partition_closes(&self) -> usize {
        self.partition_closes.load(Ordering::SeqCst)
    }

    pub fn has_processor(&self, entity_name: &str, consumer_group: &str) -> bool {
        self.processors
            .contains_key(&EntityRef::new(entity_name, consumer_group))
    }

    /// Every event appended to one partition so far.
    pub async fn events(&self, entity_name: &str, partition_id: &str) -> Vec<ReceivedEvent> {
        let log = self.entity_log(entity_name);
        match log.partition(partition_id) {
            Ok(partition) => partition.read(0, usize::MAX).await,
            Err(_) => Vec::new(),
        }
    }

    /// Take a partition away from a running processor group, as a rebalance would.
    ///
    /// Returns false when the group is not running or does not own the partition.
    pub async fn revoke_partition(
        &self,
        entity_name: &str,
        consumer_group: &str,
        partition_id: &str,
    ) -> bool {
        let key = EntityRef::new(entity_name, consumer_group);
        let Some(state) = self.processors.get(&key).map(|entry| entry.value().clone()) else {
            return false;
        };
        let Some((_, worker)) = state.workers.remove(partition_id) else {
            return false;
        };

        info!(entity = %key, partition = partition_id, "revoking partition");
        state
            .close_partition(worker, Instant::now() + REVOKE_GRACE, CloseReason::LostOwnership)
            .await;
        true
    }

    fn entity_log(&self, entity_name: &str) -> Arc<EntityLog> {
        self.entities
            .entry(entity_name.to_string())
            .or_insert_with(|| Arc::new(EntityLog::new(entity_name, self.partition_count)))
            .value()
            .clone()
    }

    async fn simulate_connect(&self) {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn producer(&self, entity_name: &str) -> Result<Arc<dyn ProducerClient>> {
        self.simulate_connect().await;
        self.producer_connects.fetch_add(1, Ordering::SeqCst);

        let producer: Arc<dyn ProducerClient> = Arc::new(InMemoryProducer {
            log: self.entity_log(entity_name),
            closed: AtomicBool::new(false),
        });
        Ok(producer)
    }

    async fn consumer(
        &self,
        entity_name: &str,
        _consumer_group: &str,
    ) -> Result<Arc<dyn ConsumerClient>> {
        self.simulate_connect().await;
        self.consumer_connects.fetch_add(1, Ordering::SeqCst);

        let consumer: Arc<dyn ConsumerClient> = Arc::new(InMemoryConsumer {
            log: self.entity_log(entity_name),
            closed: AtomicBool::new(false),
        });
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
        let key = EntityRef::new(entity_name, consumer_group);
        let log = self.entity_log(entity_name);

        let checkpoints: HashMap<String, i64> =
            match store.list_checkpoints(entity_name, consumer_group).await {
                Ok(checkpoints) => checkpoints
                    .into_iter()
                    .map(|c| (c.partition_id, c.offset))
                    .collect(),
                Err(e) => {
                    (callbacks.on_error)(None, e);
                    HashMap::new()
                }
            };

        let state = Arc::new(ProcessorState {
            entity: key.clone(),
            callbacks,
            workers: DashMap::new(),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(true),
            partition_closes: self.partition_closes.clone(),
        });

        for (index, partition) in log.partitions.iter().enumerate() {
            let start_offset = match checkpoints.get(&partition.id) {
                Some(offset) => offset + 1,
                None => match options.start_position {
                    StartPosition::Earliest => 0,
                    StartPosition::Latest => partition.end_offset().await,
                },
            };

            let context = PartitionContext::new(key.clone(), partition.id.clone(), store.clone());
            (state.callbacks.on_open)(context.clone());

            let cancel = state.cancel.child_token();
            let task = tokio::spawn(deliver(
                log.clone(),
                index,
                start_offset,
                options.max_batch_size.max(1),
                context.clone(),
                state.callbacks.on_events.clone(),
                cancel.clone(),
            ));

            debug!(
                entity = %key,
                partition = %partition.id,
                offset = start_offset,
                "partition worker started"
            );
            state.workers.insert(
                partition.id.clone(),
                PartitionWorker {
                    context,
                    cancel,
                    task,
                },
            );
        }

        self.processors.insert(key.clone(), state.clone());
        self.processor_starts.fetch_add(1, Ordering::SeqCst);
        info!(entity = %key, partitions = log.partitions.len(), "in-memory processor started");

        Ok(Box::new(InMemoryProcessor {
            state,
            registry: self.processors.clone(),
            stops: self.processor_stops.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Checkpoint;
    use std::sync::Mutex;

    type Deliveries = Arc<Mutex<Vec<(String, Vec<String>)>>>;

    fn recording_callbacks() -> (ProcessorCallbacks, Deliveries, Arc<Mutex<Vec<CloseReason>>>) {
        let delivered: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(Vec::new()));

        let mut callbacks = ProcessorCallbacks::noop();
        let sink = delivered.clone();
        callbacks.on_events = Arc::new(move |ctx, events| {
            let bodies = events
                .iter()
                .map(|e| e.data.body_as_str().unwrap_or_default().to_string())
                .collect();
            sink.lock()
                .unwrap()
                .push((ctx.partition_id().to_string(), bodies));
            Box::pin(async {})
        });
        let close_sink = closed.clone();
        callbacks.on_close = Arc::new(move |_, reason| close_sink.lock().unwrap().push(reason));

        (callbacks, delivered, closed)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_routing() {
        let broker = InMemoryBroker::new(4);
        let producer = broker.producer("orders").await.unwrap();

        producer
            .send(EventData::new("direct"), &SendTarget::Partition("2".to_string()))
            .await
            .unwrap();
        for _ in 0..3 {
            producer
                .send(EventData::new("keyed"), &SendTarget::Key("user-1".to_string()))
                .await
                .unwrap();
        }
        for _ in 0..4 {
            producer
                .send(EventData::new("any"), &SendTarget::Any)
                .await
                .unwrap();
        }

        assert_eq!(broker.events("orders", "2").await[0].data.body_as_str(), Some("direct"));

        let mut keyed_partitions = Vec::new();
        let mut any_per_partition = Vec::new();
        for id in ["0", "1", "2", "3"] {
            let events = broker.events("orders", id).await;
            if events.iter().any(|e| e.data.body_as_str() == Some("keyed")) {
                keyed_partitions.push(id);
            }
            any_per_partition.push(
                events
                    .iter()
                    .filter(|e| e.data.body_as_str() == Some("any"))
                    .count(),
            );
        }
        assert_eq!(keyed_partitions.len(), 1, "a key sticks to one partition");
        assert_eq!(any_per_partition, vec![1, 1, 1, 1]);

        let missing = producer
            .send(EventData::new("x"), &SendTarget::Partition("9".to_string()))
            .await;
        assert!(matches!(missing, Err(EventHubError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_consumer_reads_and_waits() {
        let broker = InMemoryBroker::new(1);
        let producer = broker.producer("orders").await.unwrap();
        let consumer = broker.consumer("orders", "g1").await.unwrap();

        assert_eq!(consumer.partition_ids().await.unwrap(), vec!["0"]);
        let empty = consumer
            .read_partition("0", 0, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(empty.is_empty());

        producer
            .send(EventData::new("a"), &SendTarget::Any)
            .await
            .unwrap();
        producer
            .send(EventData::new("b"), &SendTarget::Any)
            .await
            .unwrap();

        let events = consumer
            .read_partition("0", 1, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].offset, 1);
        assert_eq!(events[0].data.body_as_str(), Some("b"));
    }

    #[tokio::test]
    async fn test_processor_resumes_from_checkpoint() {
        let broker = InMemoryBroker::new(1);
        let producer = broker.producer("orders").await.unwrap();
        for body in ["a", "b", "c"] {
            producer
                .send(EventData::new(body), &SendTarget::Any)
                .await
                .unwrap();
        }

        let store = broker.checkpoint_store("orders").await.unwrap();
        store.create_container().await.unwrap();
        store
            .update_checkpoint(Checkpoint {
                entity_name: "orders".to_string(),
                consumer_group: "g1".to_string(),
                partition_id: "0".to_string(),
                offset: 0,
                sequence_number: 0,
            })
            .await
            .unwrap();

        let (callbacks, delivered, _) = recording_callbacks();
        let handle = broker
            .start_processor(
                "orders",
                "g1",
                ProcessorOptions {
                    start_position: StartPosition::Earliest,
                    max_batch_size: 10,
                },
                store,
                callbacks,
            )
            .await
            .unwrap();

        wait_until(|| !delivered.lock().unwrap().is_empty()).await;
        assert_eq!(
            delivered.lock().unwrap()[0],
            ("0".to_string(), vec!["b".to_string(), "c".to_string()])
        );
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_skips_history() {
        let broker = InMemoryBroker::new(1);
        let producer = broker.producer("orders").await.unwrap();
        producer
            .send(EventData::new("old"), &SendTarget::Any)
            .await
            .unwrap();

        let (callbacks, delivered, closed) = recording_callbacks();
        let store = broker.checkpoint_store("orders").await.unwrap();
        let handle = broker
            .start_processor("orders", "g1", ProcessorOptions::default(), store, callbacks)
            .await
            .unwrap();

        producer
            .send(EventData::new("new"), &SendTarget::Any)
            .await
            .unwrap();

        wait_until(|| !delivered.lock().unwrap().is_empty()).await;
        assert_eq!(delivered.lock().unwrap()[0].1, vec!["new".to_string()]);

        assert!(broker.has_processor("orders", "g1"));
        handle.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!handle.is_running());
        assert!(!broker.has_processor("orders", "g1"));
        assert_eq!(*closed.lock().unwrap(), vec![CloseReason::Shutdown]);
    }

    #[tokio::test]
    async fn test_revoke_partition_closes_with_lost_ownership() {
        let broker = InMemoryBroker::new(2);
        let (callbacks, _, closed) = recording_callbacks();
        let store = broker.checkpoint_store("orders").await.unwrap();
        let handle = broker
            .start_processor("orders", "g1", ProcessorOptions::default(), store, callbacks)
            .await
            .unwrap();

        assert!(broker.revoke_partition("orders", "g1", "1").await);
        assert!(!broker.revoke_partition("orders", "g1", "1").await);
        assert_eq!(*closed.lock().unwrap(), vec![CloseReason::LostOwnership]);

        handle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            *closed.lock().unwrap(),
            vec![CloseReason::LostOwnership, CloseReason::Shutdown]
        );
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_batch() {
        let broker = InMemoryBroker::new(1);
        let finished = Arc::new(AtomicBool::new(false));

        let mut callbacks = ProcessorCallbacks::noop();
        let flag = finished.clone();
        callbacks.on_events = Arc::new(move |_, _| {
            let flag = flag.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
            })
        });

        let store = broker.checkpoint_store("orders").await.unwrap();
        let handle = broker
            .start_processor("orders", "g1", ProcessorOptions::default(), store, callbacks)
            .await
            .unwrap();

        let producer = broker.producer("orders").await.unwrap();
        producer
            .send(EventData::new("slow"), &SendTarget::Any)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.stop(Duration::from_secs(2)).await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }
}
