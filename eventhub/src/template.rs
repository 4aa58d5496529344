//! Send, subscribe and unsubscribe on top of a [`ClientFactory`].
//!
//! Local consumers are registered per `(entity, consumer group)`. The first registration
//! for a key starts its processor group and the last unregistration tears it down; every
//! batch the group delivers is fanned out to all consumers registered at that moment.
//! Subscribe and unsubscribe for the same key are serialized by a per-key lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Connector, ProcessorOptions};
use crate::checkpointer::Checkpointer;
use crate::client_factory::{require_name, ClientFactory, ClientFactoryOptions};
use crate::config::EventHubConfig;
use crate::error::{EventHubError, Result};
use crate::metrics_consts::{
    BATCH_SIZE, EVENTS_DELIVERED, EVENTS_SENT, LOCAL_CONSUMERS, PROCESSOR_ERRORS,
};
use crate::processor::{
    CloseFn, ErrorFn, EventsFn, OpenFn, PartitionContext, ProcessorCallbacks,
};
use crate::types::{
    CloseReason, EntityRef, EventData, PartitionSupplier, ReceivedEvent, SendTarget,
    StartPosition,
};

/// Prefix of the consumer group generated for subscriptions without one.
pub const ANONYMOUS_GROUP_PREFIX: &str = "anonymous.";

/// A local consumer of delivered batches.
///
/// Identity is the `Arc` pointer: registering the same `Arc` twice is a no-op.
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    async fn consume(&self, batch: EventBatch);
}

/// Events delivered from one partition, with the checkpointer of the consumer group.
#[derive(Clone, Debug)]
pub struct EventBatch {
    pub entity: EntityRef,
    pub partition_id: String,
    pub events: Arc<Vec<ReceivedEvent>>,
    pub checkpointer: Arc<Checkpointer>,
}

impl EventBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_event(&self) -> Option<&ReceivedEvent> {
        self.events.last()
    }

    /// Commit the position of the last event in this batch.
    pub async fn checkpoint(&self) -> Result<()> {
        match self.last_event() {
            Some(event) => self.checkpointer.checkpoint_event(event).await,
            None => Ok(()),
        }
    }
}

struct FnConsumer<F>(F);

#[async_trait]
impl<F> BatchConsumer for FnConsumer<F>
where
    F: Fn(EventBatch) + Send + Sync + 'static,
{
    async fn consume(&self, batch: EventBatch) {
        (self.0)(batch)
    }
}

/// Wrap a synchronous closure as a [`BatchConsumer`].
pub fn consumer_fn<F>(f: F) -> Arc<dyn BatchConsumer>
where
    F: Fn(EventBatch) + Send + Sync + 'static,
{
    Arc::new(FnConsumer(f))
}

type ConsumerList = Vec<Arc<dyn BatchConsumer>>;

pub struct EventHubTemplate {
    factory: Arc<ClientFactory>,
    consumers: Arc<DashMap<EntityRef, ConsumerList>>,
    checkpointers: Arc<DashMap<EntityRef, Arc<Checkpointer>>>,
    key_locks: DashMap<EntityRef, Arc<Mutex<()>>>,
    start_from_earliest: AtomicBool,
    max_batch_size: usize,
}

impl EventHubTemplate {
    pub fn new(factory: Arc<ClientFactory>) -> Self {
        Self {
            factory,
            consumers: Arc::new(DashMap::new()),
            checkpointers: Arc::new(DashMap::new()),
            key_locks: DashMap::new(),
            start_from_earliest: AtomicBool::new(false),
            max_batch_size: ProcessorOptions::default().max_batch_size,
        }
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &EventHubConfig) -> Self {
        let factory = Arc::new(ClientFactory::new(
            connector,
            ClientFactoryOptions::from(config),
        ));
        let template = Self::new(factory).with_max_batch_size(config.eventhub_max_batch_size);
        template.set_start_position(config.eventhub_start_position);
        template
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn factory(&self) -> &Arc<ClientFactory> {
        &self.factory
    }

    /// Start position for named consumer groups without a checkpoint. Anonymous
    /// subscriptions always start at the latest event.
    pub fn set_start_position(&self, start_position: StartPosition) {
        self.start_from_earliest.store(
            start_position == StartPosition::Earliest,
            Ordering::SeqCst,
        );
    }

    pub fn start_position(&self) -> StartPosition {
        if self.start_from_earliest.load(Ordering::SeqCst) {
            StartPosition::Earliest
        } else {
            StartPosition::Latest
        }
    }

    /// Validate and start sending one event.
    ///
    /// Argument errors are returned right away. The send itself is already running when
    /// this returns; broker failures come out of the returned future.
    pub fn send_async(
        &self,
        entity_name: &str,
        event: EventData,
        partition: Option<PartitionSupplier>,
    ) -> Result<BoxFuture<'static, Result<()>>> {
        require_name("entity name", entity_name)?;

        let target = SendTarget::resolve(partition.as_ref());
        let factory = self.factory.clone();
        let entity = entity_name.to_string();

        let task = tokio::spawn(async move {
            let routing = match &target {
                SendTarget::Partition(_) => "partition",
                SendTarget::Key(_) => "key",
                SendTarget::Any => "any",
            };

            let result = async {
                let producer = factory.get_or_create_producer_client(&entity).await?;
                producer.send(event, &target).await
            }
            .await;

            match &result {
                Ok(()) => {
                    metrics::counter!(EVENTS_SENT, "outcome" => "ok", "routing" => routing)
                        .increment(1);
                }
                Err(e) => {
                    metrics::counter!(EVENTS_SENT, "outcome" => "failed", "routing" => routing)
                        .increment(1);
                    warn!(entity = %entity, error = %e, "send failed");
                }
            }
            result
        });

        Ok(Box::pin(async move {
            task.await
                .map_err(|e| EventHubError::connection(format!("send task failed: {e}")))?
        }))
    }

    /// Send one event and wait for the broker to accept it.
    pub async fn send(
        &self,
        entity_name: &str,
        event: EventData,
        partition: Option<PartitionSupplier>,
    ) -> Result<()> {
        self.send_async(entity_name, event, partition)?.await
    }

    /// Register a local consumer. Returns false if this exact consumer is already
    /// registered for the key.
    ///
    /// Without a consumer group the subscription is anonymous and the generated group
    /// is not returned, so it can only end with [`EventHubTemplate::close`]. Callers that
    /// need to unsubscribe an anonymous consumer use
    /// [`EventHubTemplate::subscribe_anonymous`], which returns the key.
    pub async fn subscribe(
        &self,
        entity_name: &str,
        consumer_group: Option<&str>,
        consumer: Arc<dyn BatchConsumer>,
    ) -> Result<bool> {
        match consumer_group.filter(|group| !group.trim().is_empty()) {
            Some(group) => {
                require_name("entity name", entity_name)?;
                require_name("consumer group", group)?;
                let key = EntityRef::new(entity_name, group);
                self.register(key, consumer, self.start_position()).await
            }
            None => self
                .subscribe_anonymous(entity_name, consumer)
                .await
                .map(|_| true),
        }
    }

    /// Subscribe under a freshly generated consumer group that starts at the latest
    /// event. Returns the generated key, needed to unsubscribe.
    pub async fn subscribe_anonymous(
        &self,
        entity_name: &str,
        consumer: Arc<dyn BatchConsumer>,
    ) -> Result<EntityRef> {
        require_name("entity name", entity_name)?;

        let group = format!("{ANONYMOUS_GROUP_PREFIX}{}", Uuid::new_v4());
        let key = EntityRef::new(entity_name, group);
        self.register(key.clone(), consumer, StartPosition::Latest)
            .await?;
        Ok(key)
    }

    /// Remove a local consumer. Returns false if it was not registered for the key.
    /// Removing the last consumer stops the processor group.
    pub async fn unsubscribe(
        &self,
        entity_name: &str,
        consumer_group: &str,
        consumer: &Arc<dyn BatchConsumer>,
    ) -> Result<bool> {
        require_name("entity name", entity_name)?;
        require_name("consumer group", consumer_group)?;

        let key = EntityRef::new(entity_name, consumer_group);
        let lock = self.key_lock(&key);
        let guard = lock.lock().await;

        let drained = match self.consumers.get_mut(&key) {
            None => return Ok(false),
            Some(mut registered) => {
                let before = registered.len();
                registered.retain(|c| !Arc::ptr_eq(c, consumer));
                if registered.len() == before {
                    return Ok(false);
                }
                registered.is_empty()
            }
        };

        if drained {
            self.consumers.remove(&key);
            match self
                .factory
                .remove_processor_group(key.entity_name(), key.consumer_group())
                .await
            {
                Ok(_) => info!(entity = %key, "last consumer left, processor group stopped"),
                Err(e) => warn!(entity = %key, error = %e, "failed to remove processor group"),
            }
            self.checkpointers.remove(&key);
        }

        self.report_consumers(&key);
        info!(entity = %key, "unsubscribed");

        drop(guard);
        if drained {
            // Nobody else is waiting on the lock when only the map and this call hold it.
            self.key_locks
                .remove_if(&key, |_, held| Arc::strong_count(held) <= 2);
        }
        Ok(true)
    }

    /// The checkpointer for a key, once its processor group has opened a partition.
    pub fn get_checkpointer(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Option<Arc<Checkpointer>> {
        self.checkpointers
            .get(&EntityRef::new(entity_name, consumer_group))
            .map(|entry| entry.value().clone())
    }

    /// Keys with at least one registered consumer.
    pub fn subscriptions(&self) -> Vec<EntityRef> {
        let mut keys: Vec<EntityRef> = self
            .consumers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn consumer_count(&self, entity_name: &str, consumer_group: &str) -> usize {
        self.consumers
            .get(&EntityRef::new(entity_name, consumer_group))
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    /// Drop every subscription and close all clients and processor groups.
    pub async fn close(&self) {
        self.consumers.clear();
        self.factory.close_all().await;
        self.checkpointers.clear();
        self.key_locks.clear();
    }

    async fn register(
        &self,
        key: EntityRef,
        consumer: Arc<dyn BatchConsumer>,
        start_position: StartPosition,
    ) -> Result<bool> {
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let first = match self.consumers.get(&key) {
            Some(registered) if registered.iter().any(|c| Arc::ptr_eq(c, &consumer)) => {
                debug!(entity = %key, "consumer already subscribed");
                return Ok(false);
            }
            Some(_) => false,
            None => true,
        };

        // Registered before the group starts so the first batch reaches it.
        self.consumers.entry(key.clone()).or_default().push(consumer);

        if first {
            let options = ProcessorOptions {
                start_position,
                max_batch_size: self.max_batch_size,
            };
            if let Err(e) = self
                .factory
                .create_processor_group(
                    key.entity_name(),
                    key.consumer_group(),
                    options,
                    self.processor_callbacks(&key),
                )
                .await
            {
                self.consumers.remove(&key);
                self.checkpointers.remove(&key);
                error!(entity = %key, error = %e, "failed to start processor group");
                return Err(e);
            }
        }

        self.report_consumers(&key);
        info!(entity = %key, first, "subscribed");
        Ok(true)
    }

    fn key_lock(&self, key: &EntityRef) -> Arc<Mutex<()>> {
        self.key_locks.entry(key.clone()).or_default().value().clone()
    }

    fn report_consumers(&self, key: &EntityRef) {
        metrics::gauge!(
            LOCAL_CONSUMERS,
            "entity" => key.entity_name().to_string()
        )
        .set(self.consumer_count(key.entity_name(), key.consumer_group()) as f64);
    }

    fn processor_callbacks(&self, key: &EntityRef) -> ProcessorCallbacks {
        let on_open: OpenFn = {
            let key = key.clone();
            let checkpointers = self.checkpointers.clone();
            Arc::new(move |context: PartitionContext| {
                let checkpointer = checkpointers
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Checkpointer::new(key.clone())))
                    .value()
                    .clone();
                checkpointer.add_partition(context);
            })
        };

        let on_close: CloseFn = {
            let key = key.clone();
            let checkpointers = self.checkpointers.clone();
            Arc::new(move |context: PartitionContext, reason: CloseReason| {
                let checkpointer = checkpointers.get(&key).map(|entry| entry.value().clone());
                if let Some(checkpointer) = checkpointer {
                    checkpointer.remove_partition(&context);
                }
                info!(
                    entity = %key,
                    partition = context.partition_id(),
                    reason = %reason,
                    "partition closed"
                );
            })
        };

        let on_events: EventsFn = {
            let key = key.clone();
            let consumers = self.consumers.clone();
            let checkpointers = self.checkpointers.clone();
            Arc::new(
                move |context: PartitionContext,
                      events: Vec<ReceivedEvent>|
                      -> BoxFuture<'static, ()> {
                    // Consumers registered when the batch arrives see it.
                    let registered: ConsumerList = consumers
                        .get(&key)
                        .map(|entry| entry.value().clone())
                        .unwrap_or_default();
                    let checkpointer = checkpointers.get(&key).map(|entry| entry.value().clone());
                    let key = key.clone();

                    Box::pin(async move {
                        let Some(last) = events.last() else {
                            return;
                        };
                        let Some(checkpointer) = checkpointer else {
                            warn!(
                                entity = %key,
                                partition = context.partition_id(),
                                "batch for a partition that was never opened, dropping"
                            );
                            return;
                        };
                        checkpointer.record_delivery(context.partition_id(), last);

                        metrics::counter!(EVENTS_DELIVERED, "entity" => key.entity_name().to_string())
                            .increment(events.len() as u64);
                        metrics::histogram!(BATCH_SIZE).record(events.len() as f64);

                        let batch = EventBatch {
                            entity: key,
                            partition_id: context.partition_id().to_string(),
                            events: Arc::new(events),
                            checkpointer,
                        };
                        for consumer in registered {
                            consumer.consume(batch.clone()).await;
                        }
                    })
                },
            )
        };

        let on_error: ErrorFn = {
            let key = key.clone();
            Arc::new(
                move |context: Option<PartitionContext>, error: EventHubError| {
                    metrics::counter!(PROCESSOR_ERRORS, "entity" => key.entity_name().to_string())
                        .increment(1);
                    match context {
                        Some(context) => error!(
                            entity = %key,
                            partition = context.partition_id(),
                            error = %error,
                            "processor error on partition"
                        ),
                        None => error!(entity = %key, error = %error, "processor error"),
                    }
                },
            )
        };

        ProcessorCallbacks {
            on_open,
            on_close,
            on_events,
            on_error,
        }
    }
}
