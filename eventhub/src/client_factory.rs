//! Creates and memoizes broker clients, and tracks at most one processor group per
//! `(entity, consumer group)`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Connector, ConsumerClient, ProcessorHandle, ProcessorOptions, ProducerClient,
};
use crate::checkpoint_store::{check_key_segments, CheckpointStore, ContainerCreation};
use crate::config::{EventHubConfig, RetryOptions};
use crate::error::{EventHubError, Result};
use crate::memoizer::Memoizer;
use crate::metrics_consts::{
    CLIENTS_CREATED, CLOSE_FAILURES, CONTAINERS_PROVISIONED, PROCESSOR_GROUPS_ACTIVE,
};
use crate::processor::ProcessorCallbacks;
use crate::types::EntityRef;

/// Broker-driven, rebalanced set of partition readers for one `(entity, consumer group)`.
pub struct ProcessorGroup {
    entity: EntityRef,
    container: String,
    options: ProcessorOptions,
    handle: Box<dyn ProcessorHandle>,
}

impl ProcessorGroup {
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Checkpoint container backing this group.
    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn options(&self) -> ProcessorOptions {
        self.options
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub async fn stop(&self, grace: Duration) -> Result<()> {
        self.handle.stop(grace).await
    }
}

impl std::fmt::Debug for ProcessorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorGroup")
            .field("entity", &self.entity)
            .field("container", &self.container)
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientFactoryOptions {
    /// Checkpoint container shared by every group; each entity gets its own when unset
    pub checkpoint_container: Option<String>,
    pub retry: RetryOptions,
    pub provisioning_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ClientFactoryOptions {
    fn default() -> Self {
        Self {
            checkpoint_container: None,
            retry: RetryOptions::default(),
            provisioning_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl From<&EventHubConfig> for ClientFactoryOptions {
    fn from(config: &EventHubConfig) -> Self {
        Self {
            checkpoint_container: config
                .checkpoint_storage_container
                .clone()
                .filter(|c| !c.trim().is_empty()),
            retry: config.retry_options(),
            provisioning_timeout: config.provisioning_timeout(),
            shutdown_grace: config.processor_shutdown_grace(),
        }
    }
}

pub struct ClientFactory {
    connector: Arc<dyn Connector>,
    producers: Memoizer<String, Arc<dyn ProducerClient>>,
    consumers: Memoizer<EntityRef, Arc<dyn ConsumerClient>>,
    processors: DashMap<EntityRef, Arc<ProcessorGroup>>,
    options: ClientFactoryOptions,
}

pub(crate) fn require_name(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EventHubError::invalid_argument(format!(
            "{kind} can't be null or empty"
        )));
    }
    check_key_segments(&[(kind, value)])
}

impl ClientFactory {
    pub fn new(connector: Arc<dyn Connector>, options: ClientFactoryOptions) -> Self {
        Self {
            connector,
            producers: Memoizer::new(),
            consumers: Memoizer::new(),
            processors: DashMap::new(),
            options,
        }
    }

    pub fn options(&self) -> &ClientFactoryOptions {
        &self.options
    }

    /// Shared producer for `entity_name`, connecting on first use.
    pub async fn get_or_create_producer_client(
        &self,
        entity_name: &str,
    ) -> Result<Arc<dyn ProducerClient>> {
        require_name("entity name", entity_name)?;

        let connector = self.connector.clone();
        let name = entity_name.to_string();
        self.producers
            .get_or_try_init(entity_name.to_string(), async move {
                let client = connector.producer(&name).await?;
                metrics::counter!(CLIENTS_CREATED, "kind" => "producer").increment(1);
                info!(entity = %name, "created producer client");
                Ok(client)
            })
            .await
    }

    /// Shared direct-read consumer for `(entity_name, consumer_group)`, connecting on first use.
    pub async fn get_or_create_consumer_client(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Result<Arc<dyn ConsumerClient>> {
        require_name("entity name", entity_name)?;
        require_name("consumer group", consumer_group)?;

        let key = EntityRef::new(entity_name, consumer_group);
        let connector = self.connector.clone();
        let init_key = key.clone();
        self.consumers
            .get_or_try_init(key, async move {
                let client = connector
                    .consumer(init_key.entity_name(), init_key.consumer_group())
                    .await?;
                metrics::counter!(CLIENTS_CREATED, "kind" => "consumer").increment(1);
                info!(entity = %init_key, "created consumer client");
                Ok(client)
            })
            .await
    }

    /// Provision the checkpoint container and start a processor group for the key.
    ///
    /// Fails with `AlreadyExists` while a group is tracked for the key.
    pub async fn create_processor_group(
        &self,
        entity_name: &str,
        consumer_group: &str,
        options: ProcessorOptions,
        callbacks: ProcessorCallbacks,
    ) -> Result<Arc<ProcessorGroup>> {
        require_name("entity name", entity_name)?;
        require_name("consumer group", consumer_group)?;

        let key = EntityRef::new(entity_name, consumer_group);
        if self.processors.contains_key(&key) {
            return Err(EventHubError::AlreadyExists(key));
        }

        let container = self
            .options
            .checkpoint_container
            .clone()
            .unwrap_or_else(|| entity_name.to_string());
        let store = self.connector.checkpoint_store(&container).await?;
        self.provision_container(store.as_ref()).await;

        let handle = self
            .connector
            .start_processor(entity_name, consumer_group, options, store, callbacks)
            .await?;

        let group = Arc::new(ProcessorGroup {
            entity: key.clone(),
            container,
            options,
            handle,
        });

        // The shard lock must be released before stopping a duplicate.
        let inserted = match self.processors.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(group.clone());
                true
            }
        };

        if !inserted {
            warn!(entity = %key, "processor group created concurrently, stopping duplicate");
            if let Err(e) = group.stop(self.options.shutdown_grace).await {
                warn!(entity = %key, error = %e, "failed to stop duplicate processor group");
            }
            return Err(EventHubError::AlreadyExists(key));
        }

        self.report_groups();
        info!(
            entity = %key,
            container = group.container(),
            start_position = ?options.start_position,
            "started processor group"
        );
        Ok(group)
    }

    pub fn get_processor_group(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Option<Arc<ProcessorGroup>> {
        self.processors
            .get(&EntityRef::new(entity_name, consumer_group))
            .map(|entry| entry.value().clone())
    }

    /// Keys of every tracked processor group.
    pub fn processor_groups(&self) -> Vec<EntityRef> {
        let mut keys: Vec<EntityRef> = self
            .processors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Stop a tracked processor group and forget it.
    ///
    /// The group is untracked even if stopping it fails; the failure is logged.
    pub async fn remove_processor_group(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Result<Arc<ProcessorGroup>> {
        let key = EntityRef::new(entity_name, consumer_group);
        let Some((_, group)) = self.processors.remove(&key) else {
            return Err(EventHubError::NotFound(format!("processor group {key}")));
        };
        self.report_groups();

        match group.stop(self.options.shutdown_grace).await {
            Ok(()) => info!(entity = %key, "stopped processor group"),
            Err(e) => warn!(entity = %key, error = %e, "processor group did not stop cleanly"),
        }

        Ok(group)
    }

    /// Best effort shutdown of every processor group and cached client.
    ///
    /// A resource that fails to close is logged and skipped.
    pub async fn close_all(&self) {
        let keys: Vec<EntityRef> = self
            .processors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Err(e) = self
                .remove_processor_group(key.entity_name(), key.consumer_group())
                .await
            {
                debug!(entity = %key, error = %e, "processor group already removed");
            }
        }

        for producer in self.producers.values() {
            if let Err(e) = producer.close().await {
                metrics::counter!(CLOSE_FAILURES, "kind" => "producer").increment(1);
                error!(error = %e, "failed to close producer client");
            }
        }
        self.producers.clear().await;

        for consumer in self.consumers.values() {
            if let Err(e) = consumer.close().await {
                metrics::counter!(CLOSE_FAILURES, "kind" => "consumer").increment(1);
                error!(error = %e, "failed to close consumer client");
            }
        }
        self.consumers.clear().await;

        info!("closed all event hub clients");
    }

    /// Make sure the checkpoint container exists. Failures are retried inside the
    /// provisioning timeout, then logged; the processor starts regardless.
    async fn provision_container(&self, store: &dyn CheckpointStore) {
        let container = store.container().to_string();
        let retry = self.options.retry;

        let attempts = async {
            let mut attempt = 0;
            loop {
                match ensure_container(store).await {
                    Ok(created) => return Ok(created),
                    Err(e) if e.is_retryable() && attempt < retry.max_retries() => {
                        let backoff = retry.backoff(attempt);
                        warn!(
                            container = %container,
                            attempt,
                            error = %e,
                            "checkpoint container provisioning failed, retrying in {backoff:?}"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(self.options.provisioning_timeout, attempts).await {
            Ok(Ok(ContainerCreation::Created)) => {
                metrics::counter!(CONTAINERS_PROVISIONED).increment(1);
                info!(container = %container, "created checkpoint container");
            }
            Ok(Ok(ContainerCreation::AlreadyExists)) => {
                debug!(container = %container, "checkpoint container already exists");
            }
            Ok(Err(e)) => {
                warn!(
                    container = %container,
                    error = %e,
                    "could not provision checkpoint container, continuing"
                );
            }
            Err(_) => {
                warn!(
                    container = %container,
                    timeout = ?self.options.provisioning_timeout,
                    "checkpoint container provisioning timed out, continuing"
                );
            }
        }
    }

    fn report_groups(&self) {
        metrics::gauge!(PROCESSOR_GROUPS_ACTIVE).set(self.processors.len() as f64);
    }
}

async fn ensure_container(store: &dyn CheckpointStore) -> Result<ContainerCreation> {
    if store.container_exists().await? {
        return Ok(ContainerCreation::AlreadyExists);
    }
    store.create_container().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_store::InMemoryCheckpointStore;
    use crate::memory::InMemoryBroker;
    use crate::types::{EventData, SendTarget, StartPosition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_options() -> ClientFactoryOptions {
        ClientFactoryOptions {
            checkpoint_container: None,
            retry: RetryOptions::new(2, 2, Duration::from_millis(1), None),
            provisioning_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
        }
    }

    /// Checkpoint store whose existence check always fails with a transient error.
    struct UnreachableStore {
        inner: InMemoryCheckpointStore,
        checks: AtomicUsize,
    }

    #[async_trait]
    impl CheckpointStore for UnreachableStore {
        fn container(&self) -> &str {
            self.inner.container()
        }

        async fn container_exists(&self) -> Result<bool> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Err(EventHubError::connection("storage account unreachable"))
        }

        async fn create_container(&self) -> Result<ContainerCreation> {
            self.inner.create_container().await
        }

        async fn update_checkpoint(&self, checkpoint: crate::types::Checkpoint) -> Result<()> {
            self.inner.update_checkpoint(checkpoint).await
        }

        async fn list_checkpoints(
            &self,
            entity_name: &str,
            consumer_group: &str,
        ) -> Result<Vec<crate::types::Checkpoint>> {
            self.inner.list_checkpoints(entity_name, consumer_group).await
        }
    }

    /// Memory broker whose checkpoint storage is unreachable.
    struct UnreachableStorageConnector {
        broker: Arc<InMemoryBroker>,
        store: Arc<UnreachableStore>,
    }

    #[async_trait]
    impl Connector for UnreachableStorageConnector {
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

        async fn checkpoint_store(&self, _container: &str) -> Result<Arc<dyn CheckpointStore>> {
            let store: Arc<dyn CheckpointStore> = self.store.clone();
            Ok(store)
        }

        async fn start_processor(
            &self,
            entity_name: &str,
            consumer_group: &str,
            options: ProcessorOptions,
            store: Arc<dyn CheckpointStore>,
            callbacks: ProcessorCallbacks,
        ) -> Result<Box<dyn ProcessorHandle>> {
            self.broker
                .start_processor(entity_name, consumer_group, options, store, callbacks)
                .await
        }
    }

    #[tokio::test]
    async fn test_producer_client_is_memoized() {
        let broker = Arc::new(InMemoryBroker::new(2));
        let factory = ClientFactory::new(broker.clone(), fast_options());

        let first = factory.get_or_create_producer_client("orders").await.unwrap();
        let second = factory.get_or_create_producer_client("orders").await.unwrap();
        let other = factory.get_or_create_producer_client("payments").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(broker.producer_connects(), 2);
    }

    #[tokio::test]
    async fn test_consumer_client_is_keyed_on_group() {
        let broker = Arc::new(InMemoryBroker::new(2));
        let factory = ClientFactory::new(broker.clone(), fast_options());

        let a = factory
            .get_or_create_consumer_client("orders", "g1")
            .await
            .unwrap();
        let b = factory
            .get_or_create_consumer_client("orders", "g1")
            .await
            .unwrap();
        let c = factory
            .get_or_create_consumer_client("orders", "g2")
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(broker.consumer_connects(), 2);
    }

    #[tokio::test]
    async fn test_empty_names_are_rejected() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let factory = ClientFactory::new(broker.clone(), fast_options());

        assert!(matches!(
            factory.get_or_create_producer_client(" ").await,
            Err(EventHubError::InvalidArgument(_))
        ));
        assert!(matches!(
            factory.get_or_create_consumer_client("orders", "").await,
            Err(EventHubError::InvalidArgument(_))
        ));
        assert_eq!(broker.producer_connects(), 0);
    }

    #[tokio::test]
    async fn test_names_with_slash_are_rejected() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let factory = ClientFactory::new(broker.clone(), fast_options());

        let result = factory
            .create_processor_group(
                "orders",
                "g1/checkpoint",
                ProcessorOptions::default(),
                ProcessorCallbacks::noop(),
            )
            .await;
        assert!(matches!(result, Err(EventHubError::InvalidArgument(_))));
        assert!(matches!(
            factory.get_or_create_producer_client("orders/eu").await,
            Err(EventHubError::InvalidArgument(_))
        ));
        assert_eq!(broker.processor_starts(), 0);
    }

    #[tokio::test]
    async fn test_processor_group_lifecycle() {
        let broker = Arc::new(InMemoryBroker::new(2));
        let factory = ClientFactory::new(broker.clone(), fast_options());

        let group = factory
            .create_processor_group(
                "orders",
                "g1",
                ProcessorOptions::default(),
                ProcessorCallbacks::noop(),
            )
            .await
            .unwrap();
        assert!(group.is_running());
        assert_eq!(group.container(), "orders");
        assert!(broker
            .checkpoint_store("orders")
            .await
            .unwrap()
            .container_exists()
            .await
            .unwrap());

        let duplicate = factory
            .create_processor_group(
                "orders",
                "g1",
                ProcessorOptions::default(),
                ProcessorCallbacks::noop(),
            )
            .await;
        assert!(matches!(duplicate, Err(EventHubError::AlreadyExists(_))));

        let removed = factory.remove_processor_group("orders", "g1").await.unwrap();
        assert!(Arc::ptr_eq(&group, &removed));
        assert!(!removed.is_running());
        assert!(factory.get_processor_group("orders", "g1").is_none());

        assert!(matches!(
            factory.remove_processor_group("orders", "g1").await,
            Err(EventHubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_checkpoint_container() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let options = ClientFactoryOptions {
            checkpoint_container: Some("checkpoints".to_string()),
            ..fast_options()
        };
        let factory = ClientFactory::new(broker.clone(), options);

        let group = factory
            .create_processor_group(
                "orders",
                "g1",
                ProcessorOptions {
                    start_position: StartPosition::Earliest,
                    max_batch_size: 10,
                },
                ProcessorCallbacks::noop(),
            )
            .await
            .unwrap();

        assert_eq!(group.container(), "checkpoints");
        factory.close_all().await;
    }

    #[tokio::test]
    async fn test_provisioning_failure_does_not_block_processor() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let store = Arc::new(UnreachableStore {
            inner: InMemoryCheckpointStore::new("orders"),
            checks: AtomicUsize::new(0),
        });
        let connector = Arc::new(UnreachableStorageConnector {
            broker: broker.clone(),
            store: store.clone(),
        });
        let factory = ClientFactory::new(connector, fast_options());

        let group = factory
            .create_processor_group(
                "orders",
                "g1",
                ProcessorOptions::default(),
                ProcessorCallbacks::noop(),
            )
            .await
            .unwrap();

        assert!(group.is_running());
        // first attempt plus two retries
        assert_eq!(store.checks.load(Ordering::SeqCst), 3);
        factory.close_all().await;
    }

    #[tokio::test]
    async fn test_close_all_releases_everything() {
        let broker = Arc::new(InMemoryBroker::new(2));
        let factory = ClientFactory::new(broker.clone(), fast_options());

        let producer = factory.get_or_create_producer_client("orders").await.unwrap();
        factory
            .get_or_create_consumer_client("orders", "g1")
            .await
            .unwrap();
        let group = factory
            .create_processor_group(
                "orders",
                "g1",
                ProcessorOptions::default(),
                ProcessorCallbacks::noop(),
            )
            .await
            .unwrap();

        factory.close_all().await;

        assert!(!group.is_running());
        assert!(factory.processor_groups().is_empty());
        assert!(producer
            .send(EventData::new("late"), &SendTarget::Any)
            .await
            .is_err());

        // a fresh client is created after close
        factory.get_or_create_producer_client("orders").await.unwrap();
        assert_eq!(broker.producer_connects(), 2);
    }
}
