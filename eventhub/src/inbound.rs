//! Inbound adapter: subscribes to an entity and hands converted messages to an
//! application handler, checkpointing according to the configured [`CheckpointMode`].

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::checkpointer::Checkpointer;
use crate::converter::{Message, MessageConverter};
use crate::error::Result;
use crate::metrics_consts::INBOUND_MESSAGES;
use crate::template::{BatchConsumer, EventBatch, EventHubTemplate};
use crate::types::{CheckpointMode, EntityRef, ReceivedEvent};

/// A converted message together with the means to checkpoint it.
#[derive(Debug, Clone)]
pub struct InboundMessage<T> {
    pub message: Message<T>,
    pub event: ReceivedEvent,
    pub checkpointer: Arc<Checkpointer>,
}

impl<T> InboundMessage<T> {
    /// Commit this record's position. Meant for `MANUAL` checkpoint mode.
    pub async fn checkpoint(&self) -> Result<()> {
        self.checkpointer.checkpoint_event(&self.event).await
    }
}

#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, message: InboundMessage<T>) -> anyhow::Result<()>;
}

struct AdapterConsumer<T> {
    converter: Arc<dyn MessageConverter<T>>,
    handler: Arc<dyn MessageHandler<T>>,
    mode: CheckpointMode,
}

impl<T> AdapterConsumer<T> {
    async fn checkpoint_record(&self, checkpointer: &Checkpointer, event: &ReceivedEvent) {
        if let Err(e) = checkpointer.checkpoint_event(event).await {
            warn!(
                partition = %event.partition_id,
                offset = event.offset,
                error = %e,
                "record checkpoint failed"
            );
        }
    }
}

#[async_trait]
impl<T> BatchConsumer for AdapterConsumer<T>
where
    T: Send + Sync + 'static,
{
    async fn consume(&self, batch: EventBatch) {
        for event in batch.events.iter() {
            let message = match self.converter.from_event(&batch.entity, event) {
                Ok(message) => message,
                Err(e) => {
                    metrics::counter!(INBOUND_MESSAGES, "outcome" => "conversion_failed")
                        .increment(1);
                    error!(
                        entity = %batch.entity,
                        partition = %event.partition_id,
                        offset = event.offset,
                        error = %e,
                        "dropping message that could not be converted"
                    );
                    continue;
                }
            };

            let inbound = InboundMessage {
                message,
                event: event.clone(),
                checkpointer: batch.checkpointer.clone(),
            };

            match self.handler.handle(inbound).await {
                Ok(()) => {
                    metrics::counter!(INBOUND_MESSAGES, "outcome" => "handled").increment(1);
                    if self.mode == CheckpointMode::Record {
                        self.checkpoint_record(&batch.checkpointer, event).await;
                    }
                }
                Err(e) => {
                    metrics::counter!(INBOUND_MESSAGES, "outcome" => "failed").increment(1);
                    error!(
                        entity = %batch.entity,
                        partition = %event.partition_id,
                        offset = event.offset,
                        error = ?e,
                        "message handler failed"
                    );
                }
            }
        }

        if self.mode == CheckpointMode::Batch {
            if let Err(e) = batch.checkpoint().await {
                warn!(
                    entity = %batch.entity,
                    partition = %batch.partition_id,
                    error = %e,
                    "batch checkpoint failed"
                );
            }
        }
    }
}

/// Subscribes on `start()` and unsubscribes on `stop()`.
pub struct InboundAdapter<T> {
    template: Arc<EventHubTemplate>,
    entity_name: String,
    consumer_group: Option<String>,
    consumer: Arc<dyn BatchConsumer>,
    subscription: Mutex<Option<EntityRef>>,
    _message: PhantomData<fn() -> T>,
}

impl<T> InboundAdapter<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        template: Arc<EventHubTemplate>,
        entity_name: impl Into<String>,
        consumer_group: Option<String>,
        mode: CheckpointMode,
        converter: Arc<dyn MessageConverter<T>>,
        handler: Arc<dyn MessageHandler<T>>,
    ) -> Self {
        let consumer: Arc<dyn BatchConsumer> = Arc::new(AdapterConsumer {
            converter,
            handler,
            mode,
        });
        Self {
            template,
            entity_name: entity_name.into(),
            consumer_group: consumer_group.filter(|g| !g.trim().is_empty()),
            consumer,
            subscription: Mutex::new(None),
            _message: PhantomData,
        }
    }

    /// Start receiving. Returns the subscribed key, which carries the generated
    /// consumer group for anonymous adapters.
    pub async fn start(&self) -> Result<EntityRef> {
        let mut subscription = self.subscription.lock().await;
        if let Some(key) = subscription.as_ref() {
            return Ok(key.clone());
        }

        let key = match &self.consumer_group {
            Some(group) => {
                self.template
                    .subscribe(&self.entity_name, Some(group.as_str()), self.consumer.clone())
                    .await?;
                EntityRef::new(self.entity_name.as_str(), group.as_str())
            }
            None => {
                self.template
                    .subscribe_anonymous(&self.entity_name, self.consumer.clone())
                    .await?
            }
        };

        info!(entity = %key, "inbound adapter started");
        *subscription = Some(key.clone());
        Ok(key)
    }

    /// Stop receiving. Returns false if the adapter was not running.
    pub async fn stop(&self) -> Result<bool> {
        let mut subscription = self.subscription.lock().await;
        let Some(key) = subscription.take() else {
            return Ok(false);
        };

        let removed = self
            .template
            .unsubscribe(key.entity_name(), key.consumer_group(), &self.consumer)
            .await?;
        info!(entity = %key, "inbound adapter stopped");
        Ok(removed)
    }

    pub async fn is_running(&self) -> bool {
        self.subscription.lock().await.is_some()
    }
}
