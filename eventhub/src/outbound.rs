//! Outbound handler: converts application messages and sends them to one entity.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::converter::{Message, MessageConverter};
use crate::error::{EventHubError, Result};
use crate::template::EventHubTemplate;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OutboundHandler<T> {
    template: Arc<EventHubTemplate>,
    entity_name: String,
    converter: Arc<dyn MessageConverter<T>>,
    sync: bool,
    send_timeout: Duration,
}

impl<T> OutboundHandler<T> {
    pub fn new(
        template: Arc<EventHubTemplate>,
        entity_name: impl Into<String>,
        converter: Arc<dyn MessageConverter<T>>,
    ) -> Self {
        Self {
            template,
            entity_name: entity_name.into(),
            converter,
            sync: false,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Wait for the broker to accept each message, up to the send timeout.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Send one message, routed by its partition id or partition key header.
    ///
    /// In async mode this returns once the send is started and failures are only logged.
    pub async fn handle(&self, message: &Message<T>) -> Result<()> {
        let event = self.converter.to_event(message)?;
        let pending =
            self.template
                .send_async(&self.entity_name, event, message.partition_supplier())?;

        if self.sync {
            return match tokio::time::timeout(self.send_timeout, pending).await {
                Ok(result) => result,
                Err(_) => Err(EventHubError::Timeout(self.send_timeout)),
            };
        }

        let entity_name = self.entity_name.clone();
        tokio::spawn(async move {
            match pending.await {
                Ok(()) => debug!(entity = %entity_name, "message sent"),
                Err(e) => error!(entity = %entity_name, error = %e, "failed to send message"),
            }
        });
        Ok(())
    }
}
