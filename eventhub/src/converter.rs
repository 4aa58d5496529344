//! Application messages and their conversion to and from broker events.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::types::{EntityRef, EventData, PartitionSupplier, ReceivedEvent};

pub mod headers {
    /// Outbound: send to this partition. Inbound: the partition the event came from.
    pub const PARTITION_ID: &str = "partition_id";
    /// Outbound: partition key used for sticky routing.
    pub const PARTITION_KEY: &str = "partition_key";
    pub const ENTITY_NAME: &str = "entity_name";
    pub const CONSUMER_GROUP: &str = "consumer_group";
    pub const OFFSET: &str = "offset";
    pub const SEQUENCE_NUMBER: &str = "sequence_number";
    /// RFC 3339 timestamp of when the broker accepted the event.
    pub const ENQUEUED_TIME: &str = "enqueued_time";
}

pub type MessageHeaders = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    pub payload: T,
    pub headers: MessageHeaders,
}

impl<T> Message<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            headers: MessageHeaders::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Routing directive carried by the partition id and partition key headers.
    pub fn partition_supplier(&self) -> Option<PartitionSupplier> {
        let partition_id = self
            .header(headers::PARTITION_ID)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let partition_key = self
            .header(headers::PARTITION_KEY)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        if partition_id.is_none() && partition_key.is_none() {
            return None;
        }
        Some(PartitionSupplier {
            partition_id,
            partition_key,
        })
    }
}

pub trait MessageConverter<T>: Send + Sync {
    fn to_event(&self, message: &Message<T>) -> Result<EventData>;

    fn from_event(&self, entity: &EntityRef, event: &ReceivedEvent) -> Result<Message<T>>;
}

/// JSON payloads via serde. String headers travel as event properties; the routing
/// headers are consumed by the send and not copied.
pub struct JsonMessageConverter<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonMessageConverter<T> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<T> Default for JsonMessageConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageConverter<T> for JsonMessageConverter<T>
where
    T: Serialize + DeserializeOwned,
{
    fn to_event(&self, message: &Message<T>) -> Result<EventData> {
        let body = serde_json::to_vec(&message.payload)?;
        let mut event = EventData::new(body);
        event.properties = message
            .headers
            .iter()
            .filter(|(name, _)| {
                name.as_str() != headers::PARTITION_ID && name.as_str() != headers::PARTITION_KEY
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(event)
    }

    fn from_event(&self, entity: &EntityRef, event: &ReceivedEvent) -> Result<Message<T>> {
        let payload: T = serde_json::from_slice(&event.data.body)?;

        let mut stamped = event.data.properties.clone();
        stamped.insert(headers::ENTITY_NAME.to_string(), entity.entity_name().to_string());
        stamped.insert(
            headers::CONSUMER_GROUP.to_string(),
            entity.consumer_group().to_string(),
        );
        stamped.insert(headers::PARTITION_ID.to_string(), event.partition_id.clone());
        stamped.insert(headers::OFFSET.to_string(), event.offset.to_string());
        stamped.insert(
            headers::SEQUENCE_NUMBER.to_string(),
            event.sequence_number.to_string(),
        );
        if let Some(enqueued_time) = event.enqueued_time {
            stamped.insert(headers::ENQUEUED_TIME.to_string(), enqueued_time.to_rfc3339());
        }

        Ok(Message {
            payload,
            headers: stamped,
        })
    }
}
