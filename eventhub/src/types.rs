use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Composite key naming one consumer group's view over one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    entity_name: String,
    consumer_group: String,
}

impl EntityRef {
    pub fn new(entity_name: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            consumer_group: consumer_group.into(),
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_name, self.consumer_group)
    }
}

/// A record to be sent to an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventData {
    pub body: Bytes,
    pub properties: BTreeMap<String, String>,
}

impl EventData {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// A record as delivered from one partition of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub data: EventData,
    pub partition_id: String,
    pub offset: i64,
    pub sequence_number: i64,
    pub enqueued_time: Option<DateTime<Utc>>,
}

/// Optional routing directive supplied by a sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSupplier {
    pub partition_id: Option<String>,
    pub partition_key: Option<String>,
}

impl PartitionSupplier {
    pub fn partition_id(id: impl Into<String>) -> Self {
        Self {
            partition_id: Some(id.into()),
            partition_key: None,
        }
    }

    pub fn partition_key(key: impl Into<String>) -> Self {
        Self {
            partition_id: None,
            partition_key: Some(key.into()),
        }
    }
}

/// Where a single send is routed, resolved from an optional [`PartitionSupplier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    Partition(String),
    Key(String),
    Any,
}

impl SendTarget {
    /// Explicit partition id wins over partition key, which wins over no directive.
    /// Empty strings count as absent.
    pub fn resolve(supplier: Option<&PartitionSupplier>) -> Self {
        let Some(supplier) = supplier else {
            return SendTarget::Any;
        };

        let id = supplier.partition_id.as_deref().filter(|s| !s.is_empty());
        let key = supplier.partition_key.as_deref().filter(|s| !s.is_empty());

        match (id, key) {
            (Some(id), Some(key)) => {
                warn!(
                    partition_id = id,
                    partition_key = key,
                    "both partition id and partition key supplied, routing by partition id"
                );
                SendTarget::Partition(id.to_string())
            }
            (Some(id), None) => SendTarget::Partition(id.to_string()),
            (None, Some(key)) => SendTarget::Key(key.to_string()),
            (None, None) => SendTarget::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    Earliest,
    #[default]
    Latest,
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(StartPosition::Earliest),
            "latest" => Ok(StartPosition::Latest),
            other => Err(format!("unknown start position: {other}")),
        }
    }
}

impl StartPosition {
    /// Value for librdkafka's `auto.offset.reset`.
    pub fn as_offset_reset(&self) -> &'static str {
        match self {
            StartPosition::Earliest => "earliest",
            StartPosition::Latest => "latest",
        }
    }
}

/// When the inbound adapter commits checkpoints on behalf of the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// After every message handed to the downstream handler.
    Record,
    /// After every delivered batch.
    #[default]
    Batch,
    /// Never; the application checkpoints through the attached checkpointer.
    Manual,
}

impl FromStr for CheckpointMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "record" => Ok(CheckpointMode::Record),
            "batch" => Ok(CheckpointMode::Batch),
            "manual" => Ok(CheckpointMode::Manual),
            other => Err(format!("unknown checkpoint mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The processor group was stopped by this process.
    Shutdown,
    /// The broker reassigned the partition to another processor.
    LostOwnership,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::LostOwnership => write!(f, "lost_ownership"),
        }
    }
}

/// Durable "last processed position" for one partition of one consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub entity_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    pub offset: i64,
    pub sequence_number: i64,
}

impl Checkpoint {
    pub fn for_event(entity: &EntityRef, event: &ReceivedEvent) -> Self {
        Self {
            entity_name: entity.entity_name().to_string(),
            consumer_group: entity.consumer_group().to_string(),
            partition_id: event.partition_id.clone(),
            offset: event.offset,
            sequence_number: event.sequence_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, SendTarget::Any)]
    #[case(Some(PartitionSupplier::default()), SendTarget::Any)]
    #[case(Some(PartitionSupplier::partition_id("2")), SendTarget::Partition("2".to_string()))]
    #[case(Some(PartitionSupplier::partition_key("user-1")), SendTarget::Key("user-1".to_string()))]
    #[case(
        Some(PartitionSupplier { partition_id: Some("1".to_string()), partition_key: Some("k".to_string()) }),
        SendTarget::Partition("1".to_string())
    )]
    #[case(
        Some(PartitionSupplier { partition_id: Some("".to_string()), partition_key: Some("k".to_string()) }),
        SendTarget::Key("k".to_string())
    )]
    fn test_send_target_resolution(
        #[case] supplier: Option<PartitionSupplier>,
        #[case] expected: SendTarget,
    ) {
        assert_eq!(SendTarget::resolve(supplier.as_ref()), expected);
    }

    #[test]
    fn test_parse_config_enums() {
        assert_eq!(
            "Earliest".parse::<StartPosition>().unwrap(),
            StartPosition::Earliest
        );
        assert_eq!(
            " latest ".parse::<StartPosition>().unwrap(),
            StartPosition::Latest
        );
        assert!("newest".parse::<StartPosition>().is_err());
        assert_eq!(
            "RECORD".parse::<CheckpointMode>().unwrap(),
            CheckpointMode::Record
        );
        assert!("time".parse::<CheckpointMode>().is_err());
    }

    #[test]
    fn test_entity_ref_display() {
        assert_eq!(EntityRef::new("orders", "g1").to_string(), "orders/g1");
    }
}
