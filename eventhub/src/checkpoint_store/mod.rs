//! Durable per-partition checkpoints, grouped in a named container.
//!
//! The container is provisioned once per processor group; afterwards every partition
//! owner writes its own checkpoint record into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::error::{EventHubError, Result};
use crate::types::Checkpoint;

pub mod s3;

pub use s3::S3CheckpointStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerCreation {
    Created,
    /// Someone else created it first; callers treat this as success.
    AlreadyExists,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    fn container(&self) -> &str;

    async fn container_exists(&self) -> Result<bool>;

    async fn create_container(&self) -> Result<ContainerCreation>;

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()>;

    async fn list_checkpoints(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>>;
}

/// Names become key path segments, so a `/` inside one would let two groups share
/// (or overlap) their key prefixes.
pub fn check_key_segments(segments: &[(&str, &str)]) -> Result<()> {
    for (kind, value) in segments {
        if value.contains('/') {
            return Err(EventHubError::invalid_argument(format!(
                "{kind} can't contain '/': {value}"
            )));
        }
    }
    Ok(())
}

fn check_checkpoint(checkpoint: &Checkpoint) -> Result<()> {
    check_key_segments(&[
        ("entity name", checkpoint.entity_name.as_str()),
        ("consumer group", checkpoint.consumer_group.as_str()),
        ("partition id", checkpoint.partition_id.as_str()),
    ])
}

/// Object key of a checkpoint record inside its container.
pub fn checkpoint_key(entity_name: &str, consumer_group: &str, partition_id: &str) -> String {
    format!("{entity_name}/{consumer_group}/checkpoint/{partition_id}")
}

pub fn checkpoint_prefix(entity_name: &str, consumer_group: &str) -> String {
    format!("{entity_name}/{consumer_group}/checkpoint/")
}

/// Process-local checkpoint container.
pub struct InMemoryCheckpointStore {
    container: String,
    exists: AtomicBool,
    checkpoints: DashMap<String, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            exists: AtomicBool::new(false),
            checkpoints: DashMap::new(),
        }
    }

    /// A store whose container already exists.
    pub fn provisioned(container: impl Into<String>) -> Self {
        let store = Self::new(container);
        store.exists.store(true, Ordering::SeqCst);
        store
    }

    pub fn get(
        &self,
        entity_name: &str,
        consumer_group: &str,
        partition_id: &str,
    ) -> Option<Checkpoint> {
        self.checkpoints
            .get(&checkpoint_key(entity_name, consumer_group, partition_id))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn container_exists(&self) -> Result<bool> {
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn create_container(&self) -> Result<ContainerCreation> {
        if self.exists.swap(true, Ordering::SeqCst) {
            return Ok(ContainerCreation::AlreadyExists);
        }
        info!(container = %self.container, "created in-memory checkpoint container");
        Ok(ContainerCreation::Created)
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        check_checkpoint(&checkpoint)?;
        if !self.exists.load(Ordering::SeqCst) {
            return Err(EventHubError::checkpoint(
                checkpoint.partition_id,
                format!("container {} does not exist", self.container),
            ));
        }

        let key = checkpoint_key(
            &checkpoint.entity_name,
            &checkpoint.consumer_group,
            &checkpoint.partition_id,
        );
        self.checkpoints.insert(key, checkpoint);
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        entity_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>> {
        check_key_segments(&[
            ("entity name", entity_name),
            ("consumer group", consumer_group),
        ])?;
        let prefix = checkpoint_prefix(entity_name, consumer_group);
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.value().clone())
            .collect();
        checkpoints.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(checkpoints)
    }
}

/// Where checkpoint containers live, chosen from the checkpoint storage connection string.
#[derive(Clone)]
pub enum CheckpointStorage {
    /// `memory://` - containers shared by everything in this process.
    Memory(Arc<DashMap<String, Arc<InMemoryCheckpointStore>>>),
    /// `s3://` or an `http(s)://` endpoint.
    S3(aws_sdk_s3::Client),
}

impl CheckpointStorage {
    pub fn in_memory() -> Self {
        CheckpointStorage::Memory(Arc::new(DashMap::new()))
    }

    pub async fn connect(connection_string: &str, region: Option<&str>) -> Result<Self> {
        let connection_string = connection_string.trim();
        if connection_string.is_empty() {
            return Err(EventHubError::invalid_argument(
                "checkpoint storage connection string can't be empty",
            ));
        }

        if connection_string.starts_with("memory://") {
            return Ok(Self::in_memory());
        }

        let endpoint = if connection_string.starts_with("s3://") {
            None
        } else if connection_string.starts_with("http://")
            || connection_string.starts_with("https://")
        {
            Some(connection_string)
        } else {
            return Err(EventHubError::invalid_argument(format!(
                "unsupported checkpoint storage connection string: {connection_string}"
            )));
        };

        Ok(CheckpointStorage::S3(
            s3::create_s3_client(endpoint, region).await,
        ))
    }

    pub fn store(&self, container: &str) -> Arc<dyn CheckpointStore> {
        match self {
            CheckpointStorage::Memory(containers) => {
                let store: Arc<InMemoryCheckpointStore> = containers
                    .entry(container.to_string())
                    .or_insert_with(|| Arc::new(InMemoryCheckpointStore::new(container)))
                    .value()
                    .clone();
                store
            }
            CheckpointStorage::S3(client) => {
                Arc::new(S3CheckpointStore::new(client.clone(), container))
            }
        }
    }
}
