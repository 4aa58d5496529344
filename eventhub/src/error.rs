use std::time::Duration;

use thiserror::Error;

use crate::types::EntityRef;

/// Enumeration of errors surfaced by the event hub operation layer.
///
/// Synchronous precondition failures (`InvalidArgument`, `AlreadyExists`, `NotFound`) are
/// returned directly by the call that violated them. Broker and checkpoint failures are
/// only ever observed through the result of the send or checkpoint operation that caused them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventHubError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("a processor group already exists for {0}")]
    AlreadyExists(EntityRef),
    #[error("nothing is tracked for {0}")]
    NotFound(String),
    #[error("broker connection failed: {0}")]
    ConnectionFailure(String),
    #[error("checkpoint failed for partition {partition_id}: {reason}")]
    CheckpointFailure {
        partition_id: String,
        reason: String,
    },
    #[error("failed to convert message: {0}")]
    Conversion(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl EventHubError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        EventHubError::InvalidArgument(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        EventHubError::ConnectionFailure(message.into())
    }

    pub fn checkpoint(partition_id: impl Into<String>, reason: impl Into<String>) -> Self {
        EventHubError::CheckpointFailure {
            partition_id: partition_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EventHubError::ConnectionFailure(_) | EventHubError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for EventHubError {
    fn from(err: serde_json::Error) -> Self {
        EventHubError::Conversion(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for EventHubError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        EventHubError::ConnectionFailure(err.to_string())
    }
}

pub type Result<T, E = EventHubError> = std::result::Result<T, E>;
