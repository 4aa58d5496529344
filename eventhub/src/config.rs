use std::time::Duration;

use envconfig::Envconfig;

use crate::types::{CheckpointMode, StartPosition};

#[derive(Envconfig, Clone, Debug)]
pub struct EventHubConfig {
    // Either a bootstrap list (host:9092,...) or an Endpoint=sb://... namespace connection string
    #[envconfig(default = "localhost:9092")]
    pub eventhub_connection_string: String,

    // memory://, s3:// or an http(s):// endpoint for MinIO and local dev
    #[envconfig(default = "memory://")]
    pub checkpoint_storage_connection_string: String,

    // Defaults to the entity name when unset
    pub checkpoint_storage_container: Option<String>,

    pub checkpoint_storage_region: Option<String>,

    #[envconfig(default = "latest")]
    pub eventhub_start_position: StartPosition,

    #[envconfig(default = "batch")]
    pub eventhub_checkpoint_mode: CheckpointMode,

    #[envconfig(default = "100")]
    pub eventhub_max_batch_size: usize,

    #[envconfig(default = "3")]
    pub retry_max_attempts: u32,

    #[envconfig(default = "800")]
    pub retry_initial_backoff_ms: u64,

    #[envconfig(default = "60000")]
    pub retry_max_backoff_ms: u64,

    #[envconfig(default = "300")] // 5 minutes, provisioning touches external storage
    pub provisioning_timeout_secs: u64,

    #[envconfig(default = "30")]
    pub processor_shutdown_grace_secs: u64,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "60000")]
    pub kafka_session_timeout_ms: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            kafka_producer_linger_ms: 20,
            kafka_producer_queue_mib: 400,
            kafka_message_timeout_ms: 20000,
            kafka_compression_codec: "none".to_string(),
            kafka_tls: false,
            kafka_session_timeout_ms: 60000,
        }
    }
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            eventhub_connection_string: "localhost:9092".to_string(),
            checkpoint_storage_connection_string: "memory://".to_string(),
            checkpoint_storage_container: None,
            checkpoint_storage_region: None,
            eventhub_start_position: StartPosition::Latest,
            eventhub_checkpoint_mode: CheckpointMode::Batch,
            eventhub_max_batch_size: 100,
            retry_max_attempts: 3,
            retry_initial_backoff_ms: 800,
            retry_max_backoff_ms: 60000,
            provisioning_timeout_secs: 300,
            processor_shutdown_grace_secs: 30,
            kafka: KafkaConfig::default(),
        }
    }
}

impl EventHubConfig {
    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions::new(
            self.retry_max_attempts,
            2,
            Duration::from_millis(self.retry_initial_backoff_ms),
            Some(Duration::from_millis(self.retry_max_backoff_ms)),
        )
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn processor_shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.processor_shutdown_grace_secs)
    }
}

/// Retry policy shared by the broker clients and checkpoint container provisioning.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryOptions {
    /// Attempts after the first one.
    max_retries: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<Duration>,
}

impl RetryOptions {
    pub fn new(
        max_retries: u32,
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            max_retries,
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    /// Backoff to wait before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let candidate = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate, max_interval),
            None => candidate,
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(800),
            maximum_interval: Some(Duration::from_secs(60)),
        }
    }
}
