//! Checkpoint container backed by an S3 bucket.
//!
//! One JSON object per partition, keyed `<entity>/<group>/checkpoint/<partition>`.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsS3SdkClient;
use tracing::{debug, info};

use super::{
    check_checkpoint, check_key_segments, checkpoint_key, checkpoint_prefix, CheckpointStore,
    ContainerCreation,
};
use crate::error::{EventHubError, Result};
use crate::types::Checkpoint;

/// Create an S3 client from the default credential chain.
///
/// A custom endpoint (MinIO, localstack) forces path-style addressing.
pub async fn create_s3_client(endpoint: Option<&str>, region: Option<&str>) -> AwsS3SdkClient {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region.to_string()));
    }
    let sdk_config = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if let Some(endpoint) = endpoint {
        info!(endpoint, "using custom S3 endpoint for checkpoints");
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    } else {
        debug!("using default AWS endpoint resolution for checkpoints");
    }

    AwsS3SdkClient::from_conf(builder.build())
}

pub struct S3CheckpointStore {
    client: AwsS3SdkClient,
    bucket: String,
}

impl S3CheckpointStore {
    pub fn new(client: AwsS3SdkClient, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    async fn get_checkpoint(&self, key: &str) -> Result<Checkpoint> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                EventHubError::connection(format!(
                    "failed to read checkpoint {key} from {}: {e}",
                    self.bucket
                ))
            })?;

        let body = output.body.collect().await.map_err(|e| {
            EventHubError::connection(format!("failed to read checkpoint body {key}: {e}"))
        })?;

        Ok(serde_json::from_slice(&body.into_bytes())?)
    }
}

#[async_trait]
impl CheckpointStore for S3CheckpointStore {
    fn container(&self) -> &str {
        &self.bucket
    }

    async fn container_exists(&self) -> Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(EventHubError::connection(format!(
                        "failed to check bucket {}: {service_error}",
                        self.bucket
                    )))
                }
            }
        }
    }

    async fn create_container(&self) -> Result<ContainerCreation> {
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(ContainerCreation::Created),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_bucket_already_owned_by_you()
                    || service_error.is_bucket_already_exists()
                {
                    Ok(ContainerCreation::AlreadyExists)
                } else {
                    Err(EventHubError::connection(format!(
                        "failed to create bucket {}: {service_error}",
                        self.bucket
                    )))
                }
            }
        }
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        check_checkpoint(&checkpoint)?;
        let key = checkpoint_key(
            &checkpoint.entity_name,
            &checkpoint.consumer_group,
            &checkpoint.partition_id,
        );
        let body = serde_json::to_vec(&checkpoint)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                EventHubError::checkpoint(
                    checkpoint.partition_id.clone(),
                    format!("failed to write {key} to {}: {e}", self.bucket),
                )
            })?;

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
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    EventHubError::connection(format!(
                        "failed to list checkpoints under {prefix}: {e}"
                    ))
                })?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        let mut checkpoints = Vec::with_capacity(keys.len());
        for key in keys {
            checkpoints.push(self.get_checkpoint(&key).await?);
        }
        checkpoints.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(checkpoints)
    }
}
