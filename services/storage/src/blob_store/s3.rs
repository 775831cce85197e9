use super::{bounded, validate_key, BlobEntry, BlobStore, StorageError};
use crate::config::S3Config;
use crate::layout::content_type_for;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier,
};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// S3 DeleteObjects accepts at most this many keys per request
const MAX_DELETE_BATCH: usize = 1000;

/// Concurrent HEAD requests while checking a delete batch
const HEAD_CONCURRENCY: usize = 16;

/// Blob store backed by an S3-compatible bucket
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
    timeout: Duration,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config, timeout: Duration) -> Result<Self, StorageError> {
        if config.bucket.is_empty() {
            return Err(StorageError::Backend("S3 bucket name is empty".to_string()));
        }

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
            timeout,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Simple single-part upload for small blobs
    async fn simple_upload(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| map_sdk_error("put_object", key, e))?;

        Ok(())
    }

    /// Multipart upload for large blobs
    async fn multipart_upload(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| map_sdk_error("create_multipart_upload", key, e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Backend("No upload ID in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, &data).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("complete_multipart_upload", key, e))?;

                Ok(())
            }
            Err(e) => {
                // Leave no dangling parts behind
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        data: &Bytes,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < data.len() {
            let end = (offset + part_size).min(data.len());
            let body = ByteStream::from(data.slice(offset..end));

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| map_sdk_error("upload_part", key, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            part_number += 1;
            offset = end;
        }

        Ok(completed_parts)
    }

    async fn delete_batch(&self, keys: &[String]) -> Vec<(String, Result<bool, StorageError>)> {
        let identifiers: Result<Vec<_>, _> = keys
            .iter()
            .map(|k| ObjectIdentifier::builder().key(k).build())
            .collect();

        let delete = match identifiers
            .map_err(|e| StorageError::Backend(e.to_string()))
            .and_then(|objects| {
                Delete::builder()
                    .set_objects(Some(objects))
                    .quiet(false)
                    .build()
                    .map_err(|e| StorageError::Backend(e.to_string()))
            }) {
            Ok(delete) => delete,
            Err(e) => {
                let msg = e.to_string();
                return keys
                    .iter()
                    .map(|k| (k.clone(), Err(StorageError::Backend(msg.clone()))))
                    .collect();
            }
        };

        let response = bounded(self.timeout, "s3 delete_objects", async {
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| map_sdk_error("delete_objects", "<batch>", e))
        })
        .await;

        match response {
            Ok(output) => {
                let failed: Vec<(String, String)> = output
                    .errors()
                    .iter()
                    .filter_map(|e| {
                        e.key().map(|k| {
                            (k.to_string(), e.message().unwrap_or("unknown error").to_string())
                        })
                    })
                    .collect();
                batch_results(keys, &failed)
            }
            Err(e) => {
                let msg = e.to_string();
                keys.iter()
                    .map(|k| (k.clone(), Err(StorageError::Unavailable(msg.clone()))))
                    .collect()
            }
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self, data), fields(key = %key, size_bytes = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        validate_key(key)?;
        let size = data.len();

        bounded(self.timeout, "s3 put", async {
            if size > self.config.multipart_threshold_bytes {
                self.multipart_upload(key, data).await
            } else {
                self.simple_upload(key, data).await
            }
        })
        .await?;

        debug!(key = %key, size_bytes = size, "Blob uploaded");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        validate_key(key)?;
        bounded(self.timeout, "s3 get", async {
            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_sdk_error("get_object", key, e))?;

            let body = response
                .body
                .collect()
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to read S3 body: {e}")))?;

            Ok(body.into_bytes())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        // DeleteObject succeeds for missing keys, so existence is checked first
        if !self.exists(key).await? {
            return Ok(false);
        }

        bounded(self.timeout, "s3 delete", async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_sdk_error("delete_object", key, e))?;
            Ok(())
        })
        .await?;

        debug!(key = %key, "Blob deleted from S3");
        Ok(true)
    }

    async fn delete_many(&self, keys: &[String]) -> Vec<(String, Result<bool, StorageError>)> {
        let mut results = Vec::with_capacity(keys.len());
        let mut valid = Vec::with_capacity(keys.len());

        for key in keys {
            match validate_key(key) {
                Ok(()) => valid.push(key.clone()),
                Err(e) => results.push((key.clone(), Err(e))),
            }
        }

        // DeleteObjects reports missing keys as deleted, so only existing keys are sent
        let checks: Vec<(String, Result<bool, StorageError>)> = stream::iter(valid)
            .map(|key| async move {
                let found = self.exists(&key).await;
                (key, found)
            })
            .buffer_unordered(HEAD_CONCURRENCY)
            .collect()
            .await;
        let (present, settled) = split_by_existence(checks);
        results.extend(settled);

        let batch_size = self.config.delete_batch_size.clamp(1, MAX_DELETE_BATCH);
        for chunk in present.chunks(batch_size) {
            results.extend(self.delete_batch(chunk).await);
        }

        results
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = bounded(self.timeout, "s3 list", async {
                self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix)
                    .max_keys(self.config.list_page_size)
                    .set_continuation_token(continuation.clone())
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("list_objects_v2", prefix, e))
            })
            .await?;

            entries.extend(page.contents().iter().filter_map(|obj| {
                obj.key().map(|key| BlobEntry {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                })
            }));

            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(prefix = %prefix, count = entries.len(), "Listed blobs");
        Ok(entries)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        let result = bounded(self.timeout, "s3 head", async {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    if e.as_service_error()
                        .map(|e| e.is_not_found())
                        .unwrap_or(false)
                    {
                        Ok(false)
                    } else {
                        Err(map_sdk_error("head_object", key, e))
                    }
                }
            }
        })
        .await?;

        Ok(result)
    }
}

/// Keys that exist, plus final outcomes for keys that are missing or could not be checked
fn split_by_existence(
    checks: Vec<(String, Result<bool, StorageError>)>,
) -> (Vec<String>, Vec<(String, Result<bool, StorageError>)>) {
    let mut present = Vec::new();
    let mut settled = Vec::new();
    for (key, found) in checks {
        match found {
            Ok(true) => present.push(key),
            Ok(false) => settled.push((key, Ok(false))),
            Err(e) => settled.push((key, Err(e))),
        }
    }
    (present, settled)
}

/// Per-key outcome of a DeleteObjects call over keys known to exist
fn batch_results(
    keys: &[String],
    failed: &[(String, String)],
) -> Vec<(String, Result<bool, StorageError>)> {
    keys.iter()
        .map(|key| match failed.iter().find(|(k, _)| k == key) {
            Some((_, msg)) => (key.clone(), Err(StorageError::Backend(msg.clone()))),
            None => (key.clone(), Ok(true)),
        })
        .collect()
}

/// Translate an SDK failure into the storage taxonomy
fn map_sdk_error<E, R>(op: &str, key: &str, err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(service) => {
            let code = service.err().code().unwrap_or_default();
            if matches!(code, "NoSuchKey" | "NotFound") {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Backend(format!("{op} failed for {key}: {code} {}", service.err()))
            }
        }
        SdkError::TimeoutError(_) => StorageError::Timeout(format!("{op} timed out for {key}")),
        SdkError::DispatchFailure(_) => {
            StorageError::Unavailable(format!("{op} could not reach S3: {err:?}"))
        }
        _ => StorageError::Backend(format!("{op} failed for {key}: {err}")),
    }
}
