//! Native AWS S3 SDK backend
//!
//! Works against AWS and S3-compatible endpoints (MinIO, Ceph, Wasabi).
//! Large files go up as multipart uploads; every call is retried with
//! exponential backoff.

use super::remote::{join_key, ObjectMetadata, RemoteStorage};
use crate::config::RemoteSettings;
use crate::error::{IoResultExt, Result, TableSyncError};
use crate::ingest::RetryPolicy;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Maximum concurrent S3 calls per client
const DEFAULT_MAX_CONCURRENT: usize = 16;

/// Files above this size are uploaded in parts: 100 MB.
const MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Part size for multipart uploads: 8 MB.
const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

/// S3 remote storage
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl S3Storage {
    /// Build a client from remote settings and the AWS credential chain
    pub async fn new(settings: &RemoteSettings) -> Result<Self> {
        let settings = settings.clone().with_env_fallbacks();
        let bucket = settings
            .bucket
            .clone()
            .ok_or_else(|| TableSyncError::config("S3 remote requires a bucket"))?;
        let region = settings
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));
        if let Some(ref endpoint) = settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Ok(key_id), Ok(secret)) = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            let creds = aws_credential_types::Credentials::new(
                key_id,
                secret,
                std::env::var("AWS_SESSION_TOKEN").ok(),
                None,
                "tablesync-env",
            );
            loader = loader.credentials_provider(creds);
        }
        let aws_config = loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if settings.path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config.build()),
            bucket,
            prefix: settings.key_prefix(),
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            retry: RetryPolicy {
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(64),
                ..RetryPolicy::default()
            },
        })
    }

    fn full_key(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }

    /// Run `op` with a concurrency permit, retrying failures
    async fn with_retries<T, F, Fut>(&self, what: &str, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| TableSyncError::transfer(key, format!("semaphore closed: {}", e)))?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        "S3 {} of {} failed (attempt {}/{}): {}. Retrying in {}",
                        what,
                        key,
                        attempt,
                        self.retry.max_attempts,
                        e,
                        humantime::format_duration(delay)
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_head(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => Ok(Some(ObjectMetadata {
                size: head.content_length().unwrap_or(0).max(0) as u64,
                updated_at: head
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
            })),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    Ok(None)
                } else {
                    Err(TableSyncError::transfer(
                        key,
                        format!("S3 head_object failed: {}", service),
                    ))
                }
            }
        }
    }

    async fn try_download(&self, key: &str, local: &Path) -> Result<u64> {
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_path(parent)?;
        }

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| TableSyncError::transfer(key, format!("S3 get_object failed: {}", e)))?;
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| TableSyncError::transfer(key, format!("S3 body read failed: {}", e)))?;

        let bytes = body.into_bytes();
        tokio::fs::write(local, &bytes).await.with_path(local)?;
        Ok(bytes.len() as u64)
    }

    async fn try_simple_upload(&self, key: &str, data: &[u8]) -> Result<u64> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| TableSyncError::transfer(key, format!("S3 put_object failed: {}", e)))?;
        Ok(data.len() as u64)
    }

    async fn try_multipart_upload(&self, key: &str, data: &[u8]) -> Result<u64> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                TableSyncError::transfer(key, format!("S3 create_multipart_upload failed: {}", e))
            })?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| TableSyncError::transfer(key, "missing multipart upload id"))?
            .to_string();

        let mut parts = Vec::new();
        for (i, chunk) in data.chunks(MULTIPART_PART_SIZE).enumerate() {
            let part_number = i as i32 + 1;
            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| TableSyncError::transfer(key, format!("S3 upload_part failed: {}", e)))?;
            parts.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(part.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| {
                TableSyncError::transfer(key, format!("S3 complete_multipart_upload failed: {}", e))
            })?;
        Ok(data.len() as u64)
    }
}

#[async_trait]
impl RemoteStorage for S3Storage {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        Ok(self.get_metadata(key).await?.is_some())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let full_key = self.full_key(key);
        self.with_retries("head", &full_key, || self.try_head(&full_key))
            .await
    }

    async fn upload_file(&self, local: &Path, key: &str) -> Result<u64> {
        let full_key = self.full_key(key);
        let data = tokio::fs::read(local).await.with_path(local)?;
        let multipart = data.len() as u64 > MULTIPART_THRESHOLD;
        let (data, target) = (&data, &full_key);

        let bytes = self
            .with_retries("upload", &full_key, || async move {
                if multipart {
                    self.try_multipart_upload(target, data).await
                } else {
                    self.try_simple_upload(target, data).await
                }
            })
            .await?;
        tracing::debug!(
            "Uploaded {} to s3://{}/{} ({})",
            local.display(),
            self.bucket,
            full_key,
            humansize::format_size(bytes, humansize::BINARY)
        );
        Ok(bytes)
    }

    async fn download_file(&self, key: &str, local: &Path) -> Result<u64> {
        let full_key = self.full_key(key);
        self.with_retries("download", &full_key, || self.try_download(&full_key, &local))
            .await
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| {
                    TableSyncError::transfer(&full_prefix, format!("S3 list_objects_v2 failed: {}", e))
                })?;

            for object in page.contents() {
                if let Some(key) = object.key() {
                    let relative = key.strip_prefix(self.prefix.as_str()).unwrap_or(key);
                    keys.push(relative.to_string());
                }
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }
}
