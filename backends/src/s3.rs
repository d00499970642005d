use crate::backend::{Backend, BackendType, ObjectInfo};
use crate::retry::{RetryPolicy, retry_with_backoff};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use blocksnap_core::{Error, Result};
use bytes::Bytes;
use tracing::debug;

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
    read_retry: RetryPolicy,
    write_retry: RetryPolicy,
    delete_retry: RetryPolicy,
}

impl S3Backend {
    pub async fn new(bucket: String, prefix: String) -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// S3-compatible services (MinIO, Ceph RGW) need path-style addressing.
    pub async fn with_endpoint(bucket: String, prefix: String, endpoint: String) -> Result<Self> {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .load()
            .await;
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        Ok(Self::with_client(Client::from_conf(config), bucket, prefix))
    }

    fn with_client(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
            read_retry: RetryPolicy::reads(),
            write_retry: RetryPolicy::writes(),
            delete_retry: RetryPolicy::deletes(),
        }
    }

    fn full_key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn is_not_found(message: &str) -> bool {
        message.contains("NotFound") || message.contains("NoSuchKey") || message.contains("404")
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn init(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Error::Configuration(format!("Bucket {} not accessible: {}", self.bucket, e)))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = format!("{:?}", e);
                if Self::is_not_found(&message) {
                    Ok(false)
                } else {
                    Err(Error::Backend(format!("Failed to check existence of {}: {}", path, e)))
                }
            }
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let key = &self.full_key(path);
        let (client, bucket) = (&self.client, &self.bucket);
        retry_with_backoff(&self.read_retry, "read", path, move || async move {
            let response = client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    let message = format!("{:?}", e);
                    if Self::is_not_found(&message) {
                        Error::not_found("blob", path)
                    } else {
                        Error::Backend(format!("Failed to read {}: {}", path, e))
                    }
                })?;
            let data = response
                .body
                .collect()
                .await
                .map_err(|e| Error::Backend(format!("Failed to read body of {}: {}", path, e)))?;
            Ok(data.into_bytes())
        })
        .await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let key = &self.full_key(path);
        let (client, bucket, data) = (&self.client, &self.bucket, &data);
        retry_with_backoff(&self.write_retry, "write", path, move || async move {
            client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data.clone()))
                .send()
                .await
                .map_err(|e| Error::Backend(format!("Failed to write {}: {}", path, e)))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        // S3 deletes are idempotent, so absence has to be checked first.
        if !self.exists(path).await? {
            return Err(Error::not_found("blob", path));
        }
        let key = &self.full_key(path);
        let (client, bucket) = (&self.client, &self.bucket);
        retry_with_backoff(&self.delete_retry, "delete", path, move || async move {
            client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Error::Backend(format!("Failed to delete {}: {}", path, e)))?;
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut results = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Backend(format!("Failed to list {}: {}", prefix, e)))?;

            for object in response.contents.unwrap_or_default() {
                if let Some(key) = object.key {
                    let path = if self.prefix.is_empty() {
                        key
                    } else {
                        key.strip_prefix(&format!("{}/", self.prefix))
                            .map(str::to_string)
                            .unwrap_or(key)
                    };
                    results.push(path);
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        debug!(prefix, count = results.len(), "Listed objects");
        Ok(results)
    }

    async fn stat(&self, path: &str) -> Result<ObjectInfo> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| {
                let message = format!("{:?}", e);
                if Self::is_not_found(&message) {
                    Error::not_found("blob", path)
                } else {
                    Error::Backend(format!("Failed to stat {}: {}", path, e))
                }
            })?;

        let size = response.content_length.unwrap_or(0) as u64;
        let modified = response
            .last_modified
            .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0))
            .unwrap_or_else(chrono::Utc::now);

        Ok(ObjectInfo {
            path: path.to_string(),
            size,
            modified,
        })
    }

    fn backend_type(&self) -> BackendType {
        BackendType::S3
    }
}
