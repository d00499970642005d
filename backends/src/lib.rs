pub mod backend;
pub mod block_store;
pub mod local;
pub mod memory;
pub mod retry;
pub mod s3;

pub use backend::{Backend, BackendType, ObjectInfo};
pub use block_store::{
    BlobMetadata, BlockData, BlockStore, BlockStoreOptions, ReadCompletion, SaveCompletion,
};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use retry::{RetryPolicy, Retryable, retry_with_backoff};
pub use s3::S3Backend;

use blocksnap_core::codec::CodecChain;
use blocksnap_core::config::{Config, StorageConfig};
use blocksnap_core::{Error, HashFunction, Result};
use std::sync::Arc;
use tracing::info;

/// Builds the raw backend named by the storage configuration.
pub async fn backend_from_config(storage: &StorageConfig) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match storage.backend.as_str() {
        "file" => {
            let path = storage
                .path
                .as_ref()
                .ok_or_else(|| Error::Configuration("File storage needs a path".to_string()))?;
            Arc::new(LocalBackend::new(path))
        }
        "s3" => {
            let bucket = storage
                .bucket
                .clone()
                .ok_or_else(|| Error::Configuration("S3 storage needs a bucket".to_string()))?;
            match &storage.endpoint {
                Some(endpoint) => Arc::new(S3Backend::with_endpoint(bucket, storage.prefix.clone(), endpoint.clone()).await?),
                None => Arc::new(S3Backend::new(bucket, storage.prefix.clone()).await?),
            }
        }
        "memory" => Arc::new(MemoryBackend::new()),
        other => return Err(Error::Configuration(format!("Unknown storage backend {}", other))),
    };
    backend.init().await?;
    info!(backend = ?backend.backend_type(), "Storage backend ready");
    Ok(backend)
}

/// Opens the block store described by `config`.
pub async fn block_store_from_config(config: &Config) -> Result<BlockStore> {
    let backend = backend_from_config(&config.storage).await?;
    let codec = CodecChain::from_config(config)?;
    let options = BlockStoreOptions {
        simultaneous_reads: config.storage.simultaneous_reads,
        simultaneous_writes: config.storage.simultaneous_writes,
        bandwidth_read: config.storage.bandwidth_read,
        bandwidth_write: config.storage.bandwidth_write,
        hash_function: HashFunction::from_name(&config.hash_function)?,
    };
    Ok(BlockStore::new(backend, codec, options))
}
