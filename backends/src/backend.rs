use async_trait::async_trait;
use blocksnap_core::Result;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    S3,
    Memory,
}

/// Raw keyed object storage. Keys are `/`-separated relative paths.
///
/// `read` and `stat` of a missing key fail with `Error::NotFound { what: "blob", .. }`
/// and `delete` of a missing key does too, so callers can tell absence from
/// transport trouble.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn read(&self, path: &str) -> Result<Bytes>;

    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Every key below `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn stat(&self, path: &str) -> Result<ObjectInfo>;

    fn backend_type(&self) -> BackendType;
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    pub modified: chrono::DateTime<chrono::Utc>,
}
