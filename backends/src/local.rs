use crate::backend::{Backend, BackendType, ObjectInfo};
use async_trait::async_trait;
use blocksnap_core::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    fn map_error(path: &str, action: &str, e: std::io::Error) -> Error {
        if e.kind() == ErrorKind::NotFound {
            Error::not_found("blob", path)
        } else {
            Error::Backend(format!("Failed to {} {}: {}", action, path, e))
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path))
            .await
            .map_err(|e| Self::map_error(path, "read", e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Readers never observe a partially written object.
        let mut tmp_path = full_path.clone().into_os_string();
        tmp_path.push(".tmp");
        fs::write(&tmp_path, &data)
            .await
            .map_err(|e| Error::Backend(format!("Failed to write {}: {}", path, e)))?;
        fs::rename(&tmp_path, &full_path)
            .await
            .map_err(|e| Error::Backend(format!("Failed to write {}: {}", path, e)))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path))
            .await
            .map_err(|e| Self::map_error(path, "delete", e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut pending = vec![prefix.trim_end_matches('/').to_string()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(self.full_path(&dir)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let key = if dir.is_empty() { name } else { format!("{}/{}", dir, name) };
                if entry.file_type().await?.is_dir() {
                    pending.push(key);
                } else if !key.ends_with(".tmp") {
                    results.push(key);
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn stat(&self, path: &str) -> Result<ObjectInfo> {
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| Self::map_error(path, "stat", e))?;

        let modified = metadata
            .modified()
            .map_err(|e| Error::Backend(format!("Failed to get modified time: {}", e)))?;
        let modified: DateTime<Utc> = modified.into();

        Ok(ObjectInfo {
            path: path.to_string(),
            size: metadata.len(),
            modified,
        })
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}
