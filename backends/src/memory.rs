use crate::backend::{Backend, BackendType, ObjectInfo};
use async_trait::async_trait;
use blocksnap_core::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Process-local object store, mostly for tests.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, (Bytes, DateTime<Utc>)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Replaces an object's bytes without touching anything else.
    pub fn corrupt(&self, path: &str, data: Bytes) -> Result<()> {
        let mut objects = self.objects.write();
        let entry = objects.get_mut(path).ok_or_else(|| Error::not_found("blob", path))?;
        entry.0 = data;
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(path))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(path)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::not_found("blob", path))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        self.objects.write().insert(path.to_string(), (data, Utc::now()));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("blob", path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<ObjectInfo> {
        let objects = self.objects.read();
        let (data, modified) = objects.get(path).ok_or_else(|| Error::not_found("blob", path))?;
        Ok(ObjectInfo {
            path: path.to_string(),
            size: data.len() as u64,
            modified: *modified,
        })
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}
