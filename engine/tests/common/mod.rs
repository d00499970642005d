#![allow(dead_code)]

use async_trait::async_trait;
use blocksnap_backends::{Backend, BackendType, BlockStore, BlockStoreOptions, MemoryBackend, ObjectInfo};
use blocksnap_core::codec::CodecChain;
use blocksnap_core::{Config, Error, MetadataStore, Result};
use blocksnap_engine::Engine;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const BLOCK_SIZE: u64 = 4096;

pub fn config(dir: &Path) -> Config {
    Config {
        block_size: BLOCK_SIZE,
        metadata_path: dir.join("metadata.sqlite"),
        ..Default::default()
    }
}

/// An engine over a fresh metadata database in `dir` and `backend`.
pub fn engine_with(dir: &Path, backend: Arc<dyn Backend>) -> Engine {
    let config = config(dir);
    let meta = MetadataStore::open(&config.metadata_path, true).unwrap();
    let store = BlockStore::new(backend, CodecChain::plain(), BlockStoreOptions::default());
    Engine::with_parts(config, meta, store).unwrap()
}

pub fn engine(dir: &Path) -> (Engine, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    (engine_with(dir, backend.clone()), backend)
}

/// Deterministic, distinct content for block `id`.
pub fn block_content(id: u64, seed: u64, size: usize) -> Vec<u8> {
    let mut state = id.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ seed.wrapping_add(1);
    (0..size)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 56) as u8
        })
        .collect()
}

/// Image of `size` bytes; blocks listed in `zero` are all zeros.
pub fn image(size: u64, seed: u64, zero: &[u64]) -> Vec<u8> {
    let mut data = Vec::with_capacity(size as usize);
    let mut id = 0;
    while (data.len() as u64) < size {
        let length = (size - data.len() as u64).min(BLOCK_SIZE) as usize;
        if zero.contains(&id) {
            data.extend(std::iter::repeat_n(0u8, length));
        } else {
            data.extend(block_content(id, seed, length));
        }
        id += 1;
    }
    data
}

pub fn write_image(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

pub fn url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Number of stored blobs, side-cars and version metadata excluded.
pub async fn blob_count(engine: &Engine) -> usize {
    engine.block_store().list_blocks().await.unwrap().len()
}

/// Memory backend whose writes under `blocks/` start failing once a budget
/// set with [`FailingBackend::fail_after`] runs out.
pub struct FailingBackend {
    inner: MemoryBackend,
    remaining: AtomicUsize,
}

impl Default for FailingBackend {
    fn default() -> Self {
        Self {
            inner: MemoryBackend::new(),
            remaining: AtomicUsize::new(usize::MAX),
        }
    }
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `writes` more block writes through and fails the rest.
    pub fn fail_after(&self, writes: usize) {
        self.remaining.store(writes, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.remaining.store(usize::MAX, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for FailingBackend {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        if path.starts_with("blocks/")
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            return Err(Error::Backend(format!("injected write failure for {}", path)));
        }
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn stat(&self, path: &str) -> Result<ObjectInfo> {
        self.inner.stat(path).await
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}
