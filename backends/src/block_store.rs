//! Content-addressed blob store with codec chain, side-car metadata and
//! throttled reader/writer worker pools.
//!
//! Queued jobs are pulled by a fixed number of worker tasks from a bounded
//! channel. Results come back through an unbounded completion channel in the
//! order jobs finish, each carrying its own `Result`. Synchronous calls run on
//! the caller's task and never overtake queued work in the completion stream.

use crate::backend::Backend;
use blocksnap_core::codec::{CodecChain, TransformRecord};
use blocksnap_core::metadata::MetadataDocument;
use blocksnap_core::throttle::TokenBucket;
use blocksnap_core::{Block, BlockUid, Error, HashFunction, Result, VersionUid};
use bytes::Bytes;
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const BLOB_METADATA_VERSION: &str = "1.0.0";
const META_SUFFIX: &str = ".meta";
const BLOCKS_PREFIX: &str = "blocks/";
const VERSIONS_PREFIX: &str = "versions/";
/// Extra queue capacity beyond one job per worker.
const QUEUE_SLACK: usize = 2;

/// Side-car stored next to every blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub metadata_version: String,
    /// Plaintext size.
    pub size: u64,
    /// Size of the object after all transforms.
    pub object_size: u64,
    /// Checksum of the plaintext.
    pub checksum: String,
    pub transforms: Vec<TransformRecord>,
}

impl BlobMetadata {
    fn parse(key: &str, raw: &[u8]) -> Result<Self> {
        let metadata: Self = serde_json::from_slice(raw)
            .map_err(|e| Error::Corrupt(format!("Unreadable metadata for {}: {}", key, e)))?;
        if metadata.metadata_version != BLOB_METADATA_VERSION {
            return Err(Error::Corrupt(format!(
                "Metadata for {} has unsupported version {}",
                key, metadata.metadata_version
            )));
        }
        Ok(metadata)
    }
}

#[derive(Debug, Clone)]
pub struct BlockStoreOptions {
    pub simultaneous_reads: usize,
    pub simultaneous_writes: usize,
    /// Bytes per second, 0 for unlimited.
    pub bandwidth_read: u64,
    pub bandwidth_write: u64,
    pub hash_function: HashFunction,
}

impl Default for BlockStoreOptions {
    fn default() -> Self {
        Self {
            simultaneous_reads: 3,
            simultaneous_writes: 3,
            bandwidth_read: 0,
            bandwidth_write: 0,
            hash_function: HashFunction::Blake3,
        }
    }
}

/// Bytes of a blob read back together with its side-car. `data` is empty for
/// metadata-only reads.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub data: Bytes,
    pub metadata: BlobMetadata,
}

#[derive(Debug)]
pub struct SaveCompletion {
    /// The submitted block with `uid` set on success.
    pub block: Block,
    pub result: Result<BlockUid>,
}

#[derive(Debug)]
pub struct ReadCompletion {
    pub block: Block,
    pub result: Result<BlockData>,
}

struct SaveJob {
    block: Block,
    data: Bytes,
}

struct ReadJob {
    block: Block,
    metadata_only: bool,
}

/// What a pool of workers needs to do a job.
#[derive(Clone)]
struct Shared {
    backend: Arc<dyn Backend>,
    codec: Arc<CodecChain>,
    hash_function: HashFunction,
    read_bucket: Arc<TokenBucket>,
    write_bucket: Arc<TokenBucket>,
    fatal: Arc<Mutex<Option<String>>>,
    cancelled: Arc<AtomicBool>,
}

impl Shared {
    fn check_fatal(&self) -> Result<()> {
        match self.fatal.lock().as_ref() {
            Some(message) => Err(Error::Internal(format!("A block store worker failed earlier: {}", message))),
            None => Ok(()),
        }
    }

    fn check_runnable(&self) -> Result<()> {
        self.check_fatal()?;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Internal("Block store was closed before the job started".to_string()));
        }
        Ok(())
    }

    async fn encode(&self, data: Bytes) -> Result<(Bytes, Vec<TransformRecord>)> {
        let codec = Arc::clone(&self.codec);
        let (encoded, transforms) = tokio::task::spawn_blocking(move || codec.encode(&data))
            .await
            .map_err(|e| Error::Internal(format!("Encoding task failed: {}", e)))??;
        Ok((Bytes::from(encoded), transforms))
    }

    async fn decode(&self, data: Bytes, transforms: Vec<TransformRecord>) -> Result<Bytes> {
        if transforms.is_empty() {
            return Ok(data);
        }
        let codec = Arc::clone(&self.codec);
        let decoded = tokio::task::spawn_blocking(move || codec.decode(data.to_vec(), &transforms))
            .await
            .map_err(|e| Error::Internal(format!("Decoding task failed: {}", e)))??;
        Ok(Bytes::from(decoded))
    }

    /// Encodes `data` and writes it with its side-car under `key`.
    async fn put_object(&self, key: &str, data: Bytes, checksum: String) -> Result<BlobMetadata> {
        let size = data.len() as u64;
        let (encoded, transforms) = self.encode(data).await?;
        let metadata = BlobMetadata {
            metadata_version: BLOB_METADATA_VERSION.to_string(),
            size,
            object_size: encoded.len() as u64,
            checksum,
            transforms,
        };
        let raw_metadata = Bytes::from(serde_json::to_vec(&metadata)?);

        self.write_bucket.throttle(encoded.len() as u64).await;
        self.backend.write(key, encoded).await?;
        self.backend.write(&format!("{}{}", key, META_SUFFIX), raw_metadata).await?;
        Ok(metadata)
    }

    async fn get_metadata(&self, key: &str) -> Result<BlobMetadata> {
        let raw = self.backend.read(&format!("{}{}", key, META_SUFFIX)).await?;
        BlobMetadata::parse(key, &raw)
    }

    /// Reads and decodes the object under `key`, checking it against its side-car.
    async fn get_object(&self, key: &str) -> Result<BlockData> {
        let metadata = self.get_metadata(key).await?;
        let raw = self.backend.read(key).await?;
        self.read_bucket.throttle(raw.len() as u64).await;
        if raw.len() as u64 != metadata.object_size {
            return Err(Error::Corrupt(format!(
                "Object {} has {} bytes, metadata says {}",
                key,
                raw.len(),
                metadata.object_size
            )));
        }
        let data = self.decode(raw, metadata.transforms.clone()).await?;
        if data.len() as u64 != metadata.size {
            return Err(Error::Corrupt(format!(
                "Object {} decodes to {} bytes, metadata says {}",
                key,
                data.len(),
                metadata.size
            )));
        }
        Ok(BlockData { data, metadata })
    }

    async fn save_block(&self, block: &Block, data: Bytes) -> Result<BlockUid> {
        self.check_runnable()?;
        if data.len() as u64 != block.size {
            return Err(Error::Internal(format!(
                "Block {} of {} has {} bytes but should have {}",
                block.id,
                block.version_uid,
                data.len(),
                block.size
            )));
        }
        let checksum = match &block.checksum {
            Some(checksum) => checksum.clone(),
            None => self.hash_function.checksum(&data),
        };

        let uid = BlockUid::generate();
        let key = block_key(uid)?;
        self.put_object(&key, data, checksum).await?;
        debug!(block = block.id, version = %block.version_uid, uid = %uid, "Saved block");
        Ok(uid)
    }

    async fn read_block(&self, block: &Block, metadata_only: bool) -> Result<BlockData> {
        self.check_runnable()?;
        let key = block_key(block.uid)?;

        let block_data = if metadata_only {
            let metadata = self.get_metadata(&key).await?;
            let info = self.backend.stat(&key).await?;
            if info.size != metadata.object_size {
                return Err(Error::Corrupt(format!(
                    "Object {} has {} bytes, metadata says {}",
                    key, info.size, metadata.object_size
                )));
            }
            BlockData {
                data: Bytes::new(),
                metadata,
            }
        } else {
            self.get_object(&key).await?
        };

        if block_data.metadata.size != block.size {
            return Err(Error::Corrupt(format!(
                "Block {} ({}) is {} bytes in the store, expected {}",
                block.id, block.uid, block_data.metadata.size, block.size
            )));
        }
        if let Some(expected) = &block.checksum {
            if *expected != block_data.metadata.checksum {
                return Err(Error::Corrupt(format!(
                    "Block {} ({}) has checksum {} in the store, expected {}",
                    block.id, block.uid, block_data.metadata.checksum, expected
                )));
            }
        }
        Ok(block_data)
    }

    fn record_panic(&self, what: &str) -> Error {
        let message = format!("{} worker panicked", what);
        error!("{}", message);
        *self.fatal.lock() = Some(message.clone());
        Error::Internal(message)
    }
}

fn block_key(uid: BlockUid) -> Result<String> {
    uid.storage_key()
        .ok_or_else(|| Error::Internal("Sparse blocks have no storage key".to_string()))
}

pub struct BlockStore {
    shared: Shared,
    save_tx: Option<mpsc::Sender<SaveJob>>,
    read_tx: Option<mpsc::Sender<ReadJob>>,
    save_done: mpsc::UnboundedReceiver<SaveCompletion>,
    read_done: mpsc::UnboundedReceiver<ReadCompletion>,
    workers: Vec<JoinHandle<()>>,
    pending_saves: usize,
    pending_reads: usize,
    simultaneous_writes: usize,
}

impl BlockStore {
    pub fn new(backend: Arc<dyn Backend>, codec: CodecChain, options: BlockStoreOptions) -> Self {
        let shared = Shared {
            backend,
            codec: Arc::new(codec),
            hash_function: options.hash_function,
            read_bucket: Arc::new(TokenBucket::new(options.bandwidth_read)),
            write_bucket: Arc::new(TokenBucket::new(options.bandwidth_write)),
            fatal: Arc::new(Mutex::new(None)),
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        let writers = options.simultaneous_writes.max(1);
        let readers = options.simultaneous_reads.max(1);
        let (save_tx, save_rx) = mpsc::channel::<SaveJob>(writers + QUEUE_SLACK);
        let (read_tx, read_rx) = mpsc::channel::<ReadJob>(readers + QUEUE_SLACK);
        let (save_done_tx, save_done) = mpsc::unbounded_channel();
        let (read_done_tx, read_done) = mpsc::unbounded_channel();
        let save_rx = Arc::new(AsyncMutex::new(save_rx));
        let read_rx = Arc::new(AsyncMutex::new(read_rx));

        let mut workers = Vec::with_capacity(writers + readers);
        for worker in 0..writers {
            let shared = shared.clone();
            let jobs = Arc::clone(&save_rx);
            let done = save_done_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { jobs.lock().await.recv().await };
                    let Some(SaveJob { mut block, data }) = job else { break };
                    let result = AssertUnwindSafe(shared.save_block(&block, data))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(shared.record_panic("Writer")));
                    if let Ok(uid) = &result {
                        block.uid = *uid;
                    }
                    if done.send(SaveCompletion { block, result }).is_err() {
                        break;
                    }
                }
                debug!(worker, "Writer finished");
            }));
        }
        for worker in 0..readers {
            let shared = shared.clone();
            let jobs = Arc::clone(&read_rx);
            let done = read_done_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { jobs.lock().await.recv().await };
                    let Some(ReadJob { block, metadata_only }) = job else { break };
                    let result = AssertUnwindSafe(shared.read_block(&block, metadata_only))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(shared.record_panic("Reader")));
                    if done.send(ReadCompletion { block, result }).is_err() {
                        break;
                    }
                }
                debug!(worker, "Reader finished");
            }));
        }

        Self {
            shared,
            save_tx: Some(save_tx),
            read_tx: Some(read_tx),
            save_done,
            read_done,
            workers,
            pending_saves: 0,
            pending_reads: 0,
            simultaneous_writes: writers,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }

    pub fn hash_function(&self) -> HashFunction {
        self.shared.hash_function
    }

    /// Queues `data` to be stored under a fresh uid. Waits only for queue space.
    pub async fn save(&mut self, block: Block, data: Bytes) -> Result<()> {
        self.shared.check_fatal()?;
        let tx = self
            .save_tx
            .as_ref()
            .ok_or_else(|| Error::Internal("Block store is closed".to_string()))?;
        tx.send(SaveJob { block, data })
            .await
            .map_err(|_| Error::Internal("Writer pool has shut down".to_string()))?;
        self.pending_saves += 1;
        Ok(())
    }

    /// Stores `data` and returns `block` with its new uid.
    pub async fn save_sync(&self, mut block: Block, data: Bytes) -> Result<Block> {
        block.uid = self.shared.save_block(&block, data).await?;
        Ok(block)
    }

    /// Queues a read of `block`'s blob.
    pub async fn read(&mut self, block: Block, metadata_only: bool) -> Result<()> {
        self.shared.check_fatal()?;
        let tx = self
            .read_tx
            .as_ref()
            .ok_or_else(|| Error::Internal("Block store is closed".to_string()))?;
        tx.send(ReadJob { block, metadata_only })
            .await
            .map_err(|_| Error::Internal("Reader pool has shut down".to_string()))?;
        self.pending_reads += 1;
        Ok(())
    }

    pub async fn read_sync(&self, block: &Block, metadata_only: bool) -> Result<BlockData> {
        self.shared.read_block(block, metadata_only).await
    }

    /// Side-car only, checked against `block`.
    pub async fn read_get_metadata(&self, block: &Block) -> Result<BlobMetadata> {
        Ok(self.shared.read_block(block, true).await?.metadata)
    }

    pub fn pending_saves(&self) -> usize {
        self.pending_saves
    }

    pub fn pending_reads(&self) -> usize {
        self.pending_reads
    }

    /// Save completions available right now.
    pub fn save_completed(&mut self) -> Vec<SaveCompletion> {
        let mut completed = Vec::new();
        while let Ok(completion) = self.save_done.try_recv() {
            completed.push(completion);
        }
        self.pending_saves -= completed.len().min(self.pending_saves);
        completed
    }

    /// Waits for the next save to finish; `None` once nothing is outstanding.
    pub async fn next_save_completed(&mut self) -> Option<SaveCompletion> {
        if self.pending_saves == 0 {
            return None;
        }
        let completion = self.save_done.recv().await?;
        self.pending_saves -= 1;
        Some(completion)
    }

    pub fn read_completed(&mut self) -> Vec<ReadCompletion> {
        let mut completed = Vec::new();
        while let Ok(completion) = self.read_done.try_recv() {
            completed.push(completion);
        }
        self.pending_reads -= completed.len().min(self.pending_reads);
        completed
    }

    pub async fn next_read_completed(&mut self) -> Option<ReadCompletion> {
        if self.pending_reads == 0 {
            return None;
        }
        let completion = self.read_done.recv().await?;
        self.pending_reads -= 1;
        Some(completion)
    }

    pub async fn rm(&self, uid: BlockUid) -> Result<()> {
        let key = block_key(uid)?;
        self.shared.backend.delete(&key).await?;
        if let Err(e) = self.shared.backend.delete(&format!("{}{}", key, META_SUFFIX)).await {
            warn!(uid = %uid, "Failed to remove metadata of deleted block: {}", e);
        }
        Ok(())
    }

    /// Best effort; returns the uids that could not be removed.
    pub async fn rm_many(&self, uids: &[BlockUid]) -> Vec<BlockUid> {
        let failed: Vec<BlockUid> = stream::iter(uids.iter().copied())
            .map(|uid| async move { (uid, self.rm(uid).await) })
            .buffer_unordered(self.simultaneous_writes)
            .filter_map(|(uid, result)| async move {
                match result {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(uid = %uid, "Failed to remove block: {}", e);
                        Some(uid)
                    }
                }
            })
            .collect()
            .await;
        debug!(requested = uids.len(), failed = failed.len(), "Removed blocks");
        failed
    }

    /// Every blob uid present in the store.
    pub async fn list_blocks(&self) -> Result<Vec<BlockUid>> {
        let keys = self.shared.backend.list(BLOCKS_PREFIX).await?;
        Ok(keys
            .iter()
            .filter(|key| !key.ends_with(META_SUFFIX))
            .filter_map(|key| {
                let uid = BlockUid::from_storage_key(key);
                if uid.is_none() {
                    warn!(key = %key, "Ignoring unexpected object in block store");
                }
                uid
            })
            .collect())
    }

    pub async fn write_version_metadata(
        &self,
        uid: VersionUid,
        document: &MetadataDocument,
        overwrite: bool,
    ) -> Result<()> {
        let key = uid.storage_key();
        if !overwrite && self.shared.backend.exists(&key).await? {
            return Err(Error::already_exists("version metadata", uid));
        }
        let data = Bytes::from(serde_json::to_vec(document)?);
        let checksum = self.shared.hash_function.checksum(&data);
        self.shared.put_object(&key, data, checksum).await?;
        info!(version = %uid, "Wrote version metadata backup");
        Ok(())
    }

    pub async fn read_version_metadata(&self, uid: VersionUid) -> Result<MetadataDocument> {
        let key = uid.storage_key();
        let BlockData { data, metadata } = self.shared.get_object(&key).await.map_err(|e| match e {
            Error::NotFound { .. } => Error::not_found("version metadata", uid),
            other => other,
        })?;
        if self.shared.hash_function.checksum(&data) != metadata.checksum {
            return Err(Error::Corrupt(format!("Version metadata of {} fails its checksum", uid)));
        }
        serde_json::from_slice(&data).map_err(|e| Error::InputData(format!("Version metadata of {}: {}", uid, e)))
    }

    pub async fn rm_version_metadata(&self, uid: VersionUid) -> Result<()> {
        let key = uid.storage_key();
        self.shared.backend.delete(&key).await.map_err(|e| match e {
            Error::NotFound { .. } => Error::not_found("version metadata", uid),
            other => other,
        })?;
        if let Err(e) = self.shared.backend.delete(&format!("{}{}", key, META_SUFFIX)).await {
            warn!(version = %uid, "Failed to remove side-car of version metadata: {}", e);
        }
        Ok(())
    }

    pub async fn list_version_metadata(&self) -> Result<Vec<VersionUid>> {
        let keys = self.shared.backend.list(VERSIONS_PREFIX).await?;
        let mut uids: Vec<VersionUid> = keys
            .iter()
            .filter(|key| !key.ends_with(META_SUFFIX))
            .filter_map(|key| key.strip_prefix(VERSIONS_PREFIX)?.parse().ok())
            .collect();
        uids.sort();
        Ok(uids)
    }

    /// Stops the worker pools. Jobs not yet started complete with an error;
    /// running jobs are waited for.
    pub async fn close(&mut self) -> Result<()> {
        if self.pending_saves + self.pending_reads > 0 {
            warn!(
                saves = self.pending_saves,
                reads = self.pending_reads,
                "Closing block store with outstanding jobs"
            );
            self.shared.cancelled.store(true, Ordering::SeqCst);
        }
        self.save_tx.take();
        self.read_tx.take();

        let mut failed = 0;
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!("Block store worker failed: {}", e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::Internal(format!("{} block store workers failed", failed)));
        }
        self.shared.check_fatal()
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.abort();
        }
    }
}
