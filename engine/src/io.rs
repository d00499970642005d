//! Block-granular access to a backup source or restore target.
//!
//! Sources are regular files or block devices, named by a `file:` URL or a
//! plain path. Reads fan out to a small worker pool; each completion carries
//! the block, its bytes and their checksum.

use blocksnap_core::config::IoConfig;
use blocksnap_core::throttle::TokenBucket;
use blocksnap_core::{Block, Error, HashFunction, Result};
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const QUEUE_SLACK: usize = 2;

/// Turns `file:///dev/sda`, `file:/tmp/x` or `/tmp/x` into a path.
pub fn parse_url(url: &str) -> Result<PathBuf> {
    let path = match url.split_once(':') {
        Some(("file", rest)) => {
            let rest = rest.strip_prefix("//").unwrap_or(rest);
            if rest.is_empty() {
                return Err(Error::Usage(format!("URL {} names no path", url)));
            }
            rest
        }
        Some((scheme, _)) if !scheme.contains('/') && !scheme.is_empty() => {
            return Err(Error::Usage(format!("Unsupported I/O scheme {} in {}", scheme, url)));
        }
        _ => url,
    };
    if path.is_empty() {
        return Err(Error::Usage("Empty source path".to_string()));
    }
    Ok(PathBuf::from(path))
}

#[derive(Debug)]
pub struct SourceRead {
    pub block: Block,
    /// Bytes read and their checksum.
    pub result: Result<(Bytes, String)>,
}

#[derive(Clone)]
struct Shared {
    file: Arc<File>,
    hash_function: HashFunction,
    bucket: Arc<TokenBucket>,
    cancelled: Arc<AtomicBool>,
}

impl Shared {
    async fn read_block(&self, block: &Block, block_size: u64) -> Result<(Bytes, String)> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Internal("Source was closed before the read started".to_string()));
        }
        let offset = block.id * block_size;
        let length = block.size as usize;
        let file = Arc::clone(&self.file);
        let hash_function = self.hash_function;

        let (data, checksum) = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, String)> {
            let mut data = vec![0u8; length];
            file.read_exact_at(&mut data, offset)?;
            drop_page_cache(&file, offset, length as u64);
            let checksum = hash_function.checksum(&data);
            Ok((data, checksum))
        })
        .await
        .map_err(|e| Error::Internal(format!("Source read task failed: {}", e)))??;

        self.bucket.throttle(length as u64).await;
        Ok((Bytes::from(data), checksum))
    }
}

#[cfg(target_os = "linux")]
fn drop_page_cache(file: &File, offset: u64, length: u64) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor stays open for the duration of the call.
    let ret = unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            length as libc::off_t,
            libc::POSIX_FADV_DONTNEED,
        )
    };
    if ret != 0 {
        debug!(ret, "posix_fadvise failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn drop_page_cache(_file: &File, _offset: u64, _length: u64) {}

pub struct SourceIo {
    path: PathBuf,
    block_size: u64,
    size: u64,
    shared: Shared,
    write_bucket: TokenBucket,
    writable: bool,
    read_tx: Option<mpsc::Sender<Block>>,
    read_done: mpsc::UnboundedReceiver<SourceRead>,
    workers: Vec<JoinHandle<()>>,
    pending_reads: usize,
}

impl SourceIo {
    /// Opens `url` for reading.
    pub fn open_r(url: &str, block_size: u64, hash_function: HashFunction, config: &IoConfig) -> Result<Self> {
        let path = parse_url(url)?;
        let mut file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found("source", path.display()),
            _ => Error::Io(e),
        })?;
        let size = file.seek(SeekFrom::End(0))?;
        debug!(path = %path.display(), size, "Opened source for reading");
        Ok(Self::start(path, file, size, block_size, hash_function, config, false))
    }

    /// Opens `url` as a restore target of `size` bytes. An existing target
    /// is only used when `force` is set, and must be large enough.
    pub fn open_w(
        url: &str,
        size: u64,
        force: bool,
        block_size: u64,
        hash_function: HashFunction,
        config: &IoConfig,
    ) -> Result<Self> {
        let path = parse_url(url)?;
        let file = match std::fs::metadata(&path) {
            Ok(metadata) => {
                if !force {
                    return Err(Error::already_exists("restore target", path.display()));
                }
                let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
                if metadata.file_type().is_block_device() {
                    let available = file.seek(SeekFrom::End(0))?;
                    if available < size {
                        return Err(Error::Usage(format!(
                            "Restore target {} is too small: {} bytes, need {}",
                            path.display(),
                            available,
                            size
                        )));
                    }
                } else {
                    file.set_len(size)?;
                }
                file
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
                file.set_len(size)?;
                file
            }
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), size, force, "Opened restore target");
        Ok(Self::start(path, file, size, block_size, hash_function, config, true))
    }

    fn start(
        path: PathBuf,
        file: File,
        size: u64,
        block_size: u64,
        hash_function: HashFunction,
        config: &IoConfig,
        writable: bool,
    ) -> Self {
        let shared = Shared {
            file: Arc::new(file),
            hash_function,
            bucket: Arc::new(TokenBucket::new(config.bandwidth_read)),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let readers = config.simultaneous_reads.max(1);
        let (read_tx, read_rx) = mpsc::channel::<Block>(readers + QUEUE_SLACK);
        let (done_tx, read_done) = mpsc::unbounded_channel();
        let read_rx = Arc::new(AsyncMutex::new(read_rx));

        let workers = (0..readers)
            .map(|_| {
                let shared = shared.clone();
                let jobs = Arc::clone(&read_rx);
                let done = done_tx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { jobs.lock().await.recv().await };
                        let Some(block) = job else { break };
                        let result = shared.read_block(&block, block_size).await;
                        if done.send(SourceRead { block, result }).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            path,
            block_size,
            size,
            shared,
            write_bucket: TokenBucket::new(config.bandwidth_write),
            writable,
            read_tx: Some(read_tx),
            read_done,
            workers,
            pending_reads: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_block(&self, block: &Block) -> Result<()> {
        let end = block.id * self.block_size + block.size;
        if end > self.size {
            return Err(Error::Internal(format!(
                "Block {} ends at {} beyond the source size {}",
                block.id, end, self.size
            )));
        }
        Ok(())
    }

    /// Queues a read of `block`.
    pub async fn read(&mut self, block: Block) -> Result<()> {
        self.check_block(&block)?;
        let tx = self
            .read_tx
            .as_ref()
            .ok_or_else(|| Error::Internal("Source is closed".to_string()))?;
        tx.send(block)
            .await
            .map_err(|_| Error::Internal("Source readers have shut down".to_string()))?;
        self.pending_reads += 1;
        Ok(())
    }

    pub async fn read_sync(&self, block: &Block) -> Result<(Bytes, String)> {
        self.check_block(block)?;
        self.shared.read_block(block, self.block_size).await
    }

    pub fn pending_reads(&self) -> usize {
        self.pending_reads
    }

    pub fn read_completed(&mut self) -> Vec<SourceRead> {
        let mut completed = Vec::new();
        while let Ok(read) = self.read_done.try_recv() {
            completed.push(read);
        }
        self.pending_reads -= completed.len().min(self.pending_reads);
        completed
    }

    pub async fn next_read_completed(&mut self) -> Option<SourceRead> {
        if self.pending_reads == 0 {
            return None;
        }
        let read = self.read_done.recv().await?;
        self.pending_reads -= 1;
        Some(read)
    }

    /// Writes `data` at the position of `block`.
    pub async fn write(&self, block: &Block, data: Bytes) -> Result<()> {
        if !self.writable {
            return Err(Error::Internal(format!("{} is not open for writing", self.path.display())));
        }
        self.check_block(block)?;
        let offset = block.id * self.block_size;
        let length = data.len() as u64;
        let file = Arc::clone(&self.shared.file);
        tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|e| Error::Internal(format!("Target write task failed: {}", e)))??;
        self.write_bucket.throttle(length).await;
        Ok(())
    }

    /// Stops the readers and flushes a restore target. Reads that have not
    /// started yet complete with an error.
    pub async fn close(&mut self) -> Result<()> {
        if self.pending_reads > 0 {
            warn!(pending = self.pending_reads, path = %self.path.display(), "Closing source with outstanding reads");
            self.shared.cancelled.store(true, Ordering::SeqCst);
        }
        self.read_tx.take();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!("Source reader failed: {}", e);
            }
        }
        if self.writable {
            let file = Arc::clone(&self.shared.file);
            tokio::task::spawn_blocking(move || file.sync_all())
                .await
                .map_err(|e| Error::Internal(format!("Target sync task failed: {}", e)))??;
        }
        Ok(())
    }
}

impl Drop for SourceIo {
    fn drop(&mut self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.abort();
        }
    }
}
