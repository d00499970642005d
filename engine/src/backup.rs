use crate::engine::{Engine, Progress};
use crate::hints::{Hint, HintedBlocks, hints_to_blocks, validate_hints};
use crate::io::{SourceIo, SourceRead};
use blocksnap_backends::SaveCompletion;
use blocksnap_core::{Block, BlockUid, Error, Result, Version, VersionStatistic, VersionUid};
use chrono::Utc;
use rand::seq::SliceRandom;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Smallest number of blocks the hint sanity check compares.
const SANITY_CHECK_MIN_BLOCKS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub name: String,
    pub snapshot_name: String,
    /// `file:` URL or path of the source.
    pub source: String,
    pub hints: Option<Vec<Hint>>,
    pub base_version: Option<VersionUid>,
    pub tags: Vec<String>,
    /// Defaults to the base version's block size, then the configured one.
    pub block_size: Option<u64>,
}

impl BackupRequest {
    pub fn new(name: impl Into<String>, snapshot_name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot_name: snapshot_name.into(),
            source: source.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct BackupCounters {
    reads_submitted: u64,
    reads_done: u64,
    saves_submitted: u64,
    saves_done: u64,
    bytes_read: u64,
    bytes_written: u64,
    bytes_dedup: u64,
    bytes_sparse: u64,
}

impl Engine {
    /// Backs up a source into a new version and returns it once valid.
    ///
    /// With a base version only blocks named by the hints (or all blocks,
    /// without hints) and blocks that are invalid in the base are read; the
    /// rest is carried over. A failed backup removes the new version again.
    #[instrument(skip(self, request), fields(name = %request.name, snapshot = %request.snapshot_name))]
    pub async fn backup(&mut self, request: BackupRequest) -> Result<Version> {
        let started = Instant::now();
        if request.name.is_empty() {
            return Err(Error::Usage("A backup needs a version name".to_string()));
        }

        let base = match request.base_version {
            Some(uid) => {
                let base = self.meta.get_version(uid)?;
                if !base.valid {
                    return Err(Error::Usage(format!("Base version {} is invalid", uid)));
                }
                Some(base)
            }
            None => None,
        };
        let block_size = match (&base, request.block_size) {
            (Some(base), Some(block_size)) if base.block_size != block_size => {
                return Err(Error::Usage(format!(
                    "Block size {} differs from the block size {} of base version {}",
                    block_size, base.block_size, base.uid
                )));
            }
            (Some(base), _) => base.block_size,
            (None, Some(block_size)) => block_size,
            (None, None) => self.config.block_size,
        };
        let _base_guard = match &base {
            Some(base) => Some(self.lock_version(base.uid, "backup base")?),
            None => None,
        };

        let mut source = SourceIo::open_r(&request.source, block_size, self.hash_function, &self.config.io)?;
        let size = source.size();
        let hinted = match &request.hints {
            Some(hints) => {
                validate_hints(hints, size)?;
                Some(hints_to_blocks(hints, block_size))
            }
            None => None,
        };

        let (version, _guard) = self.clone_version(&request.name, &request.snapshot_name, size, block_size, base.as_ref())?;
        info!(version = %version.uid, base = ?request.base_version, size, block_size, "Starting backup");

        let outcome = self
            .fill_version(&request, &mut source, &version, base.is_some(), hinted.as_ref(), started)
            .await;
        if let Err(close) = source.close().await {
            warn!("Failed to close source: {}", close);
        }
        match outcome {
            Ok(version) => Ok(version),
            Err(e) => {
                self.abandon_version(version.uid).await;
                Err(e)
            }
        }
    }

    /// Everything after the version exists: hint check, block transfer,
    /// commit, side-car and stats. Any error here abandons the version.
    async fn fill_version(
        &mut self,
        request: &BackupRequest,
        source: &mut SourceIo,
        version: &Version,
        has_base: bool,
        hinted: Option<&HintedBlocks>,
        started: Instant,
    ) -> Result<Version> {
        if let (true, Some(hinted)) = (has_base, hinted) {
            self.sanity_check(source, version, hinted).await?;
        }

        let mut counters = BackupCounters::default();
        self.transfer_blocks(source, version, hinted, &mut counters).await?;
        source.close().await?;

        self.meta.commit()?;
        self.meta.set_version(version.uid, Some(true), None)?;
        for tag in &request.tags {
            self.meta.add_tag(version.uid, tag)?;
        }

        let document = self.meta.export_document(&[version.uid])?;
        self.store.write_version_metadata(version.uid, &document, true).await?;

        let duration_seconds = started.elapsed().as_secs();
        self.meta.set_stats(&VersionStatistic {
            uid: version.uid,
            base_uid: request.base_version,
            hints_supplied: request.hints.is_some(),
            date: Utc::now(),
            name: version.name.clone(),
            snapshot_name: version.snapshot_name.clone(),
            size: version.size,
            block_size: version.block_size,
            bytes_read: counters.bytes_read,
            bytes_written: counters.bytes_written,
            bytes_dedup: counters.bytes_dedup,
            bytes_sparse: counters.bytes_sparse,
            duration_seconds,
        })?;

        info!(
            version = %version.uid,
            bytes_read = counters.bytes_read,
            bytes_written = counters.bytes_written,
            bytes_dedup = counters.bytes_dedup,
            bytes_sparse = counters.bytes_sparse,
            duration_seconds,
            "Backup finished"
        );
        self.meta.get_version(version.uid)
    }

    /// Removes the version of a failed backup. Blocks recorded so far are
    /// committed first so their blobs get tombstoned for cleanup; blobs whose
    /// writes were still in flight are left to a full cleanup.
    async fn abandon_version(&mut self, uid: VersionUid) {
        self.discard_store_jobs().await;
        if let Err(e) = self.meta.commit() {
            warn!(version = %uid, "Failed to record written blocks of failed backup: {}", e);
            if let Err(e) = self.meta.rollback() {
                warn!(version = %uid, "Rollback failed: {}", e);
            }
        }
        if let Err(e) = self.store.rm_version_metadata(uid).await {
            if !matches!(e, Error::NotFound { .. }) {
                warn!(version = %uid, "Failed to remove metadata copy of failed backup: {}", e);
            }
        }
        match self.meta.rm_version(uid) {
            Ok(blocks) => error!(version = %uid, blocks, "Backup failed, removed its version"),
            Err(e) => error!(version = %uid, "Backup failed and its version could not be removed: {}", e),
        }
    }

    /// Reads a sample of the blocks carried over from the base and compares
    /// them with the source. A mismatch means the hints cannot be trusted.
    async fn sanity_check(&mut self, source: &SourceIo, version: &Version, hinted: &HintedBlocks) -> Result<()> {
        let mut carried: Vec<Block> = self
            .meta
            .get_blocks_by_version(version.uid)?
            .into_iter()
            .filter(|b| b.valid && !hinted.read.contains(&b.id) && !hinted.sparse.contains(&b.id))
            .collect();
        let sample_size = (carried.len() / 1000).max(SANITY_CHECK_MIN_BLOCKS).min(carried.len());
        if sample_size == 0 {
            return Ok(());
        }

        let head = sample_size / 2;
        let mut sample: Vec<Block> = carried.drain(..head).collect();
        sample.extend(
            carried
                .choose_multiple(&mut rand::thread_rng(), sample_size - head)
                .cloned(),
        );

        for block in &sample {
            let expected = match &block.checksum {
                Some(checksum) => checksum.clone(),
                None => self.zero_checksum(block.size),
            };
            let (_, checksum) = source.read_sync(block).await?;
            if checksum != expected {
                return Err(Error::InputData(format!(
                    "Source and base version differ at block {} although the hints mark it unchanged",
                    block.id
                )));
            }
        }
        debug!(version = %version.uid, checked = sample.len(), "Hint sanity check passed");
        Ok(())
    }

    async fn transfer_blocks(
        &mut self,
        source: &mut SourceIo,
        version: &Version,
        hinted: Option<&HintedBlocks>,
        counters: &mut BackupCounters,
    ) -> Result<()> {
        let blocks = self.meta.get_blocks_by_version(version.uid)?;
        let mut progress = Progress::new("Backed up", version.uid, blocks.len() as u64);

        for block in blocks {
            let read = hinted.is_none_or(|h| h.read.contains(&block.id));
            let sparse = hinted.is_some_and(|h| h.sparse.contains(&block.id));
            if read || !block.valid {
                source.read(block).await?;
                counters.reads_submitted += 1;
            } else if sparse {
                self.meta
                    .set_block(block.id, version.uid, BlockUid::sparse(), None, block.size, true, true)?;
                counters.bytes_sparse += block.size;
                progress.step();
            } else {
                progress.step();
            }

            for read in source.read_completed() {
                self.on_source_read(read, counters, &mut progress).await?;
            }
            for completion in self.store.save_completed() {
                self.on_save_completed(completion, counters)?;
            }
        }

        while let Some(read) = source.next_read_completed().await {
            self.on_source_read(read, counters, &mut progress).await?;
            for completion in self.store.save_completed() {
                self.on_save_completed(completion, counters)?;
            }
        }
        while let Some(completion) = self.store.next_save_completed().await {
            self.on_save_completed(completion, counters)?;
        }

        if counters.reads_done != counters.reads_submitted
            || counters.saves_done != counters.saves_submitted
            || source.pending_reads() != 0
            || self.store.pending_saves() != 0
        {
            return Err(Error::Internal(format!(
                "Job accounting mismatch: {}/{} reads and {}/{} writes completed",
                counters.reads_done, counters.reads_submitted, counters.saves_done, counters.saves_submitted
            )));
        }
        Ok(())
    }

    async fn on_source_read(
        &mut self,
        read: SourceRead,
        counters: &mut BackupCounters,
        progress: &mut Progress,
    ) -> Result<()> {
        counters.reads_done += 1;
        let SourceRead { mut block, result } = read;
        let (data, checksum) = result?;
        counters.bytes_read += data.len() as u64;
        progress.step();

        if checksum == self.zero_checksum(block.size) {
            self.meta
                .set_block(block.id, block.version_uid, BlockUid::sparse(), None, block.size, true, true)?;
            counters.bytes_sparse += block.size;
            return Ok(());
        }

        let existing = self
            .meta
            .get_block_by_checksum(&checksum)?
            .filter(|existing| existing.size == block.size);
        if let Some(existing) = existing {
            self.meta
                .set_block(block.id, block.version_uid, existing.uid, Some(&checksum), block.size, true, true)?;
            counters.bytes_dedup += block.size;
            return Ok(());
        }

        block.checksum = Some(checksum);
        self.store.save(block, data).await?;
        counters.saves_submitted += 1;
        Ok(())
    }

    fn on_save_completed(&mut self, completion: SaveCompletion, counters: &mut BackupCounters) -> Result<()> {
        counters.saves_done += 1;
        let SaveCompletion { block, result } = completion;
        let uid = result?;
        self.meta.set_block(
            block.id,
            block.version_uid,
            uid,
            block.checksum.as_deref(),
            block.size,
            true,
            true,
        )?;
        counters.bytes_written += block.size;
        Ok(())
    }
}
