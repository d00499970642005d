use blocksnap_backends::{BlockStore, block_store_from_config};
use blocksnap_core::metadata::{GLOBAL_LOCK, LockGuard};
use blocksnap_core::{
    BlockUid, Config, Error, HashFunction, MetadataStore, Result, Version, VersionFilter, VersionStatistic, VersionUid,
    block_size_at, blocks_count,
};
use std::collections::HashMap;
use std::io::{Read, Write};
use tracing::{debug, info, warn};

/// Orchestrates backups, restores, scrubs and garbage collection on top of
/// a metadata store and a block store.
///
/// All metadata mutation happens on the caller's task; only block bytes
/// flow through the worker pools of the block store and the source.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) meta: MetadataStore,
    pub(crate) store: BlockStore,
    pub(crate) hash_function: HashFunction,
    zero_checksums: HashMap<u64, String>,
}

impl Engine {
    /// Opens the stores named by `config`. With `create` the metadata
    /// database is initialised if missing.
    pub async fn open(config: Config, create: bool) -> Result<Self> {
        config.validate()?;
        if create {
            if let Some(parent) = config.metadata_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let meta = MetadataStore::open(&config.metadata_path, create)?;
        let store = block_store_from_config(&config).await?;
        Self::with_parts(config, meta, store)
    }

    pub fn with_parts(config: Config, meta: MetadataStore, store: BlockStore) -> Result<Self> {
        let hash_function = HashFunction::from_name(&config.hash_function)?;
        if hash_function != store.hash_function() {
            return Err(Error::Configuration(format!(
                "Block store hashes with {} but the configuration names {}",
                store.hash_function().name(),
                hash_function.name()
            )));
        }
        Ok(Self {
            config,
            meta,
            store,
            hash_function,
            zero_checksums: HashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.meta
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.store
    }

    /// Shuts down the block store workers and releases any leftover locks.
    pub async fn close(mut self) -> Result<()> {
        let closed = self.store.close().await;
        self.meta.close()?;
        closed
    }

    /// Takes the lock of version `uid`. Fails while the global lock is held.
    pub(crate) fn lock_version(&self, uid: VersionUid, reason: &str) -> Result<LockGuard> {
        let locking = self.meta.locking();
        let guard = locking.lock(&uid.lock_name(), reason)?;
        locking.ensure_unlocked(GLOBAL_LOCK)?;
        Ok(guard)
    }

    pub(crate) fn zero_checksum(&mut self, size: u64) -> String {
        let hash_function = self.hash_function;
        self.zero_checksums
            .entry(size)
            .or_insert_with(|| hash_function.zero_checksum(size as usize))
            .clone()
    }

    /// Waits for every outstanding block store job and drops the results.
    /// Used when an operation bails out with jobs in flight.
    pub(crate) async fn discard_store_jobs(&mut self) {
        while let Some(completion) = self.store.next_save_completed().await {
            if let Err(e) = completion.result {
                debug!(block = completion.block.id, "Discarded failed write: {}", e);
            }
        }
        while let Some(completion) = self.store.next_read_completed().await {
            if let Err(e) = completion.result {
                debug!(block = completion.block.id, "Discarded failed read: {}", e);
            }
        }
    }

    /// Marks every block stored as `uid` invalid, along with the versions
    /// using it.
    pub(crate) fn invalidate(&mut self, uid: BlockUid) -> Result<()> {
        let versions = self.meta.set_blocks_invalid(uid)?;
        for version in versions {
            warn!(version = %version, block_uid = %uid, "Marked version invalid");
        }
        Ok(())
    }

    /// Creates a new version of `size` bytes whose blocks start out as a copy
    /// of `base`. The version is returned locked and invalid.
    ///
    /// A base block whose size differs from the new block at the same index
    /// is carried over as sparse and invalid so that it is read again. Blocks
    /// the base does not have start as sparse.
    pub(crate) fn clone_version(
        &mut self,
        name: &str,
        snapshot_name: &str,
        size: u64,
        block_size: u64,
        base: Option<&Version>,
    ) -> Result<(Version, LockGuard)> {
        let version = self.meta.create_version(name, snapshot_name, size, block_size, false, true)?;
        let guard = match self.lock_version(version.uid, "backup") {
            Ok(guard) => guard,
            Err(e) => {
                self.unprotect_after_failure(version.uid);
                return Err(e);
            }
        };

        if let Err(e) = self.copy_base_blocks(&version, base) {
            if let Err(rollback) = self.meta.rollback() {
                warn!(version = %version.uid, "Rollback failed: {}", rollback);
            }
            self.unprotect_after_failure(version.uid);
            return Err(e);
        }

        self.meta.set_version(version.uid, None, Some(false))?;
        let version = self.meta.get_version(version.uid)?;
        debug!(version = %version.uid, base = ?base.map(|b| b.uid), blocks = version.blocks_count(), "Prepared version");
        Ok((version, guard))
    }

    fn copy_base_blocks(&mut self, version: &Version, base: Option<&Version>) -> Result<()> {
        let mut base_blocks: HashMap<u64, _> = match base {
            Some(base) => self
                .meta
                .get_blocks_by_version(base.uid)?
                .into_iter()
                .map(|block| (block.id, block))
                .collect(),
            None => HashMap::new(),
        };

        for id in 0..blocks_count(version.size, version.block_size) {
            let size = block_size_at(version.size, version.block_size, id);
            match base_blocks.remove(&id) {
                Some(block) if block.size == size => self.meta.set_block(
                    id,
                    version.uid,
                    block.uid,
                    block.checksum.as_deref(),
                    size,
                    block.valid,
                    false,
                )?,
                Some(_) => self.meta.set_block(id, version.uid, BlockUid::sparse(), None, size, false, false)?,
                None => self.meta.set_block(id, version.uid, BlockUid::sparse(), None, size, true, false)?,
            }
        }
        self.meta.commit()
    }

    fn unprotect_after_failure(&mut self, uid: VersionUid) {
        if let Err(e) = self.meta.set_version(uid, None, Some(false)) {
            warn!(version = %uid, "Failed to unprotect version: {}", e);
        }
    }

    pub fn ls(&self, filter: &VersionFilter) -> Result<Vec<Version>> {
        self.meta.get_versions(filter)
    }

    pub fn stats(&self, uid: Option<VersionUid>, limit: Option<usize>) -> Result<Vec<VersionStatistic>> {
        self.meta.get_stats(uid, limit)
    }

    pub fn protect(&mut self, uid: VersionUid) -> Result<()> {
        self.set_protected(uid, true)
    }

    pub fn unprotect(&mut self, uid: VersionUid) -> Result<()> {
        self.set_protected(uid, false)
    }

    fn set_protected(&mut self, uid: VersionUid, protected: bool) -> Result<()> {
        let _guard = self.lock_version(uid, if protected { "protect" } else { "unprotect" })?;
        let version = self.meta.get_version(uid)?;
        if version.protected == protected {
            warn!(version = %uid, protected, "Version protection is unchanged");
            return Ok(());
        }
        self.meta.set_version(uid, None, Some(protected))?;
        info!(version = %uid, protected, "Changed version protection");
        Ok(())
    }

    pub fn add_tag(&mut self, uid: VersionUid, tag: &str) -> Result<()> {
        let _guard = self.lock_version(uid, "add tag")?;
        self.meta.add_tag(uid, tag)
    }

    pub fn rm_tag(&mut self, uid: VersionUid, tag: &str) -> Result<()> {
        let _guard = self.lock_version(uid, "remove tag")?;
        self.meta.rm_tag(uid, tag)
    }

    /// Writes the metadata of `uids` as a JSON document.
    pub fn export<W: Write>(&mut self, uids: &[VersionUid], writer: W) -> Result<()> {
        self.meta.export(uids, writer)
    }

    pub fn import<R: Read>(&mut self, reader: R) -> Result<Vec<VersionUid>> {
        let _guard = self.meta.locking().lock(GLOBAL_LOCK, "import")?;
        let imported = self.meta.import(reader)?;
        info!(count = imported.len(), "Imported versions");
        Ok(imported)
    }
}

/// Logs how far a long operation has come, every tenth of the way.
pub(crate) struct Progress {
    operation: &'static str,
    version: VersionUid,
    total: u64,
    done: u64,
    next_report: u64,
}

impl Progress {
    pub(crate) fn new(operation: &'static str, version: VersionUid, total: u64) -> Self {
        Self {
            operation,
            version,
            total,
            done: 0,
            next_report: total.div_ceil(10).max(1),
        }
    }

    pub(crate) fn step(&mut self) {
        self.done += 1;
        if self.done >= self.next_report || self.done == self.total {
            info!(
                version = %self.version,
                "{} {}/{} blocks ({}%)",
                self.operation,
                self.done,
                self.total,
                self.done * 100 / self.total.max(1)
            );
            self.next_report = self.done + self.total.div_ceil(10).max(1);
        }
    }
}
