use crate::engine::{Engine, Progress};
use crate::io::SourceIo;
use blocksnap_backends::ReadCompletion;
use blocksnap_core::{Error, Result, VersionUid};
use bytes::Bytes;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Leave sparse blocks unwritten instead of writing zeros.
    pub sparse: bool,
    /// Restore onto an existing target.
    pub force: bool,
}

impl Engine {
    /// Restores version `uid` to `target`.
    ///
    /// Blocks that fail verification are marked invalid and restoring goes
    /// on; the aggregate failure is reported at the end as `Corrupt`.
    #[instrument(skip(self, options), fields(version = %uid))]
    pub async fn restore(&mut self, uid: VersionUid, target: &str, options: RestoreOptions) -> Result<()> {
        let _guard = self.lock_version(uid, "restore")?;
        let version = self.meta.get_version(uid)?;
        if !version.valid {
            warn!(version = %uid, "Restoring an invalid version, the result may be incomplete");
        }

        let mut target = SourceIo::open_w(
            target,
            version.size,
            options.force,
            version.block_size,
            self.hash_function,
            &self.config.io,
        )?;
        info!(version = %uid, target = %target.path().display(), size = version.size, "Starting restore");

        let outcome = self.restore_blocks(&mut target, uid, version.block_size, options).await;
        let closed = target.close().await;
        let failures = match outcome {
            Ok(failures) => failures,
            Err(e) => {
                self.discard_store_jobs().await;
                return Err(e);
            }
        };
        closed?;

        if failures > 0 {
            error!(version = %uid, failures, "Restore finished with errors");
            return Err(Error::Corrupt(format!("{} blocks of version {} failed to restore", failures, uid)));
        }
        info!(version = %uid, "Restore finished");
        Ok(())
    }

    async fn restore_blocks(
        &mut self,
        target: &mut SourceIo,
        uid: VersionUid,
        block_size: u64,
        options: RestoreOptions,
    ) -> Result<u64> {
        let blocks = self.meta.get_blocks_by_version(uid)?;
        let zeros = Bytes::from(vec![0u8; block_size as usize]);
        let mut progress = Progress::new("Restored", uid, blocks.len() as u64);
        let (mut submitted, mut done, mut failures) = (0u64, 0u64, 0u64);

        for block in blocks {
            if block.is_sparse() {
                if !options.sparse {
                    target.write(&block, zeros.slice(..block.size as usize)).await?;
                }
                progress.step();
            } else {
                self.store.read(block, false).await?;
                submitted += 1;
            }
            for completion in self.store.read_completed() {
                done += 1;
                failures += self.restore_block(target, completion, &mut progress).await?;
            }
        }
        while let Some(completion) = self.store.next_read_completed().await {
            done += 1;
            failures += self.restore_block(target, completion, &mut progress).await?;
        }

        if done != submitted {
            return Err(Error::Internal(format!(
                "Job accounting mismatch: {}/{} reads completed",
                done, submitted
            )));
        }
        Ok(failures)
    }

    /// Writes one completed read to the target. Returns 1 if the block
    /// failed verification.
    async fn restore_block(&mut self, target: &SourceIo, completion: ReadCompletion, progress: &mut Progress) -> Result<u64> {
        let ReadCompletion { block, result } = completion;
        progress.step();
        let data = match result {
            Ok(block_data) => block_data.data,
            Err(e) if e.is_data_integrity() => {
                error!(block = block.id, block_uid = %block.uid, "Block is unreadable: {}", e);
                self.invalidate(block.uid)?;
                return Ok(1);
            }
            Err(e) => return Err(e),
        };

        if data.len() as u64 != block.size {
            error!(block = block.id, block_uid = %block.uid, size = data.len(), "Stored block has the wrong size");
            self.invalidate(block.uid)?;
            return Ok(1);
        }
        target.write(&block, data.clone()).await?;
        let checksum = self.hash_function.checksum(&data);
        if block.checksum.as_deref() != Some(checksum.as_str()) {
            error!(block = block.id, block_uid = %block.uid, "Restored data does not match its checksum");
            self.invalidate(block.uid)?;
            return Ok(1);
        }
        Ok(0)
    }
}
