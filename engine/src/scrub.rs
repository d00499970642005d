use crate::engine::{Engine, Progress};
use crate::io::SourceIo;
use blocksnap_backends::ReadCompletion;
use blocksnap_core::{Block, BlockUid, Error, ErrorKind, Result, Version, VersionUid};
use rand::seq::SliceRandom;
use tracing::{error, info, instrument, warn};

/// Picks `percentage` percent of `blocks` at random, keeping id order.
fn sample_blocks(mut blocks: Vec<Block>, percentage: u8) -> Vec<Block> {
    if percentage >= 100 {
        return blocks;
    }
    let count = (blocks.len() * percentage as usize).div_ceil(100);
    blocks.shuffle(&mut rand::thread_rng());
    blocks.truncate(count);
    blocks.sort_by_key(|b| b.id);
    blocks
}

fn check_percentage(percentage: u8) -> Result<()> {
    if !(1..=100).contains(&percentage) {
        return Err(Error::Usage(format!("Scrub percentage must be within 1..=100, got {}", percentage)));
    }
    Ok(())
}

/// Outcome of one deep-scrubbed block.
#[derive(Debug, Default)]
struct DeepScrubTally {
    failures: u64,
    source_mismatches: u64,
}

impl Engine {
    /// Reads the sampled blocks of version `uid` from the block store and
    /// checks their size and checksum against the metadata. Never marks
    /// anything valid.
    #[instrument(skip(self), fields(version = %uid))]
    pub async fn scrub(&mut self, uid: VersionUid, percentage: u8) -> Result<()> {
        check_percentage(percentage)?;
        let _guard = self.lock_version(uid, "scrub")?;
        let version = self.meta.get_version(uid)?;
        let blocks = self.scrub_sample(&version, percentage)?;
        info!(version = %uid, blocks = blocks.len(), percentage, "Starting scrub");

        let failures = match self.scrub_blocks(&version, blocks).await {
            Ok(failures) => failures,
            Err(e) => {
                self.discard_store_jobs().await;
                return Err(e);
            }
        };

        if failures > 0 {
            error!(version = %uid, failures, "Scrub found problems");
            return Err(Error::Corrupt(format!("Scrub of {} found {} bad blocks", uid, failures)));
        }
        if !version.valid {
            warn!(version = %uid, "Scrub found no problems but the version stays invalid, use a deep scrub to revalidate it");
        }
        info!(version = %uid, "Scrub finished");
        Ok(())
    }

    /// Reads the sampled blocks of version `uid` and recomputes their
    /// checksums. With `source` every sampled block is also compared with
    /// the source; differences there are reported but do not invalidate the
    /// backup.
    ///
    /// A clean pass over all blocks with no source differences marks the
    /// version and its blocks valid again.
    #[instrument(skip(self), fields(version = %uid))]
    pub async fn deep_scrub(&mut self, uid: VersionUid, source: Option<&str>, percentage: u8) -> Result<()> {
        check_percentage(percentage)?;
        let _guard = self.lock_version(uid, "deep scrub")?;
        let version = self.meta.get_version(uid)?;

        let mut source = match source {
            Some(url) => {
                let io = SourceIo::open_r(url, version.block_size, self.hash_function, &self.config.io)?;
                if io.size() != version.size {
                    return Err(Error::Usage(format!(
                        "Source {} has {} bytes but version {} has {}",
                        url,
                        io.size(),
                        uid,
                        version.size
                    )));
                }
                Some(io)
            }
            None => None,
        };

        let blocks = if source.is_some() {
            sample_blocks(self.meta.get_blocks_by_version(uid)?, percentage)
        } else {
            self.scrub_sample(&version, percentage)?
        };
        info!(version = %uid, blocks = blocks.len(), percentage, with_source = source.is_some(), "Starting deep scrub");

        let outcome = self.deep_scrub_blocks(&version, blocks, source.as_ref()).await;
        if let Some(source) = source.as_mut() {
            if let Err(e) = source.close().await {
                warn!("Failed to close source: {}", e);
            }
        }
        let tally = match outcome {
            Ok(tally) => tally,
            Err(e) => {
                self.discard_store_jobs().await;
                return Err(e);
            }
        };

        if tally.failures > 0 {
            error!(version = %uid, failures = tally.failures, "Deep scrub found problems");
            return Err(Error::Corrupt(format!("Deep scrub of {} found {} bad blocks", uid, tally.failures)));
        }
        if tally.source_mismatches > 0 {
            warn!(
                version = %uid,
                mismatches = tally.source_mismatches,
                "Backup is consistent but differs from the source"
            );
        } else if percentage == 100 {
            self.revalidate(&version, source.is_some())?;
        }
        info!(version = %uid, "Deep scrub finished");
        Ok(())
    }

    /// Non-sparse blocks of `version`, sampled.
    fn scrub_sample(&self, version: &Version, percentage: u8) -> Result<Vec<Block>> {
        let blocks = self
            .meta
            .get_blocks_by_version(version.uid)?
            .into_iter()
            .filter(|b| !b.is_sparse())
            .collect();
        Ok(sample_blocks(blocks, percentage))
    }

    async fn scrub_blocks(&mut self, version: &Version, blocks: Vec<Block>) -> Result<u64> {
        let mut progress = Progress::new("Scrubbed", version.uid, blocks.len() as u64);
        let (mut submitted, mut done, mut failures) = (0u64, 0u64, 0u64);

        for block in blocks {
            self.store.read(block, false).await?;
            submitted += 1;
            for completion in self.store.read_completed() {
                done += 1;
                progress.step();
                failures += self.check_scrub_read(completion)?.is_some() as u64;
            }
        }
        while let Some(completion) = self.store.next_read_completed().await {
            done += 1;
            progress.step();
            failures += self.check_scrub_read(completion)?.is_some() as u64;
        }

        if done != submitted {
            return Err(Error::Internal(format!("Job accounting mismatch: {}/{} reads completed", done, submitted)));
        }
        Ok(failures)
    }

    /// Invalidates the block of a failed read or of content that does not
    /// hash to its checksum, and returns its uid.
    fn check_scrub_read(&mut self, completion: ReadCompletion) -> Result<Option<BlockUid>> {
        let ReadCompletion { block, result } = completion;
        let data = match result {
            Ok(block_data) => block_data.data,
            Err(e) if matches!(e.kind(), ErrorKind::Internal | ErrorKind::Configuration) => return Err(e),
            Err(e) => {
                error!(block = block.id, block_uid = %block.uid, "Block failed scrub: {}", e);
                self.invalidate(block.uid)?;
                return Ok(Some(block.uid));
            }
        };
        if block.checksum.as_deref() != Some(self.hash_function.checksum(&data).as_str()) {
            error!(block = block.id, block_uid = %block.uid, "Block content does not match its checksum");
            self.invalidate(block.uid)?;
            return Ok(Some(block.uid));
        }
        Ok(None)
    }

    async fn deep_scrub_blocks(
        &mut self,
        version: &Version,
        blocks: Vec<Block>,
        source: Option<&SourceIo>,
    ) -> Result<DeepScrubTally> {
        let mut progress = Progress::new("Deep scrubbed", version.uid, blocks.len() as u64);
        let mut tally = DeepScrubTally::default();
        let (mut submitted, mut done) = (0u64, 0u64);

        for block in blocks {
            if block.is_sparse() {
                // Only reached with a source; sparse blocks must read as zeros there.
                if let Some(source) = source {
                    let (_, checksum) = source.read_sync(&block).await?;
                    if checksum != self.zero_checksum(block.size) {
                        warn!(block = block.id, "Source has data where the backup has a sparse block");
                        tally.source_mismatches += 1;
                    }
                }
                progress.step();
                continue;
            }
            self.store.read(block, false).await?;
            submitted += 1;
            for completion in self.store.read_completed() {
                done += 1;
                progress.step();
                self.check_deep_scrub_read(completion, source, &mut tally).await?;
            }
        }
        while let Some(completion) = self.store.next_read_completed().await {
            done += 1;
            progress.step();
            self.check_deep_scrub_read(completion, source, &mut tally).await?;
        }

        if done != submitted {
            return Err(Error::Internal(format!("Job accounting mismatch: {}/{} reads completed", done, submitted)));
        }
        Ok(tally)
    }

    async fn check_deep_scrub_read(
        &mut self,
        completion: ReadCompletion,
        source: Option<&SourceIo>,
        tally: &mut DeepScrubTally,
    ) -> Result<()> {
        let ReadCompletion { block, result } = completion;
        let data = match result {
            Ok(block_data) => block_data.data,
            Err(e) if matches!(e.kind(), ErrorKind::Internal | ErrorKind::Configuration) => return Err(e),
            Err(e) => {
                error!(block = block.id, block_uid = %block.uid, "Block failed deep scrub: {}", e);
                self.invalidate(block.uid)?;
                tally.failures += 1;
                return Ok(());
            }
        };

        let checksum = self.hash_function.checksum(&data);
        if block.checksum.as_deref() != Some(checksum.as_str()) {
            error!(block = block.id, block_uid = %block.uid, "Block content does not match its checksum");
            self.invalidate(block.uid)?;
            tally.failures += 1;
            return Ok(());
        }

        if let Some(source) = source {
            let (_, source_checksum) = source.read_sync(&block).await?;
            if source_checksum != checksum {
                warn!(block = block.id, block_uid = %block.uid, "Block differs from the source");
                tally.source_mismatches += 1;
            }
        }
        Ok(())
    }

    /// Marks `version` and all of its blocks valid. Invalid sparse blocks are
    /// placeholders nobody read, so without `sparse_checked` they keep the
    /// version invalid.
    fn revalidate(&mut self, version: &Version, sparse_checked: bool) -> Result<()> {
        let invalid: Vec<Block> = self
            .meta
            .get_blocks_by_version(version.uid)?
            .into_iter()
            .filter(|b| !b.valid)
            .collect();
        if !sparse_checked && invalid.iter().any(Block::is_sparse) {
            warn!(
                version = %version.uid,
                "Version has invalid sparse blocks, deep scrub it against its source to revalidate"
            );
            return Ok(());
        }
        for block in &invalid {
            self.meta.set_block(
                block.id,
                version.uid,
                block.uid,
                block.checksum.as_deref(),
                block.size,
                true,
                true,
            )?;
        }
        self.meta.commit()?;
        if !version.valid || !invalid.is_empty() {
            self.meta.set_version(version.uid, Some(true), None)?;
            info!(version = %version.uid, blocks = invalid.len(), "Marked version valid");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn blocks(n: u64) -> Vec<Block> {
        (0..n)
            .map(|id| Block {
                id,
                version_uid: VersionUid::new(1),
                uid: BlockUid::new(id + 1, 1),
                checksum: Some(format!("{:064x}", id)),
                size: 4096,
                valid: true,
                date: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn test_sample_size_and_order() {
        let sampled = sample_blocks(blocks(200), 10);
        assert_eq!(sampled.len(), 20);
        assert!(sampled.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(sample_blocks(blocks(3), 1).len(), 1);
        assert_eq!(sample_blocks(blocks(7), 100).len(), 7);
    }

    #[test]
    fn test_percentage_bounds() {
        assert!(check_percentage(0).is_err());
        assert!(check_percentage(101).is_err());
        assert!(check_percentage(1).is_ok());
        assert!(check_percentage(100).is_ok());
    }
}
