use crate::engine::Engine;
use blocksnap_core::metadata::GLOBAL_LOCK;
use blocksnap_core::{Error, Result, VersionUid};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Tombstones younger than this are left alone by a fast cleanup, so that a
/// backup deduplicating against a just-removed block can still commit.
pub const DEFAULT_CLEANUP_MIN_AGE: Duration = Duration::from_secs(3600);

const CLEANUP_LOCK: &str = "cleanup";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: u64,
    pub failed: u64,
}

impl Engine {
    /// Removes version `uid` from the metadata store. Its blocks become
    /// tombstones and are deleted by a later cleanup.
    #[instrument(skip(self), fields(version = %uid))]
    pub async fn rm(&mut self, uid: VersionUid, force: bool, keep_metadata_backup: bool) -> Result<()> {
        let _guard = self.lock_version(uid, "rm")?;
        let version = self.meta.get_version(uid)?;
        if version.protected {
            return Err(Error::Usage(format!("Version {} is protected", uid)));
        }
        if !force {
            let days = self.config.disallow_remove_when_younger_than_days;
            let limit = Utc::now() - ChronoDuration::days(days as i64);
            if version.date > limit {
                return Err(Error::Usage(format!(
                    "Version {} is younger than {} days, use force to remove it",
                    uid, days
                )));
            }
        }

        let blocks = self.meta.rm_version(uid)?;
        if !keep_metadata_backup {
            match self.store.rm_version_metadata(uid).await {
                Ok(()) | Err(Error::NotFound { .. }) => {}
                Err(e) => warn!(version = %uid, "Failed to remove version metadata backup: {}", e),
            }
        }
        info!(version = %uid, blocks, "Removed version");
        Ok(())
    }

    /// Deletes blobs whose tombstones are older than `min_age` and which no
    /// live block references any more.
    #[instrument(skip(self))]
    pub async fn cleanup(&mut self, min_age: Duration) -> Result<CleanupReport> {
        let locking = self.meta.locking();
        let _guard = locking.lock(CLEANUP_LOCK, "cleanup")?;
        locking.ensure_unlocked(GLOBAL_LOCK)?;

        let mut report = CleanupReport::default();
        let Engine { meta, store, .. } = self;
        for batch in meta.get_delete_candidates(min_age) {
            let batch = batch?;
            let failed = store.rm_many(&batch).await;
            report.removed += (batch.len() - failed.len()) as u64;
            report.failed += failed.len() as u64;
            for uid in failed {
                error!(block_uid = %uid, "Failed to delete block, a full cleanup will retry");
            }
        }
        info!(removed = report.removed, failed = report.failed, "Cleanup finished");
        Ok(report)
    }

    /// Deletes every blob in the block store that no block references.
    /// Runs under the global lock and refuses while any other lock is held.
    #[instrument(skip(self))]
    pub async fn cleanup_full(&mut self) -> Result<CleanupReport> {
        let locking = self.meta.locking();
        let _guard = locking.lock(GLOBAL_LOCK, "full cleanup")?;
        let others: Vec<String> = locking.held()?.into_iter().filter(|name| name != GLOBAL_LOCK).collect();
        if !others.is_empty() {
            return Err(Error::AlreadyLocked {
                name: others.join(", "),
                holder: "operations in progress".to_string(),
            });
        }

        let referenced = self.meta.get_all_block_uids()?;
        let stored: HashSet<_> = self.store.list_blocks().await?.into_iter().collect();
        let orphans: Vec<_> = stored.difference(&referenced).copied().collect();
        info!(stored = stored.len(), referenced = referenced.len(), orphans = orphans.len(), "Removing unreferenced blocks");

        let failed = self.store.rm_many(&orphans).await;
        let report = CleanupReport {
            removed: (orphans.len() - failed.len()) as u64,
            failed: failed.len() as u64,
        };
        info!(removed = report.removed, failed = report.failed, "Full cleanup finished");
        Ok(report)
    }
}
