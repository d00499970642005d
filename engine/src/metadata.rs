//! Version metadata copies kept in the block store, for rebuilding the
//! metadata store after it is lost.

use crate::engine::Engine;
use blocksnap_core::metadata::GLOBAL_LOCK;
use blocksnap_core::{Result, VersionUid};
use tracing::{info, instrument};

impl Engine {
    /// Writes the metadata of each of `uids` to the block store.
    #[instrument(skip(self))]
    pub async fn metadata_backup(&mut self, uids: &[VersionUid], overwrite: bool) -> Result<()> {
        for &uid in uids {
            let _guard = self.lock_version(uid, "metadata backup")?;
            let document = self.meta.export_document(&[uid])?;
            self.store.write_version_metadata(uid, &document, overwrite).await?;
        }
        Ok(())
    }

    /// Imports the metadata copies of `uids` from the block store, under the
    /// global lock.
    #[instrument(skip(self))]
    pub async fn metadata_restore(&mut self, uids: &[VersionUid]) -> Result<Vec<VersionUid>> {
        let _guard = self.meta.locking().lock(GLOBAL_LOCK, "metadata restore")?;
        let mut restored = Vec::with_capacity(uids.len());
        for &uid in uids {
            let document = self.store.read_version_metadata(uid).await?;
            restored.extend(self.meta.import_document(&document)?);
            info!(version = %uid, "Restored version metadata");
        }
        Ok(restored)
    }

    /// Versions with a metadata copy in the block store.
    pub async fn metadata_ls(&self) -> Result<Vec<VersionUid>> {
        self.store.list_version_metadata().await
    }
}
