use crate::engine::Engine;
use blocksnap_core::retention::RetentionFilter;
use blocksnap_core::{Error, Result, Version, VersionFilter};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

impl Engine {
    /// Applies retention `rules` to the versions matching `filter`, one
    /// version name at a time, and removes the dismissed ones. Protected
    /// versions are never dismissed. Returns the dismissed versions.
    #[instrument(skip(self, filter))]
    pub async fn enforce_retention_policy(
        &mut self,
        rules: &str,
        filter: &VersionFilter,
        dry_run: bool,
        keep_metadata_backup: bool,
    ) -> Result<Vec<Version>> {
        let retention = RetentionFilter::new(rules)?;

        let mut by_name: BTreeMap<String, Vec<Version>> = BTreeMap::new();
        for version in self.meta.get_versions(filter)? {
            if version.protected {
                continue;
            }
            by_name.entry(version.name.clone()).or_default().push(version);
        }

        let mut dismissed = Vec::new();
        for (name, versions) in by_name {
            let outcome = retention.filter(&versions);
            info!(name = %name, keep = outcome.keep.len(), dismiss = outcome.dismiss.len(), "Applied retention policy");
            dismissed.extend(outcome.dismiss);
        }
        dismissed.sort_by_key(|v| v.uid);

        if dry_run {
            for version in &dismissed {
                info!(version = %version.uid, name = %version.name, date = %version.date, "Would remove version");
            }
            return Ok(dismissed);
        }

        for version in &dismissed {
            match self.rm(version.uid, true, keep_metadata_backup).await {
                Ok(()) => {}
                Err(Error::AlreadyLocked { name, .. }) => {
                    warn!(version = %version.uid, lock = %name, "Version is in use, leaving it for the next run");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dismissed)
    }
}
