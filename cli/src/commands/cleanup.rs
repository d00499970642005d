use anyhow::Result;
use blocksnap_engine::DEFAULT_CLEANUP_MIN_AGE;
use clap::Args;
use std::time::Duration;
use tracing::{info, warn};

use super::spinner;

#[derive(Args)]
pub struct CleanupCommand {
    #[arg(long, help = "Compare the whole block store against the metadata instead of using removal records")]
    full: bool,

    #[arg(long, help = "Only delete blocks unreferenced for at least this many seconds")]
    min_age: Option<u64>,
}

impl CleanupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let min_age = self.min_age.map(Duration::from_secs).unwrap_or(DEFAULT_CLEANUP_MIN_AGE);

        let mut engine = cli.open_engine().await?;
        let pb = spinner(if self.full { "Running full cleanup" } else { "Running cleanup" })?;
        let outcome = if self.full {
            engine.cleanup_full().await
        } else {
            engine.cleanup(min_age).await
        };
        pb.finish_and_clear();
        engine.close().await?;
        let report = outcome?;

        info!(removed = report.removed, "Cleanup completed");
        if report.failed > 0 {
            warn!(failed = report.failed, "Some blocks could not be removed");
        }
        println!("Removed {} blocks", report.removed);
        Ok(())
    }
}
