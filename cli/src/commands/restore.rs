use anyhow::Result;
use blocksnap_core::VersionUid;
use blocksnap_engine::RestoreOptions;
use clap::Args;
use tracing::info;

use super::spinner;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Version to restore")]
    version: VersionUid,

    #[arg(help = "Target URL (file:///path or a plain path)")]
    target: String,

    #[arg(short, long, help = "Do not write sparse blocks, leaving holes in the target")]
    sparse: bool,

    #[arg(short, long, help = "Overwrite an existing target")]
    force: bool,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let options = RestoreOptions {
            sparse: self.sparse,
            force: self.force,
        };

        let mut engine = cli.open_engine().await?;
        let pb = spinner(format!("Restoring {} to {}", self.version, self.target))?;
        let outcome = engine.restore(self.version, &self.target, options).await;
        pb.finish_and_clear();
        let closed = engine.close().await;
        outcome?;
        closed?;

        info!(version = %self.version, target = %self.target, "Restore completed");
        Ok(())
    }
}
