use anyhow::Result;
use blocksnap_core::VersionUid;
use clap::Args;
use tracing::info;

use super::spinner;

#[derive(Args)]
pub struct ScrubCommand {
    #[arg(help = "Version to scrub")]
    version: VersionUid,

    #[arg(
        short = 'p',
        long,
        default_value_t = 100,
        value_parser = clap::value_parser!(u8).range(1..=100),
        help = "Percentage of blocks to check"
    )]
    block_percentage: u8,
}

impl ScrubCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut engine = cli.open_engine().await?;
        let pb = spinner(format!("Scrubbing {}", self.version))?;
        let outcome = engine.scrub(self.version, self.block_percentage).await;
        pb.finish_and_clear();
        engine.close().await?;
        outcome?;
        info!(version = %self.version, "Scrub found no problems");
        Ok(())
    }
}

#[derive(Args)]
pub struct DeepScrubCommand {
    #[arg(help = "Version to scrub")]
    version: VersionUid,

    #[arg(short, long, help = "Compare against this source as well")]
    source: Option<String>,

    #[arg(
        short = 'p',
        long,
        default_value_t = 100,
        value_parser = clap::value_parser!(u8).range(1..=100),
        help = "Percentage of blocks to check"
    )]
    block_percentage: u8,
}

impl DeepScrubCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut engine = cli.open_engine().await?;
        let pb = spinner(format!("Deep-scrubbing {}", self.version))?;
        let outcome = engine
            .deep_scrub(self.version, self.source.as_deref(), self.block_percentage)
            .await;
        pb.finish_and_clear();
        engine.close().await?;
        outcome?;
        info!(version = %self.version, "Deep scrub found no problems");
        Ok(())
    }
}
