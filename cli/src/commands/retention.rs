use anyhow::Result;
use blocksnap_core::VersionFilter;
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct EnforceCommand {
    #[arg(help = "Retention rules, e.g. latest3,days7,weeks4,months6")]
    rules: String,

    #[arg(short, long, help = "Only versions with this name")]
    name: Option<String>,

    #[arg(short, long, help = "Only versions carrying this tag")]
    tag: Option<String>,

    #[arg(long, help = "Show what would be removed without removing it")]
    dry_run: bool,

    #[arg(short, long, help = "Keep the version metadata copies in the block store")]
    keep_metadata_backup: bool,
}

impl EnforceCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let filter = VersionFilter {
            name: self.name.clone(),
            tag: self.tag.clone(),
            ..Default::default()
        };

        let mut engine = cli.open_engine().await?;
        let outcome = engine
            .enforce_retention_policy(&self.rules, &filter, self.dry_run, self.keep_metadata_backup)
            .await;
        engine.close().await?;
        let dismissed = outcome?;

        info!(count = dismissed.len(), dry_run = self.dry_run, "Retention policy applied");
        for version in dismissed {
            println!("{} {} {}", version.uid, version.date.format("%Y-%m-%d %H:%M:%S"), version.name);
        }
        Ok(())
    }
}
