use anyhow::Result;
use blocksnap_engine::Engine;
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let config = cli.load_config().await?;
        let metadata_path = config.metadata_path.clone();
        let engine = Engine::open(config, true).await?;
        engine.close().await?;
        info!(metadata = %metadata_path.display(), "Initialised metadata database and storage");
        Ok(())
    }
}
