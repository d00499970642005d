use anyhow::{Context, Result};
use blocksnap_core::VersionUid;
use blocksnap_engine::{BackupRequest, parse_hints};
use clap::Args;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tracing::info;

use super::{format_bytes, spinner};

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Source URL (file:///path or a plain path)")]
    source: String,

    #[arg(help = "Version name, e.g. the name of the backed-up image")]
    name: String,

    #[arg(short, long, help = "Snapshot name", default_value = "")]
    snapshot: String,

    #[arg(short, long, help = "JSON file with change hints")]
    rbd_hints: Option<PathBuf>,

    #[arg(short, long, help = "Base version to deduplicate against")]
    base_version: Option<VersionUid>,

    #[arg(short, long, help = "Tags for the new version")]
    tag: Vec<String>,

    #[arg(long, help = "Block size in bytes, defaults to the configured one")]
    block_size: Option<u64>,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let hints = match &self.rbd_hints {
            Some(path) => {
                let file = File::open(path).with_context(|| format!("Failed to open hints file {}", path.display()))?;
                Some(parse_hints(BufReader::new(file))?)
            }
            None => None,
        };

        let mut request = BackupRequest::new(&self.name, &self.snapshot, &self.source);
        request.hints = hints;
        request.base_version = self.base_version;
        request.tags = self.tag.clone();
        request.block_size = self.block_size;

        let mut engine = cli.open_engine().await?;
        let pb = spinner(format!("Backing up {}", self.source))?;
        let outcome = engine.backup(request).await;
        pb.finish_and_clear();

        let outcome = match outcome {
            Ok(version) => engine.stats(Some(version.uid), None).map(|stats| (version, stats)),
            Err(e) => Err(e),
        };
        let closed = engine.close().await;
        let (version, stats) = outcome?;
        closed?;

        info!(version = %version.uid, name = %version.name, "Backup completed");
        println!("{}", version.uid);
        if let Some(stat) = stats.first() {
            println!(
                "  read {}, written {}, deduplicated {}, sparse {} in {}s",
                format_bytes(stat.bytes_read),
                format_bytes(stat.bytes_written),
                format_bytes(stat.bytes_dedup),
                format_bytes(stat.bytes_sparse),
                stat.duration_seconds
            );
        }
        Ok(())
    }
}
