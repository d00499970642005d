use anyhow::{Result, anyhow};
use blocksnap_core::{Version, VersionFilter, VersionStatistic, VersionUid};
use clap::{Args, ValueEnum};
use serde_json::json;
use tracing::info;

use super::format_bytes;

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Args)]
pub struct LsCommand {
    #[arg(short, long, help = "Only versions with this name")]
    name: Option<String>,

    #[arg(short, long, help = "Only versions of this snapshot")]
    snapshot: Option<String>,

    #[arg(short, long, help = "Only versions carrying this tag")]
    tag: Option<String>,

    #[arg(long, help = "Only valid (true) or invalid (false) versions")]
    valid: Option<bool>,

    #[arg(long, help = "Only protected (true) or unprotected (false) versions")]
    protected: Option<bool>,

    #[arg(long, value_enum, default_value_t, help = "Output format")]
    format: OutputFormat,
}

impl LsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let filter = VersionFilter {
            uid: None,
            name: self.name.clone(),
            snapshot_name: self.snapshot.clone(),
            tag: self.tag.clone(),
            valid: self.valid,
            protected: self.protected,
        };

        let engine = cli.open_engine().await?;
        let versions = engine.ls(&filter);
        engine.close().await?;
        let versions = versions?;

        match self.format {
            OutputFormat::Json => {
                let list: Vec<_> = versions.iter().map(version_json).collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            }
            OutputFormat::Table => {
                if versions.is_empty() {
                    println!("No versions found");
                    return Ok(());
                }
                println!(
                    "{:<12} {:<20} {:<20} {:<16} {:>10} {:>10} {:<6} {:<9} {}",
                    "UID", "Date", "Name", "Snapshot", "Size", "Block", "Valid", "Protected", "Tags"
                );
                println!("{:-<120}", "");
                for version in &versions {
                    println!(
                        "{:<12} {:<20} {:<20} {:<16} {:>10} {:>10} {:<6} {:<9} {}",
                        version.uid.to_string(),
                        version.date.format("%Y-%m-%d %H:%M:%S").to_string(),
                        version.name,
                        version.snapshot_name,
                        format_bytes(version.size),
                        format_bytes(version.block_size),
                        version.valid,
                        version.protected,
                        version.tags.join(",")
                    );
                }
            }
        }
        Ok(())
    }
}

fn version_json(version: &Version) -> serde_json::Value {
    json!({
        "uid": version.uid.to_string(),
        "date": version.date.to_rfc3339(),
        "name": version.name,
        "snapshot_name": version.snapshot_name,
        "size": version.size,
        "block_size": version.block_size,
        "valid": version.valid,
        "protected": version.protected,
        "tags": version.tags,
    })
}

#[derive(Args)]
pub struct StatsCommand {
    #[arg(help = "Only statistics of this version")]
    version: Option<VersionUid>,

    #[arg(short, long, help = "Show at most this many of the latest entries")]
    limit: Option<usize>,

    #[arg(long, value_enum, default_value_t, help = "Output format")]
    format: OutputFormat,
}

impl StatsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = cli.open_engine().await?;
        let stats = engine.stats(self.version, self.limit);
        engine.close().await?;
        let stats = stats?;

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            OutputFormat::Table => print_stats(&stats),
        }
        Ok(())
    }
}

fn print_stats(stats: &[VersionStatistic]) {
    if stats.is_empty() {
        println!("No statistics found");
        return;
    }
    println!(
        "{:<12} {:<20} {:<20} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8}",
        "UID", "Date", "Name", "Size", "Read", "Written", "Dedup", "Sparse", "Seconds"
    );
    println!("{:-<120}", "");
    for stat in stats {
        println!(
            "{:<12} {:<20} {:<20} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8}",
            stat.uid.to_string(),
            stat.date.format("%Y-%m-%d %H:%M:%S").to_string(),
            stat.name,
            format_bytes(stat.size),
            format_bytes(stat.bytes_read),
            format_bytes(stat.bytes_written),
            format_bytes(stat.bytes_dedup),
            format_bytes(stat.bytes_sparse),
            stat.duration_seconds
        );
    }
}

#[derive(Args)]
pub struct ProtectCommand {
    #[arg(required = true, help = "Versions")]
    versions: Vec<VersionUid>,
}

impl ProtectCommand {
    pub async fn run(&self, cli: &crate::Cli, protect: bool) -> Result<()> {
        let mut engine = cli.open_engine().await?;
        let mut outcome = Ok(());
        for &uid in &self.versions {
            outcome = if protect { engine.protect(uid) } else { engine.unprotect(uid) };
            if outcome.is_err() {
                break;
            }
        }
        engine.close().await?;
        Ok(outcome?)
    }
}

#[derive(Args)]
pub struct RmCommand {
    #[arg(required = true, help = "Versions to remove")]
    versions: Vec<VersionUid>,

    #[arg(short, long, help = "Remove versions younger than the configured minimum age")]
    force: bool,

    #[arg(short, long, help = "Keep the version metadata copy in the block store")]
    keep_metadata_backup: bool,
}

impl RmCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut engine = cli.open_engine().await?;
        let mut outcome = Ok(());
        for &uid in &self.versions {
            outcome = engine.rm(uid, self.force, self.keep_metadata_backup).await;
            if outcome.is_err() {
                break;
            }
            info!(version = %uid, "Removed version");
        }
        engine.close().await?;
        Ok(outcome?)
    }
}

#[derive(Args)]
pub struct TagCommand {
    #[arg(help = "Version")]
    version: VersionUid,

    #[arg(required = true, help = "Tags")]
    tags: Vec<String>,
}

impl TagCommand {
    pub async fn run(&self, cli: &crate::Cli, add: bool) -> Result<()> {
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(anyhow!(blocksnap_core::Error::Usage("Tags must not be empty".to_string())));
        }
        let mut engine = cli.open_engine().await?;
        let mut outcome = Ok(());
        for tag in &self.tags {
            outcome = if add {
                engine.add_tag(self.version, tag)
            } else {
                engine.rm_tag(self.version, tag)
            };
            if outcome.is_err() {
                break;
            }
        }
        engine.close().await?;
        Ok(outcome?)
    }
}
