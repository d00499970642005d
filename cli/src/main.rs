mod commands;

use anyhow::Result;
use blocksnap_core::{Config, ErrorKind};
use blocksnap_engine::Engine;
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand,
    cleanup::CleanupCommand,
    init::InitCommand,
    metadata::{ExportCommand, ImportCommand, MetadataBackupCommand, MetadataLsCommand, MetadataRestoreCommand},
    restore::RestoreCommand,
    retention::EnforceCommand,
    scrub::{DeepScrubCommand, ScrubCommand},
    versions::{LsCommand, ProtectCommand, RmCommand, StatsCommand, TagCommand},
};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "blocksnap",
    version,
    about = "Deduplicating block device backups",
    long_about = "Blocksnap backs up block devices and images into a deduplicated, checksummed block store"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, env = "BLOCKSNAP_CONFIG", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Only log warnings and errors")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialise the metadata database and storage")]
    Init(InitCommand),

    #[command(about = "Back up a source into a new version")]
    Backup(BackupCommand),

    #[command(about = "Restore a version to a file or block device")]
    Restore(RestoreCommand),

    #[command(about = "List versions")]
    Ls(LsCommand),

    #[command(about = "Show backup statistics")]
    Stats(StatsCommand),

    #[command(about = "Protect versions from removal")]
    Protect(ProtectCommand),

    #[command(about = "Allow versions to be removed again")]
    Unprotect(ProtectCommand),

    #[command(about = "Remove versions")]
    Rm(RmCommand),

    #[command(about = "Add tags to a version")]
    AddTag(TagCommand),

    #[command(about = "Remove tags from a version")]
    RmTag(TagCommand),

    #[command(about = "Check that a version's blocks are present and consistent")]
    Scrub(ScrubCommand),

    #[command(about = "Read a version's blocks back and verify their content")]
    DeepScrub(DeepScrubCommand),

    #[command(about = "Delete blocks no version uses any more")]
    Cleanup(CleanupCommand),

    #[command(about = "Export version metadata as JSON")]
    Export(ExportCommand),

    #[command(about = "Import version metadata from JSON")]
    Import(ImportCommand),

    #[command(about = "Copy version metadata into the block store")]
    MetadataBackup(MetadataBackupCommand),

    #[command(about = "Import version metadata from the block store")]
    MetadataRestore(MetadataRestoreCommand),

    #[command(about = "List version metadata kept in the block store")]
    MetadataLs(MetadataLsCommand),

    #[command(about = "Remove versions according to a retention policy")]
    Enforce(EnforceCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Init(cmd) => cmd.run(cli).await,
        Commands::Backup(cmd) => cmd.run(cli).await,
        Commands::Restore(cmd) => cmd.run(cli).await,
        Commands::Ls(cmd) => cmd.run(cli).await,
        Commands::Stats(cmd) => cmd.run(cli).await,
        Commands::Protect(cmd) => cmd.run(cli, true).await,
        Commands::Unprotect(cmd) => cmd.run(cli, false).await,
        Commands::Rm(cmd) => cmd.run(cli).await,
        Commands::AddTag(cmd) => cmd.run(cli, true).await,
        Commands::RmTag(cmd) => cmd.run(cli, false).await,
        Commands::Scrub(cmd) => cmd.run(cli).await,
        Commands::DeepScrub(cmd) => cmd.run(cli).await,
        Commands::Cleanup(cmd) => cmd.run(cli).await,
        Commands::Export(cmd) => cmd.run(cli).await,
        Commands::Import(cmd) => cmd.run(cli).await,
        Commands::MetadataBackup(cmd) => cmd.run(cli).await,
        Commands::MetadataRestore(cmd) => cmd.run(cli).await,
        Commands::MetadataLs(cmd) => cmd.run(cli).await,
        Commands::Enforce(cmd) => cmd.run(cli).await,
    }
}

impl Cli {
    /// `--config`, then `$BLOCKSNAP_CONFIG` (via clap), then the platform
    /// config directory.
    fn config_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config {
            return Ok(path.clone());
        }
        ProjectDirs::from("org", "blocksnap", "blocksnap")
            .map(|dirs| dirs.config_dir().join("blocksnap.toml"))
            .ok_or_else(|| {
                blocksnap_core::Error::Configuration("No configuration file given and no home directory".to_string())
                    .into()
            })
    }

    pub async fn load_config(&self) -> Result<Config> {
        let path = self.config_path()?;
        debug!(path = %path.display(), "Loading configuration");
        Ok(Config::load(&path).await?)
    }

    pub async fn open_engine(&self) -> Result<Engine> {
        let config = self.load_config().await?;
        Ok(Engine::open(config, false).await?)
    }
}

/// Process exit status for an error, by its kind.
fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<blocksnap_core::Error>().map(|e| e.kind()) {
        Some(ErrorKind::Usage) => 2,
        Some(ErrorKind::AlreadyLocked) => 3,
        Some(ErrorKind::Internal) => 4,
        Some(ErrorKind::InputData) => 5,
        Some(ErrorKind::AlreadyExists) => 6,
        Some(ErrorKind::NotFound) => 7,
        Some(ErrorKind::Configuration) => 8,
        Some(ErrorKind::Corrupt) => 10,
        Some(ErrorKind::Io) | None => 1,
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("blocksnap={}", level)));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::from(blocksnap_core::Error::Usage("bad".to_string()));
        assert_eq!(exit_code(&usage), 2);
        let locked = anyhow::Error::from(blocksnap_core::Error::AlreadyLocked {
            name: "global".to_string(),
            holder: "test".to_string(),
        });
        assert_eq!(exit_code(&locked), 3);
        let corrupt = anyhow::Error::from(blocksnap_core::Error::Corrupt("bad block".to_string())).context("scrub failed");
        assert_eq!(exit_code(&corrupt), 10);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_parses_version_uids() {
        let cli = Cli::try_parse_from(["blocksnap", "restore", "V0000000003", "/tmp/out.img", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Restore(_)));
        assert!(Cli::try_parse_from(["blocksnap", "restore", "Vx", "/tmp/out.img"]).is_err());
    }

    #[tokio::test]
    async fn test_commands_against_a_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("blocksnap.toml");
        std::fs::write(
            &config,
            format!(
                "block_size = 4096\nmetadata_path = \"{}\"\n\n[storage]\nbackend = \"file\"\npath = \"{}\"\n",
                dir.path().join("metadata.sqlite").display(),
                dir.path().join("data").display()
            ),
        )
        .unwrap();
        let data: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
        let source = dir.path().join("source.img");
        std::fs::write(&source, &data).unwrap();
        let target = dir.path().join("restored.img");

        let config = config.to_str().unwrap();
        let source = source.to_str().unwrap();
        let restored = target.to_str().unwrap();
        for args in [
            vec!["blocksnap", "-c", config, "init"],
            vec!["blocksnap", "-c", config, "backup", source, "vm1", "-s", "snap-1", "-t", "daily"],
            vec!["blocksnap", "-c", config, "restore", "V0000000001", restored],
            vec!["blocksnap", "-c", config, "scrub", "V1", "-p", "50"],
            vec!["blocksnap", "-c", config, "protect", "V1"],
        ] {
            let cli = Cli::try_parse_from(args).unwrap();
            run(&cli).await.unwrap();
        }
        assert_eq!(std::fs::read(&target).unwrap(), data);

        let cli = Cli::try_parse_from(["blocksnap", "-c", config, "rm", "V1", "--force"]).unwrap();
        assert_eq!(exit_code(&run(&cli).await.unwrap_err()), 2);
        let cli = Cli::try_parse_from(["blocksnap", "-c", config, "restore", "V1", restored]).unwrap();
        assert_eq!(exit_code(&run(&cli).await.unwrap_err()), 6);
    }
}
