use anyhow::{Context, Result};
use blocksnap_core::{VersionFilter, VersionUid};
use clap::Args;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct ExportCommand {
    #[arg(required = true, help = "Versions to export")]
    versions: Vec<VersionUid>,

    #[arg(short, long, help = "Output file, standard output if not given")]
    output: Option<PathBuf>,
}

impl ExportCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut engine = cli.open_engine().await?;
        let outcome = match &self.output {
            Some(path) => File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))
                .and_then(|file| {
                    let mut writer = BufWriter::new(file);
                    engine.export(&self.versions, &mut writer)?;
                    writer.flush()?;
                    Ok(())
                }),
            None => {
                let stdout = io::stdout();
                let mut writer = stdout.lock();
                engine
                    .export(&self.versions, &mut writer)
                    .map_err(anyhow::Error::from)
                    .and_then(|()| Ok(writeln!(writer)?))
            }
        };
        engine.close().await?;
        outcome
    }
}

#[derive(Args)]
pub struct ImportCommand {
    #[arg(short, long, help = "Input file, standard input if not given")]
    input: Option<PathBuf>,
}

impl ImportCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut engine = cli.open_engine().await?;
        let outcome = match &self.input {
            Some(path) => File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))
                .and_then(|file| Ok(engine.import(BufReader::new(file))?)),
            None => engine.import(io::stdin().lock()).map_err(anyhow::Error::from),
        };
        engine.close().await?;
        for uid in outcome? {
            println!("{}", uid);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct MetadataBackupCommand {
    #[arg(help = "Versions, all valid versions if none are given")]
    versions: Vec<VersionUid>,

    #[arg(short, long, help = "Overwrite existing copies")]
    force: bool,
}

impl MetadataBackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut engine = cli.open_engine().await?;
        let outcome = async {
            let uids = if self.versions.is_empty() {
                let filter = VersionFilter {
                    valid: Some(true),
                    ..Default::default()
                };
                engine.ls(&filter)?.into_iter().map(|v| v.uid).collect()
            } else {
                self.versions.clone()
            };
            engine.metadata_backup(&uids, self.force).await?;
            Ok::<_, blocksnap_core::Error>(uids.len())
        }
        .await;
        engine.close().await?;
        info!(count = outcome?, "Backed up version metadata");
        Ok(())
    }
}

#[derive(Args)]
pub struct MetadataRestoreCommand {
    #[arg(help = "Versions, every copy in the block store if none are given")]
    versions: Vec<VersionUid>,
}

impl MetadataRestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut engine = cli.open_engine().await?;
        let outcome = async {
            let uids = if self.versions.is_empty() {
                engine.metadata_ls().await?
            } else {
                self.versions.clone()
            };
            engine.metadata_restore(&uids).await
        }
        .await;
        engine.close().await?;
        for uid in outcome? {
            println!("{}", uid);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct MetadataLsCommand {}

impl MetadataLsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = cli.open_engine().await?;
        let outcome = engine.metadata_ls().await;
        engine.close().await?;
        for uid in outcome? {
            println!("{}", uid);
        }
        Ok(())
    }
}
