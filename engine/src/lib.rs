//! Backup, restore, scrub and garbage collection of block device images.
//!
//! ```no_run
//! use blocksnap_core::Config;
//! use blocksnap_engine::{BackupRequest, Engine, RestoreOptions};
//!
//! # async fn run() -> blocksnap_core::Result<()> {
//! let config = Config::load("/etc/blocksnap.toml").await?;
//! let mut engine = Engine::open(config, false).await?;
//! let version = engine.backup(BackupRequest::new("vm1", "snap-1", "file:///dev/vg0/vm1-snap")).await?;
//! engine.restore(version.uid, "/tmp/vm1.img", RestoreOptions::default()).await?;
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

mod backup;
mod cleanup;
mod engine;
pub mod hints;
pub mod io;
mod metadata;
mod restore;
mod retention;
mod scrub;

pub use backup::BackupRequest;
pub use cleanup::{CleanupReport, DEFAULT_CLEANUP_MIN_AGE};
pub use engine::Engine;
pub use hints::{Hint, parse_hints};
pub use restore::RestoreOptions;
