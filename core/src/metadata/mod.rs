//! Durable record of versions, blocks, tags, statistics, tombstones and locks.
//!
//! The store owns a single SQLite connection and is driven from one control
//! task; it is never shared across worker threads. Locks use a second
//! connection to the same database so a guard can release its lock
//! independently of the batch transaction held by the main connection.

mod export;
mod locking;
mod store;

pub use export::{BlockDocument, METADATA_VERSION, MetadataDocument, TagDocument, VersionDocument};
pub use locking::{GLOBAL_LOCK, LockGuard, Locking};
pub use store::{DeleteCandidates, MetadataStore};
