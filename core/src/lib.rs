pub mod checksum;
pub mod codec;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metadata;
pub mod retention;
pub mod throttle;
pub mod types;

pub use checksum::HashFunction;
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use metadata::MetadataStore;
pub use types::*;
