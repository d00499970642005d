use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Input data error: {0}")]
    InputData(String),

    #[error("Lock {name} is already held: {holder}")]
    AlreadyLocked { name: String, holder: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{what} already exists: {id}")]
    AlreadyExists { what: &'static str, id: String },

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Coarse classification of [`Error`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    InputData,
    AlreadyLocked,
    NotFound,
    AlreadyExists,
    Corrupt,
    Internal,
    Configuration,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Usage(_) => ErrorKind::Usage,
            Error::InputData(_) | Error::Serialization(_) => ErrorKind::InputData,
            Error::AlreadyLocked { .. } => ErrorKind::AlreadyLocked,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::Corrupt(_) | Error::Encryption(_) | Error::Compression(_) => ErrorKind::Corrupt,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Io(_) | Error::Database(_) | Error::Backend(_) => ErrorKind::Io,
        }
    }

    /// Whether this error means the data itself is bad rather than the path to it.
    ///
    /// Scrub and restore turn these into block invalidation and keep going.
    pub fn is_data_integrity(&self) -> bool {
        matches!(self.kind(), ErrorKind::Corrupt) || matches!(self, Error::NotFound { what: "blob", .. })
    }

    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Error::NotFound { what, id: id.to_string() }
    }

    pub fn already_exists(what: &'static str, id: impl ToString) -> Self {
        Error::AlreadyExists { what, id: id.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
