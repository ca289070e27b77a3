use std::io;

/// The error taxonomy for every fallible operation the engine exposes.
///
/// Corruption encountered mid-transaction aborts and rolls back; corruption
/// encountered on a plain read surfaces to the caller and leaves the handle
/// usable for other pages. Crypto errors are fatal to the handle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not a valid database file: {0}")]
    InvalidFile(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("database disk image is malformed on page {page}: {reason}")]
    Corrupt { page: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("crypto error on page {page}: {reason}")]
    CryptoError { page: u32, reason: String },

    #[error("database is locked")]
    Busy,

    #[error("constraint violation: {kind}")]
    Constraint { kind: String },

    #[error("no such row")]
    NotFound,

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(page: u32, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            page,
            reason: reason.into(),
        }
    }
}
