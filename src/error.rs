//! Error types for locdb.

use thiserror::Error;

/// Error type for locdb operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The file does not start with the database magic
    #[error("not a location database")]
    NotADatabase,

    /// The database carries a format version this build cannot read
    #[error("unsupported database version: {0}")]
    UnsupportedVersion(u16),

    /// A section, record or string inside the database is malformed
    #[error("invalid database data: {0}")]
    InvalidData(String),

    /// The caller passed a malformed address, code or key
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The same AS number was added more than once
    #[error("duplicate AS number: {0}")]
    DuplicateAs(u32),

    /// The same country code was added more than once
    #[error("duplicate country code: {0}")]
    DuplicateCountry(String),

    /// Verification was requested but the database is unsigned
    #[error("database carries no signature")]
    NoSignature,

    /// No signature in the database verifies against the given key
    #[error("signature verification failed")]
    BadSignature,

    /// Address arithmetic under- or overflowed
    #[error("address out of range")]
    OutOfRange,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for locdb operations.
pub type Result<T> = std::result::Result<T, Error>;
