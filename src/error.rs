//! Changelog error types

use thiserror::Error;

/// Changelog operation errors
#[derive(Error, Debug)]
pub enum ChangelogError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown on-disk format version
    #[error("Unknown changelog format version {version}")]
    UnknownFormatVersion { version: u8 },

    /// Blob checksum does not match the record header
    #[error("Checksum mismatch for index {index}: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        index: u64,
        expected: u128,
        actual: u128,
    },

    /// Corrupted segment contents or an unparseable segment filename
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Caller violated an operation precondition
    #[error("Logical error: {0}")]
    LogicalError(String),
}

/// Result type for changelog operations
pub type ChangelogResult<T> = Result<T, ChangelogError>;
