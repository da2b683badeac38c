//! Error types for tierdb.

use std::io;
use thiserror::Error;

/// Result type alias for tierdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for engine operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from file operations.
    #[error("I/O error: {0}")]
    Io(String),

    /// Data corruption detected.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Engine is closed.
    #[error("Engine is closed")]
    EngineClosed,

    /// Engine has been switched to read-only mode.
    #[error("Engine is in read-only mode")]
    ReadOnlyEngine,

    /// Engine already exists when trying to create.
    #[error("Engine already exists at: {0}")]
    EngineExists(String),

    /// Engine not found when trying to open.
    #[error("Engine not found at: {0}")]
    EngineNotFound(String),

    /// Engine directory is locked by another process.
    #[error("Engine directory is locked by another process")]
    EngineLocked,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Bottom segment merge range is not a valid slice of the tier.
    #[error("Invalid merge range: from {from} to {to} over {len} bottom segments")]
    InvalidMergeRange { from: usize, to: usize, len: usize },

    /// Operation is not supported by this segment kind.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid file format or magic number.
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    /// Incomplete record in the manifest log.
    #[error("Incomplete manifest record")]
    IncompleteRecord,

    /// Manifest error.
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// Merge error.
    #[error("Merge error: {0}")]
    MergeError(String),

    /// A layout change went live but could not be written to the manifest.
    #[error("Layout change published but not logged: {0}")]
    LayoutNotLogged(String),

    /// An earlier layout change was never logged; the engine must be reopened.
    #[error("Layout diverged from the manifest; reopen the engine")]
    LayoutPoisoned,

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create an invalid format error.
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Error::InvalidFormat(msg.into())
    }

    /// Create a manifest error.
    pub fn manifest<S: Into<String>>(msg: S) -> Self {
        Error::ManifestError(msg.into())
    }

    /// Create a merge error.
    pub fn merge<S: Into<String>>(msg: S) -> Self {
        Error::MergeError(msg.into())
    }

    /// Create an unsupported operation error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if this error is recoverable.
    ///
    /// Read-only mode and a closed engine are terminal; I/O failures may
    /// succeed on a later attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::EngineLocked)
    }

    /// Check if the engine can no longer make progress without a reopen.
    ///
    /// The live layout is ahead of the manifest, so no further layout
    /// change may be published on top of it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LayoutNotLogged(_) | Error::LayoutPoisoned)
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_)
                | Error::CrcMismatch { .. }
                | Error::InvalidFormat(_)
                | Error::IncompleteRecord
        )
    }
}
