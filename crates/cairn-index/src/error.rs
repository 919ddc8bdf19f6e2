//! Error types for the index crate.

use std::path::PathBuf;

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The slice (or the whole database map) does not accept writes.
    #[error("index map is read-only")]
    ReadOnly,

    /// A name was empty.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// The index file could not be read or written.
    #[error("index file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An index record could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;
