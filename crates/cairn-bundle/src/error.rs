use std::path::PathBuf;

use cairn_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BundleError {
    /// No resolver produced a file for the bundle name.
    #[error("bundle not found: {0}")]
    BundleNotFound(String),

    /// Unload requested for a bundle that is not loaded.
    #[error("bundle is not loaded: {0}")]
    NotLoaded(String),

    #[error("corrupt bundle {path}: {reason}")]
    CorruptContainer { path: PathBuf, reason: String },

    /// The dependency chain that closes the cycle, e.g. `a -> b -> a`.
    #[error("cyclic bundle dependency: {0}")]
    CyclicDependency(String),

    #[error("nothing to pack into bundle {0}")]
    EmptyBundle(String),

    #[error("bundle operation cancelled")]
    Cancelled,

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BundleError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptContainer {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type BundleResult<T> = Result<T, BundleError>;
