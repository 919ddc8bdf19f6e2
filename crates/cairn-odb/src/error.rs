use std::path::PathBuf;

use cairn_bundle::BundleError;
use cairn_index::IndexError;
use cairn_store::StoreError;
use cairn_types::ObjectId;
use thiserror::Error;

/// Errors surfaced by [`ObjectDatabase`](crate::ObjectDatabase).
///
/// The kinds callers usually branch on are lifted out of the lower crates'
/// errors; everything else stays wrapped.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// No writable backend, or the backend asked is read-only.
    #[error("object database is read-only")]
    ReadOnly,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("corrupt bundle {path}: {reason}")]
    CorruptContainer { path: PathBuf, reason: String },

    #[error("cyclic bundle dependency: {0}")]
    CyclicDependency(String),

    #[error("bundle not found: {0}")]
    BundleNotFound(String),

    #[error("bundle is not loaded: {0}")]
    NotLoaded(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("bundle error: {0}")]
    Bundle(BundleError),

    #[error("index error: {0}")]
    Index(IndexError),
}

impl From<StoreError> for DatabaseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::ReadOnly => Self::ReadOnly,
            StoreError::Unsupported(what) => Self::Unsupported(what.to_string()),
            StoreError::Io(e) => Self::Io(e),
            StoreError::Index(e) => e.into(),
            other => Self::Store(other),
        }
    }
}

impl From<BundleError> for DatabaseError {
    fn from(e: BundleError) -> Self {
        match e {
            BundleError::BundleNotFound(name) => Self::BundleNotFound(name),
            BundleError::NotLoaded(name) => Self::NotLoaded(name),
            BundleError::CorruptContainer { path, reason } => Self::CorruptContainer { path, reason },
            BundleError::CyclicDependency(chain) => Self::CyclicDependency(chain),
            BundleError::Cancelled => Self::Cancelled,
            BundleError::Io(e) => Self::Io(e),
            BundleError::Store(e) => e.into(),
            other => Self::Bundle(other),
        }
    }
}

impl From<IndexError> for DatabaseError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::ReadOnly => Self::ReadOnly,
            other => Self::Index(other),
        }
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_kinds_are_lifted() {
        let id = ObjectId::from_bytes(b"x");
        assert!(matches!(DatabaseError::from(StoreError::NotFound(id)), DatabaseError::NotFound(i) if i == id));
        assert!(matches!(DatabaseError::from(StoreError::ReadOnly), DatabaseError::ReadOnly));
        assert!(matches!(
            DatabaseError::from(StoreError::Index(IndexError::ReadOnly)),
            DatabaseError::ReadOnly
        ));
        let mismatch = StoreError::HashMismatch {
            expected: id,
            computed: ObjectId::from_bytes(b"y"),
        };
        assert!(matches!(DatabaseError::from(mismatch), DatabaseError::Store(_)));
    }

    #[test]
    fn bundle_kinds_are_lifted() {
        assert!(matches!(
            DatabaseError::from(BundleError::BundleNotFound("b".into())),
            DatabaseError::BundleNotFound(_)
        ));
        assert!(matches!(DatabaseError::from(BundleError::Cancelled), DatabaseError::Cancelled));
        assert!(matches!(
            DatabaseError::from(BundleError::Store(StoreError::NotFound(ObjectId::from_bytes(b"z")))),
            DatabaseError::NotFound(_)
        ));
        assert!(matches!(
            DatabaseError::from(BundleError::EmptyBundle("e".into())),
            DatabaseError::Bundle(_)
        ));
    }
}
