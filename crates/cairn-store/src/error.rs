use cairn_types::ObjectId;

/// Errors from backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// Write or delete attempted on a read-only backend.
    #[error("backend is read-only")]
    ReadOnly,

    /// The backend does not support the operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Content hash mismatch (data corruption or wrong id supplied).
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch {
        expected: ObjectId,
        computed: ObjectId,
    },

    /// The stored object data is malformed or cannot be decoded.
    #[error("corrupt object {id}: {reason}")]
    CorruptObject { id: ObjectId, reason: String },

    /// The backend's content index map failed.
    #[error("index error: {0}")]
    Index(#[from] cairn_index::IndexError),

    /// I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
