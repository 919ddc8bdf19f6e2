use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use cairn_index::ContentIndexMap;
use cairn_types::ObjectId;

use crate::error::{StoreError, StoreResult};
use crate::stream::{ObjectReader, ObjectWriter, OpenMode};

/// Content-addressed storage backend.
///
/// All implementations must satisfy these invariants:
/// - The same bytes always map to the same id; writing them again without
///   `force_write` is a no-op.
/// - An object is fully durable before `write` returns its id.
/// - Concurrent reads are always safe, including while enumerating.
/// - The backend never interprets object contents.
/// - All I/O errors are propagated, never silently ignored.
pub trait Backend: Send + Sync {
    /// Check whether an object exists.
    fn exists(&self, id: &ObjectId) -> bool;

    /// Size in bytes of an object's content.
    fn size(&self, id: &ObjectId) -> StoreResult<u64>;

    /// Open an object for reading.
    fn open_read(&self, id: &ObjectId) -> StoreResult<ObjectReader>;

    /// Open an object's storage directly for writing.
    ///
    /// Bytes written this way bypass content addressing; callers are
    /// responsible for keeping the id meaningful.
    fn open_write(&self, id: &ObjectId, mode: OpenMode) -> StoreResult<ObjectWriter>;

    /// Copy exactly `size` bytes from `source` into the backend.
    ///
    /// With a null `id` the id is computed from the bytes while copying. With
    /// a known id that already exists and `force_write == false` nothing is
    /// read or written and the id is returned as is.
    fn write(
        &self,
        id: ObjectId,
        source: &mut dyn Read,
        size: u64,
        force_write: bool,
    ) -> StoreResult<ObjectId>;

    /// Write an in-memory buffer, computing its id.
    fn write_bytes(&self, data: &[u8], force_write: bool) -> StoreResult<ObjectId> {
        let mut source = data;
        self.write(ObjectId::NULL, &mut source, data.len() as u64, force_write)
    }

    /// Delete an object.
    ///
    /// This is intended for garbage collection only. Deleting an object that
    /// a name still points at leaves that name dangling.
    fn delete(&self, id: &ObjectId) -> StoreResult<()>;

    /// Snapshot of every object id held by the backend.
    fn enumerate(&self) -> StoreResult<Vec<ObjectId>>;

    /// Stable on-disk location of an object, for callers that want to map it.
    fn file_path(&self, _id: &ObjectId) -> StoreResult<PathBuf> {
        Err(StoreError::Unsupported("backend is not file backed"))
    }

    /// The name → id slice this backend contributes.
    fn index_map(&self) -> Arc<ContentIndexMap>;

    /// Whether writes and deletes are rejected.
    fn is_read_only(&self) -> bool;
}
