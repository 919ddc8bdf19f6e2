use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::{Arc, RwLock};

use cairn_index::ContentIndexMap;
use cairn_types::{HashingReader, ObjectId};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::stream::{ObjectReader, ObjectWriter, OpenMode};
use crate::traits::Backend;

/// In-memory, HashMap-based backend.
///
/// Intended for tests and embedding. All objects are held in memory behind a
/// `RwLock` for safe concurrent access. It is not file backed, so
/// [`Backend::file_path`] and [`Backend::open_write`] are unsupported.
pub struct InMemoryBackend {
    objects: RwLock<HashMap<ObjectId, Arc<[u8]>>>,
    index: Arc<ContentIndexMap>,
    read_only: bool,
}

impl InMemoryBackend {
    /// Create a new empty, writable backend.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            index: Arc::new(ContentIndexMap::new()),
            read_only: false,
        }
    }

    /// Freeze a populated backend into a read-only one.
    pub fn into_read_only(self) -> Self {
        let index = ContentIndexMap::read_only();
        index.merge(self.index.entries());
        Self {
            objects: self.objects,
            index: Arc::new(index),
            read_only: true,
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the backend is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .expect("lock poisoned")
            .values()
            .map(|data| data.len() as u64)
            .sum()
    }

    fn get(&self, id: &ObjectId) -> StoreResult<Arc<[u8]>> {
        self.objects
            .read()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for InMemoryBackend {
    fn exists(&self, id: &ObjectId) -> bool {
        self.objects.read().expect("lock poisoned").contains_key(id)
    }

    fn size(&self, id: &ObjectId) -> StoreResult<u64> {
        Ok(self.get(id)?.len() as u64)
    }

    fn open_read(&self, id: &ObjectId) -> StoreResult<ObjectReader> {
        let data = self.get(id)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_write(&self, _id: &ObjectId, _mode: OpenMode) -> StoreResult<ObjectWriter> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Err(StoreError::Unsupported("in-memory objects cannot be opened for writing"))
    }

    fn write(
        &self,
        id: ObjectId,
        source: &mut dyn Read,
        size: u64,
        force_write: bool,
    ) -> StoreResult<ObjectId> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if !id.is_null() && !force_write && self.exists(&id) {
            return Ok(id);
        }

        let mut reader = HashingReader::new(source.take(size));
        let mut data = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended after {} of {size} bytes", data.len()),
            )
            .into());
        }
        let computed = reader.object_id();
        let id = if id.is_null() { computed } else { id };

        let mut map = self.objects.write().expect("lock poisoned");
        if force_write || !map.contains_key(&id) {
            map.insert(id, Arc::from(data));
            debug!(id = %id.short_hex(), size, "object stored in memory");
        }
        Ok(id)
    }

    fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut map = self.objects.write().expect("lock poisoned");
        map.remove(id).map(|_| ()).ok_or(StoreError::NotFound(*id))
    }

    fn enumerate(&self) -> StoreResult<Vec<ObjectId>> {
        let map = self.objects.read().expect("lock poisoned");
        let mut ids: Vec<ObjectId> = map.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn index_map(&self) -> Arc<ContentIndexMap> {
        Arc::clone(&self.index)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("object_count", &self.len())
            .field("read_only", &self.read_only)
            .finish()
    }
}
