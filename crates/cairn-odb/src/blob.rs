//! Reference-counted, in-memory copies of objects.
//!
//! A [`BlobCache`] holds at most one [`Blob`] per id. Every handle handed out
//! counts as one reference; dropping the handle releases it, and the entry is
//! evicted when the last reference goes away.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use cairn_types::ObjectId;
use tracing::debug;

pub(crate) struct CacheEntry {
    pub(crate) content: Bytes,
    pub(crate) ref_count: usize,
}

pub(crate) type Entries = HashMap<ObjectId, CacheEntry>;

#[derive(Default)]
struct CacheInner {
    entries: Mutex<Entries>,
}

impl CacheInner {
    fn release(&self, id: &ObjectId) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let Some(entry) = entries.get_mut(id) else {
            panic!("released blob {id} that the cache does not track");
        };
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            entries.remove(id);
            debug!(id = %id.short_hex(), "blob evicted");
        }
    }
}

/// Per-database cache of [`Blob`]s.
#[derive(Clone, Default)]
pub struct BlobCache {
    inner: Arc<CacheInner>,
}

impl BlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lock().contains_key(id)
    }

    /// Outstanding references to a cached blob, 0 when not cached.
    pub fn ref_count(&self, id: &ObjectId) -> usize {
        self.lock().get(id).map_or(0, |e| e.ref_count)
    }

    /// The cache map. Held across every check-then-insert so two callers
    /// never cache the same id twice.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Entries> {
        self.inner.entries.lock().expect("lock poisoned")
    }

    /// Take one more reference to a cached entry.
    pub(crate) fn acquire(&self, entries: &mut Entries, id: &ObjectId) -> Option<Blob> {
        let entry = entries.get_mut(id)?;
        entry.ref_count += 1;
        Some(self.handle(*id, entry.content.clone()))
    }

    /// Cache new content with one reference.
    pub(crate) fn insert(&self, entries: &mut Entries, id: ObjectId, content: Bytes) -> Blob {
        entries.insert(
            id,
            CacheEntry {
                content: content.clone(),
                ref_count: 1,
            },
        );
        debug!(id = %id.short_hex(), size = content.len(), "blob cached");
        self.handle(id, content)
    }

    fn handle(&self, id: ObjectId, content: Bytes) -> Blob {
        Blob {
            id,
            content,
            cache: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache").field("len", &self.len()).finish()
    }
}

/// Immutable bytes of one object, shared through a [`BlobCache`].
///
/// Holding a `Blob` keeps the object cached. Cloning takes another reference.
pub struct Blob {
    id: ObjectId,
    content: Bytes,
    cache: Arc<CacheInner>,
}

impl Blob {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Cheap shared copy of the content.
    pub fn bytes(&self) -> Bytes {
        self.content.clone()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Seekable reader over the content, holding its own reference.
    pub fn reader(&self) -> BlobReader {
        BlobReader::new(self.clone())
    }

    /// Release this reference now. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Clone for Blob {
    fn clone(&self) -> Self {
        let mut entries = self.cache.entries.lock().expect("lock poisoned");
        match entries.get_mut(&self.id) {
            Some(entry) => entry.ref_count += 1,
            None => panic!("cloned blob {} that the cache does not track", self.id),
        }
        Self {
            id: self.id,
            content: self.content.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.cache.release(&self.id);
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.id)
            .field("len", &self.content.len())
            .finish()
    }
}

/// Read + Seek stream over a cached blob.
#[derive(Debug)]
pub struct BlobReader {
    cursor: Cursor<Bytes>,
    blob: Blob,
}

impl BlobReader {
    pub fn new(blob: Blob) -> Self {
        Self {
            cursor: Cursor::new(blob.bytes()),
            blob,
        }
    }

    pub fn blob(&self) -> &Blob {
        &self.blob
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for BlobReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(cache: &BlobCache, data: &'static [u8]) -> Blob {
        let mut entries = cache.lock();
        cache.insert(&mut entries, ObjectId::from_bytes(data), Bytes::from_static(data))
    }

    #[test]
    fn drop_evicts_last_reference() {
        let cache = BlobCache::new();
        let blob = cached(&cache, b"payload");
        let id = blob.id();
        assert_eq!(cache.ref_count(&id), 1);
        drop(blob);
        assert!(!cache.contains(&id));
        assert!(cache.is_empty());
    }

    #[test]
    fn clone_and_acquire_add_references() {
        let cache = BlobCache::new();
        let blob = cached(&cache, b"shared");
        let id = blob.id();
        let second = blob.clone();
        let third = {
            let mut entries = cache.lock();
            cache.acquire(&mut entries, &id).unwrap()
        };
        assert_eq!(cache.ref_count(&id), 3);

        blob.release();
        second.release();
        assert_eq!(cache.ref_count(&id), 1);
        assert_eq!(third.content(), b"shared");
        third.release();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn acquire_misses_uncached_id() {
        let cache = BlobCache::new();
        let mut entries = cache.lock();
        assert!(cache.acquire(&mut entries, &ObjectId::from_bytes(b"none")).is_none());
    }

    #[test]
    fn reader_holds_a_reference() {
        let cache = BlobCache::new();
        let blob = cached(&cache, b"0123456789");
        let id = blob.id();
        let mut reader = blob.reader();
        blob.release();
        assert_eq!(cache.ref_count(&id), 1);

        reader.seek(SeekFrom::Start(4)).unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "456789");
        drop(reader);
        assert!(!cache.contains(&id));
    }

    #[test]
    #[should_panic(expected = "does not track")]
    fn untracked_release_panics() {
        let cache = BlobCache::new();
        let blob = cached(&cache, b"gone");
        cache.lock().clear();
        blob.release();
    }
}
