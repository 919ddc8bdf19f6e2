use std::collections::BTreeSet;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use cairn_bundle::{BundleBackend, BundleOptions, BundleReport};
use cairn_index::DatabaseIndexMap;
use cairn_store::{
    Backend, FileAccess, LooseFileBackend, ObjectReader, ObjectWriter, OpenMode, StoreError,
};
use cairn_types::ObjectId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::blob::{Blob, BlobCache, BlobReader};
use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, DatabaseResult};

/// Name of the bundle loaded by [`ObjectDatabase::initialize`] unless
/// configured otherwise.
pub const DEFAULT_BUNDLE: &str = "default";

/// Which layer receives writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteSlot {
    Primary,
    Overflow,
}

/// Stream returned by [`ObjectDatabase::open_stream`] and
/// [`ObjectDatabase::read`].
pub enum ObjectStream {
    Read(ObjectReader),
    Write(ObjectWriter),
    Blob(BlobReader),
}

impl ObjectStream {
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Write(_))
    }

    /// Read the remaining bytes of the stream.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for ObjectStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Read(r) => r.read(buf),
            Self::Write(w) => w.read(buf),
            Self::Blob(b) => b.read(buf),
        }
    }
}

impl Seek for ObjectStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Read(r) => r.seek(pos),
            Self::Write(w) => w.seek(pos),
            Self::Blob(b) => b.seek(pos),
        }
    }
}

impl Write for ObjectStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Write(w) => w.write(buf),
            _ => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "stream was opened for reading",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Write(w) => w.flush(),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Read(_) => "Read",
            Self::Write(_) => "Write",
            Self::Blob(_) => "Blob",
        };
        f.debug_tuple("ObjectStream").field(&kind).finish()
    }
}

/// Builder for [`ObjectDatabase`].
pub struct ObjectDatabaseBuilder {
    primary: Arc<dyn Backend>,
    overflow: Option<Arc<dyn Backend>>,
    bundle_directory: Option<PathBuf>,
    default_bundle: Option<String>,
}

impl ObjectDatabaseBuilder {
    /// Secondary backend, read after the primary and written to when the
    /// primary is read-only.
    pub fn overflow(mut self, backend: Arc<dyn Backend>) -> Self {
        self.overflow = Some(backend);
        self
    }

    /// Directory bundles are resolved from and created in. Defaults to
    /// `bundles` under the working directory.
    pub fn bundle_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.bundle_directory = Some(directory.into());
        self
    }

    /// Bundle loaded by [`ObjectDatabase::initialize`]; `None` disables it.
    pub fn default_bundle(mut self, name: Option<String>) -> Self {
        self.default_bundle = name;
        self
    }

    pub fn build(self) -> ObjectDatabase {
        let write_slot = if !self.primary.is_read_only() {
            Some(WriteSlot::Primary)
        } else if self.overflow.as_ref().is_some_and(|o| !o.is_read_only()) {
            Some(WriteSlot::Overflow)
        } else {
            None
        };

        let bundles = Arc::new(BundleBackend::new(
            self.bundle_directory
                .unwrap_or_else(|| PathBuf::from("bundles")),
        ));

        let mut layers = vec![self.primary.index_map()];
        if let Some(overflow) = &self.overflow {
            layers.push(overflow.index_map());
        }
        layers.push(bundles.index_map());
        let writable = match write_slot {
            Some(WriteSlot::Primary) => Some(self.primary.index_map()),
            Some(WriteSlot::Overflow) => self.overflow.as_ref().map(|o| o.index_map()),
            None => None,
        };
        let index = DatabaseIndexMap::new(layers, writable);

        debug!(
            writable = write_slot.is_some(),
            overflow = self.overflow.is_some(),
            bundles = %bundles.directory().display(),
            "object database built"
        );
        ObjectDatabase {
            bundles,
            primary: self.primary,
            overflow: self.overflow,
            write_slot,
            index,
            blobs: BlobCache::new(),
            default_bundle: self.default_bundle,
        }
    }
}

/// Content-addressable object database.
///
/// Reads search the loaded bundles, then the primary backend, then the
/// overflow backend; the first layer holding an id wins. Writes go to a
/// single write backend: the primary when writable, else the overflow.
pub struct ObjectDatabase {
    bundles: Arc<BundleBackend>,
    primary: Arc<dyn Backend>,
    overflow: Option<Arc<dyn Backend>>,
    write_slot: Option<WriteSlot>,
    index: DatabaseIndexMap,
    blobs: BlobCache,
    default_bundle: Option<String>,
}

impl ObjectDatabase {
    pub fn builder(primary: Arc<dyn Backend>) -> ObjectDatabaseBuilder {
        ObjectDatabaseBuilder {
            primary,
            overflow: None,
            bundle_directory: None,
            default_bundle: Some(DEFAULT_BUNDLE.to_string()),
        }
    }

    /// Open loose object directories as described by `config`.
    ///
    /// Bundles are not touched; call [`initialize`](Self::initialize) to load
    /// the default bundle.
    pub fn from_config(config: &DatabaseConfig) -> DatabaseResult<Self> {
        config.validate()?;
        let primary = LooseFileBackend::open(&config.root, &config.index_name, config.read_only)?;
        let mut builder = Self::builder(Arc::new(primary))
            .bundle_directory(config.bundle_directory())
            .default_bundle(config.default_bundle.clone());
        if let Some(root) = &config.overflow_root {
            let overflow = LooseFileBackend::open(root, &config.index_name, false)?;
            builder = builder.overflow(Arc::new(overflow));
        }
        info!(root = %config.root.display(), read_only = config.read_only, "object database opened");
        Ok(builder.build())
    }

    /// Load the default bundle. A default bundle that does not exist is not
    /// an error; any other failure is.
    pub async fn initialize(&self, cancel: &CancellationToken) -> DatabaseResult<()> {
        let Some(name) = &self.default_bundle else {
            return Ok(());
        };
        match self.load_bundle(name, cancel).await {
            Ok(()) => Ok(()),
            Err(DatabaseError::BundleNotFound(missing)) if missing == *name => {
                debug!(bundle = %name, "no default bundle");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Layers
    // -----------------------------------------------------------------------

    fn read_layers(&self) -> Vec<&dyn Backend> {
        let mut layers: Vec<&dyn Backend> = vec![self.bundles.as_ref(), self.primary.as_ref()];
        layers.extend(self.overflow.as_deref());
        layers
    }

    fn loose_layers(&self) -> Vec<&dyn Backend> {
        let mut layers: Vec<&dyn Backend> = vec![self.primary.as_ref()];
        layers.extend(self.overflow.as_deref());
        layers
    }

    /// The backend receiving writes, if any.
    pub fn write_backend(&self) -> Option<&dyn Backend> {
        match self.write_slot? {
            WriteSlot::Primary => Some(self.primary.as_ref()),
            WriteSlot::Overflow => self.overflow.as_deref(),
        }
    }

    fn writer(&self) -> DatabaseResult<&dyn Backend> {
        self.write_backend().ok_or(DatabaseError::ReadOnly)
    }

    pub fn is_read_only(&self) -> bool {
        self.write_slot.is_none()
    }

    pub fn primary(&self) -> &Arc<dyn Backend> {
        &self.primary
    }

    pub fn overflow(&self) -> Option<&Arc<dyn Backend>> {
        self.overflow.as_ref()
    }

    pub fn bundle_backend(&self) -> &Arc<BundleBackend> {
        &self.bundles
    }

    pub fn blob_cache(&self) -> &BlobCache {
        &self.blobs
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    pub fn exists(&self, id: &ObjectId) -> bool {
        self.read_layers().iter().any(|b| b.exists(id))
    }

    pub fn size(&self, id: &ObjectId) -> DatabaseResult<u64> {
        for backend in self.read_layers() {
            match backend.size(id) {
                Ok(size) => return Ok(size),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DatabaseError::NotFound(*id))
    }

    /// On-disk file of a loose object. Bundle-resident objects have none.
    pub fn file_path(&self, id: &ObjectId) -> DatabaseResult<PathBuf> {
        if self.bundles.exists(id) {
            return Err(DatabaseError::Unsupported(format!(
                "object {id} is stored in a bundle"
            )));
        }
        for backend in self.loose_layers() {
            if backend.exists(id) {
                return Ok(backend.file_path(id)?);
            }
        }
        Err(DatabaseError::NotFound(*id))
    }

    pub fn open_read(&self, id: &ObjectId) -> DatabaseResult<ObjectReader> {
        self.try_open_read(id)?
            .ok_or(DatabaseError::NotFound(*id))
    }

    fn try_open_read(&self, id: &ObjectId) -> DatabaseResult<Option<ObjectReader>> {
        for backend in self.read_layers() {
            match backend.open_read(id) {
                Ok(reader) => return Ok(Some(reader)),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Open an object stream.
    ///
    /// Read access searches every layer. Write access goes to the write
    /// backend; when that is not the primary and `mode` keeps existing
    /// content, bytes found only on the read path are copied over first.
    pub fn open_stream(
        &self,
        id: &ObjectId,
        mode: OpenMode,
        access: FileAccess,
    ) -> DatabaseResult<ObjectStream> {
        if !access.is_write() {
            return Ok(ObjectStream::Read(self.open_read(id)?));
        }
        let writer = self.writer()?;
        if self.write_slot != Some(WriteSlot::Primary)
            && mode.preserves_content()
            && !writer.exists(id)
        {
            if let Some(mut source) = self.try_open_read(id)? {
                let mut target = writer.open_write(id, OpenMode::Create)?;
                let copied = io::copy(&mut source, &mut target)?;
                target.flush()?;
                debug!(id = %id.short_hex(), copied, "object copied to write backend");
            }
        }
        Ok(ObjectStream::Write(writer.open_write(id, mode)?))
    }

    /// Store exactly `size` bytes from `source`, returning their id.
    pub fn write(
        &self,
        source: &mut dyn Read,
        size: u64,
        force_write: bool,
    ) -> DatabaseResult<ObjectId> {
        let id = self.writer()?.write(ObjectId::NULL, source, size, force_write)?;
        Ok(id)
    }

    pub fn write_bytes(&self, data: &[u8], force_write: bool) -> DatabaseResult<ObjectId> {
        Ok(self.writer()?.write_bytes(data, force_write)?)
    }

    /// Store `data` and bind `name` to it. The object is durable before the
    /// name is published.
    pub fn write_named(&self, name: &str, data: &[u8]) -> DatabaseResult<ObjectId> {
        let id = self.write_bytes(data, false)?;
        self.index.insert(name, id)?;
        Ok(id)
    }

    pub fn resolve(&self, name: &str) -> Option<ObjectId> {
        self.index.get(name)
    }

    pub fn index_map(&self) -> &DatabaseIndexMap {
        &self.index
    }

    /// Delete an object from the write backend.
    pub fn delete(&self, id: &ObjectId) -> DatabaseResult<()> {
        Ok(self.writer()?.delete(id)?)
    }

    /// Every object id visible through any layer, sorted and de-duplicated.
    pub fn enumerate_objects(&self) -> DatabaseResult<Vec<ObjectId>> {
        Self::union(self.read_layers())
    }

    /// Like [`enumerate_objects`](Self::enumerate_objects) without bundles.
    pub fn enumerate_loose_objects(&self) -> DatabaseResult<Vec<ObjectId>> {
        Self::union(self.loose_layers())
    }

    fn union(layers: Vec<&dyn Backend>) -> DatabaseResult<Vec<ObjectId>> {
        let mut ids = BTreeSet::new();
        for backend in layers {
            ids.extend(backend.enumerate()?);
        }
        Ok(ids.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // Bundles
    // -----------------------------------------------------------------------

    pub async fn load_bundle(&self, name: &str, cancel: &CancellationToken) -> DatabaseResult<()> {
        self.bundles.load_bundle(name, &self.index, cancel).await?;
        Ok(())
    }

    pub fn unload_bundle(&self, name: &str) -> DatabaseResult<()> {
        self.bundles.unload_bundle(name, &self.index)?;
        Ok(())
    }

    /// Pack objects from the primary backend into `<bundle dir>/<name>.bundle`.
    pub fn create_bundle(
        &self,
        object_ids: &[ObjectId],
        bundle_name: &str,
        options: &BundleOptions,
    ) -> DatabaseResult<BundleReport> {
        let path = self.bundles.bundle_path(bundle_name);
        let report = cairn_bundle::create_bundle(&path, self.primary.as_ref(), object_ids, options)?;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Blobs
    // -----------------------------------------------------------------------

    /// Cache `data` as a blob, writing it to the write backend unless it is
    /// already cached.
    pub fn create_blob(&self, data: &[u8]) -> DatabaseResult<Blob> {
        let id = ObjectId::from_bytes(data);
        let mut entries = self.blobs.lock();
        if let Some(blob) = self.blobs.acquire(&mut entries, &id) {
            return Ok(blob);
        }
        let mut source = data;
        self.writer()?
            .write(id, &mut source, data.len() as u64, false)?;
        Ok(self.blobs.insert(&mut entries, id, Bytes::copy_from_slice(data)))
    }

    /// Cached blob for `id`, reading it into the cache on first use. `None`
    /// when no layer holds the object.
    pub fn lookup_blob(&self, id: &ObjectId) -> DatabaseResult<Option<Blob>> {
        let mut entries = self.blobs.lock();
        if let Some(blob) = self.blobs.acquire(&mut entries, id) {
            return Ok(Some(blob));
        }
        let Some(mut reader) = self.try_open_read(id)? else {
            return Ok(None);
        };
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        Ok(Some(self.blobs.insert(&mut entries, *id, Bytes::from(content))))
    }

    /// Read an object, served from the blob cache when `check_cache` is set
    /// and the blob is cached. Never populates the cache.
    pub fn read(&self, id: &ObjectId, check_cache: bool) -> DatabaseResult<ObjectStream> {
        if check_cache {
            let cached = {
                let mut entries = self.blobs.lock();
                self.blobs.acquire(&mut entries, id)
            };
            if let Some(blob) = cached {
                return Ok(ObjectStream::Blob(BlobReader::new(blob)));
            }
        }
        self.open_stream(id, OpenMode::Open, FileAccess::Read)
    }
}

impl std::fmt::Debug for ObjectDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDatabase")
            .field("bundles", &self.bundles)
            .field("overflow", &self.overflow.is_some())
            .field("write_slot", &self.write_slot)
            .field("blobs", &self.blobs)
            .finish()
    }
}
