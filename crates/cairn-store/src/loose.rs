//! One file per object, fanned out by the first byte of the id.
//!
//! ```text
//! <root>/
//!   index                 name → id records (see cairn-index)
//!   3f/1c09…              object 3f1c09…
//!   a9/0b7e…              object a90b7e…
//! ```

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_index::ContentIndexMap;
use cairn_types::object::OBJECT_ID_HEX_LEN;
use cairn_types::{HashingReader, ObjectId};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::stream::{ObjectReader, ObjectWriter, OpenMode};
use crate::traits::Backend;

/// Number of hex characters used for the fan-out directory.
const FAN_OUT_HEX: usize = 2;

/// Prefix of in-flight temporary files; never a valid id.
const TEMP_PREFIX: &str = ".tmp";

/// Backend storing each object as an individual file.
#[derive(Debug)]
pub struct LooseFileBackend {
    root: PathBuf,
    read_only: bool,
    index: Arc<ContentIndexMap>,
}

impl LooseFileBackend {
    /// Open a loose object directory, loading its index slice from
    /// `<root>/<index_name>`. Writable backends create the root if needed;
    /// read-only backends never touch the filesystem.
    pub fn open(root: impl AsRef<Path>, index_name: &str, read_only: bool) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !read_only {
            fs::create_dir_all(&root)?;
        }
        let index = ContentIndexMap::load(&root.join(index_name), read_only)?;
        debug!(root = %root.display(), read_only, names = index.len(), "loose backend opened");
        Ok(Self {
            root,
            read_only,
            index: Arc::new(index),
        })
    }

    /// Root directory of the backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an object is (or would be) stored at.
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..FAN_OUT_HEX]).join(&hex[FAN_OUT_HEX..])
    }

    fn parse_object_path(dir: &str, file: &str) -> Option<ObjectId> {
        if dir.len() != FAN_OUT_HEX || dir.len() + file.len() != OBJECT_ID_HEX_LEN {
            return None;
        }
        let hex = format!("{dir}{file}");
        if hex.bytes().any(|b| b.is_ascii_uppercase()) {
            return None;
        }
        ObjectId::from_hex(&hex).ok()
    }
}

fn is_fan_out(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| {
        n.len() == FAN_OUT_HEX && n.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    })
}

fn not_found_as(id: &ObjectId, e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(*id)
    } else {
        StoreError::Io(e)
    }
}

impl Backend for LooseFileBackend {
    fn exists(&self, id: &ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    fn size(&self, id: &ObjectId) -> StoreResult<u64> {
        let meta = fs::metadata(self.object_path(id)).map_err(|e| not_found_as(id, e))?;
        Ok(meta.len())
    }

    fn open_read(&self, id: &ObjectId) -> StoreResult<ObjectReader> {
        let file = File::open(self.object_path(id)).map_err(|e| not_found_as(id, e))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, id: &ObjectId, mode: OpenMode) -> StoreResult<ObjectWriter> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let path = self.object_path(id);
        if mode.may_create() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = mode
            .to_open_options()
            .open(&path)
            .map_err(|e| not_found_as(id, e))?;
        if mode == OpenMode::Append {
            file.seek(SeekFrom::End(0))?;
        }
        debug!(id = %id.short_hex(), ?mode, "loose object opened for writing");
        Ok(Box::new(file))
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
            debug!(id = %id.short_hex(), "object already present; write skipped");
            return Ok(id);
        }

        // Stream into a temp file next to the objects so the final rename
        // stays on one filesystem.
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.root)?;
        let mut reader = HashingReader::new(source.take(size));
        let copied = io::copy(&mut reader, &mut temp)?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended after {copied} of {size} bytes"),
            )
            .into());
        }

        let computed = reader.object_id();
        if !id.is_null() && id != computed {
            return Err(StoreError::HashMismatch {
                expected: id,
                computed,
            });
        }

        let path = self.object_path(&computed);
        if !force_write && path.is_file() {
            debug!(id = %computed.short_hex(), "object already present; temp discarded");
            return Ok(computed);
        }

        temp.as_file().sync_all()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        temp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        debug!(id = %computed.short_hex(), size, "loose object written");
        Ok(computed)
    }

    fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        fs::remove_file(self.object_path(id)).map_err(|e| not_found_as(id, e))?;
        debug!(id = %id.short_hex(), "loose object deleted");
        Ok(())
    }

    fn enumerate(&self) -> StoreResult<Vec<ObjectId>> {
        let mut ids = Vec::new();
        if !self.root.is_dir() {
            return Ok(ids);
        }

        // Only fan-out directories hold objects; siblings such as a bundle
        // directory are not walked.
        let walker = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || !e.file_type().is_dir() || is_fan_out(e.file_name()));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                // Objects deleted while we walk are simply not reported.
                Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                    continue
                }
                Err(e) => return Err(io::Error::from(e).into()),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let file = entry.file_name().to_string_lossy();
            let dir = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .map(|d| d.to_string_lossy().into_owned())
                .unwrap_or_default();
            match Self::parse_object_path(&dir, &file) {
                Some(id) => ids.push(id),
                None if file.starts_with(TEMP_PREFIX) => {}
                None => warn!(path = %entry.path().display(), "ignoring stray file in object directory"),
            }
        }

        ids.sort();
        Ok(ids)
    }

    fn file_path(&self, id: &ObjectId) -> StoreResult<PathBuf> {
        let path = self.object_path(id);
        if path.is_file() {
            Ok(path)
        } else {
            Err(StoreError::NotFound(*id))
        }
    }

    fn index_map(&self) -> Arc<ContentIndexMap> {
        Arc::clone(&self.index)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn backend(dir: &Path) -> LooseFileBackend {
        LooseFileBackend::open(dir, "index", false).unwrap()
    }

    fn read_all(backend: &dyn Backend, id: &ObjectId) -> Vec<u8> {
        let mut out = Vec::new();
        backend.open_read(id).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());

        let id = store.write_bytes(&[1, 2, 3], false).unwrap();
        assert_eq!(id, ObjectId::from_bytes(&[1, 2, 3]));
        assert!(store.exists(&id));
        assert_eq!(store.size(&id).unwrap(), 3);
        assert_eq!(read_all(&store, &id), vec![1, 2, 3]);
    }

    #[test]
    fn layout_uses_hex_fan_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let id = store.write_bytes(b"layout", false).unwrap();

        let hex = id.to_hex();
        let expected = dir.path().join(&hex[..2]).join(&hex[2..]);
        assert_eq!(store.file_path(&id).unwrap(), expected);
        assert!(expected.is_file());
    }

    #[test]
    fn rewrite_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let id = store.write_bytes(b"same", false).unwrap();
        let before = fs::metadata(store.object_path(&id)).unwrap().modified().unwrap();

        let again = store.write_bytes(b"same", false).unwrap();
        assert_eq!(id, again);
        let after = fs::metadata(store.object_path(&id)).unwrap().modified().unwrap();
        assert_eq!(before, after);
        assert_eq!(store.enumerate().unwrap(), vec![id]);
    }

    #[test]
    fn known_id_does_not_consume_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let id = store.write_bytes(b"abc", false).unwrap();

        let mut source: &[u8] = b"abc";
        assert_eq!(store.write(id, &mut source, 3, false).unwrap(), id);
        assert_eq!(source.len(), 3);
    }

    #[test]
    fn force_write_replaces_damaged_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let id = store.write_bytes(b"pristine", false).unwrap();
        fs::write(store.object_path(&id), b"damaged").unwrap();

        store.write_bytes(b"pristine", true).unwrap();
        assert_eq!(read_all(&store, &id), b"pristine");
    }

    #[test]
    fn wrong_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let claimed = ObjectId::from_bytes(b"something else");
        let mut source: &[u8] = b"actual";
        let err = store.write(claimed, &mut source, 6, false).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        assert!(!store.exists(&claimed));
    }

    #[test]
    fn short_source_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let mut source: &[u8] = b"ab";
        let err = store.write(ObjectId::NULL, &mut source, 10, false).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.enumerate().unwrap().is_empty());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty(), "temp file must be cleaned up");
    }

    #[test]
    fn missing_object_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let id = ObjectId::from_bytes(b"missing");
        assert!(!store.exists(&id));
        assert!(matches!(store.size(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.open_read(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.file_path(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.open_write(&id, OpenMode::Open),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn delete_removes_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let id = store.write_bytes(b"bye", false).unwrap();
        store.delete(&id).unwrap();
        assert!(!store.exists(&id));
    }

    #[test]
    fn read_only_backend_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let id = backend(dir.path()).write_bytes(b"frozen", false).unwrap();

        let store = LooseFileBackend::open(dir.path(), "index", true).unwrap();
        assert!(store.is_read_only());
        assert_eq!(read_all(&store, &id), b"frozen");
        assert!(matches!(store.write_bytes(b"new", false), Err(StoreError::ReadOnly)));
        assert!(matches!(store.delete(&id), Err(StoreError::ReadOnly)));
        assert!(matches!(
            store.open_write(&id, OpenMode::Append),
            Err(StoreError::ReadOnly)
        ));
        assert!(store.index_map().is_read_only());
    }

    #[test]
    fn read_only_backend_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("absent");
        let store = LooseFileBackend::open(&root, "index", true).unwrap();
        assert!(store.enumerate().unwrap().is_empty());
        assert!(!root.exists());
    }

    #[test]
    fn enumerate_skips_index_and_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let a = store.write_bytes(b"a", false).unwrap();
        let b = store.write_bytes(b"b", false).unwrap();
        store.index_map().insert("name", a).unwrap();
        fs::create_dir_all(dir.path().join("ab")).unwrap();
        fs::write(dir.path().join("ab").join("not-an-object"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("bundles")).unwrap();
        fs::write(dir.path().join("bundles").join("default.bundle"), b"x").unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.enumerate().unwrap(), expected);
    }

    #[test]
    fn open_write_append_extends_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(dir.path());
        let id = ObjectId::from_bytes(b"mutable slot");

        {
            let mut w = store.open_write(&id, OpenMode::Create).unwrap();
            w.write_all(b"head").unwrap();
        }
        {
            let mut w = store.open_write(&id, OpenMode::Append).unwrap();
            w.write_all(b"-tail").unwrap();
        }
        assert_eq!(read_all(&store, &id), b"head-tail");
    }

    #[test]
    fn index_slice_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = backend(dir.path());
            let id = store.write_bytes(b"named", false).unwrap();
            store.index_map().insert("assets/named", id).unwrap();
            id
        };
        let store = backend(dir.path());
        assert_eq!(store.index_map().get("assets/named"), Some(id));
    }

    #[test]
    fn concurrent_writers_of_same_content_agree() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(backend(dir.path()));
        let data = vec![0xEEu8; 64 * 1024];

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let data = data.clone();
                std::thread::spawn(move || store.write_bytes(&data, false).unwrap())
            })
            .collect();
        let ids: Vec<ObjectId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(read_all(store.as_ref(), &ids[0]), data);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]
        #[test]
        fn any_buffer_roundtrips(data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..2048)) {
            let dir = tempfile::tempdir().unwrap();
            let store = backend(dir.path());
            let id = store.write_bytes(&data, false).unwrap();
            proptest::prop_assert_eq!(read_all(&store, &id), data);
        }
    }
}
