use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cairn_store::{Backend, StoreError};
use cairn_types::ObjectId;
use tracing::{debug, info, warn};

use crate::error::{BundleError, BundleResult};
use crate::format::{
    read_description, validate_file, BundleDescription, BundleHeader, ObjectInfo,
    BUNDLE_EXTENSION, HEADER_LEN,
};

/// Default zstd level for bundle payloads.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Share of an incremental file's payload that must still be wanted for the
/// file to be kept.
const INCREMENTAL_REUSE_RATIO: f64 = 0.5;

/// How a bundle is packed.
#[derive(Clone, Debug)]
pub struct BundleOptions {
    /// Objects stored raw (already compressed media, for instance).
    pub no_compress: HashSet<ObjectId>,
    /// Asset names published while the bundle is loaded.
    pub index: BTreeMap<String, ObjectId>,
    /// Bundles to load before this one.
    pub dependencies: Vec<String>,
    /// Put payloads in companion files that later builds can reuse.
    pub incremental: bool,
    pub compression_level: i32,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            no_compress: HashSet::new(),
            index: BTreeMap::new(),
            dependencies: Vec::new(),
            incremental: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Outcome of [`create_bundle`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleReport {
    pub path: PathBuf,
    pub object_count: usize,
    /// Objects whose bytes were read from the source and written out.
    pub written_objects: usize,
    pub reused_incremental: Vec<ObjectId>,
    pub new_incremental: Option<ObjectId>,
    pub deleted_files: Vec<PathBuf>,
    /// The existing bundle already matched; nothing was rewritten.
    pub unchanged: bool,
}

/// Path of the incremental companion `<stem>.<hex>.bundle` of a bundle.
pub fn incremental_path(bundle_path: &Path, id: &ObjectId) -> PathBuf {
    bundle_path.with_file_name(format!(
        "{}.{}.{BUNDLE_EXTENSION}",
        bundle_stem(bundle_path),
        id.to_hex()
    ))
}

fn bundle_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_suffix(&format!(".{BUNDLE_EXTENSION}")) {
        Some(stem) => stem.to_string(),
        None => name,
    }
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Split an incremental file name into its main bundle stem and id.
pub(crate) fn split_incremental_name(file_name: &str) -> Option<(&str, ObjectId)> {
    let rest = file_name.strip_suffix(&format!(".{BUNDLE_EXTENSION}"))?;
    let (stem, hex) = rest.rsplit_once('.')?;
    if stem.is_empty() || hex.bytes().any(|b| b.is_ascii_uppercase()) {
        return None;
    }
    ObjectId::from_hex(hex).ok().map(|id| (stem, id))
}

/// Incremental companions currently on disk next to a bundle, sorted by path.
pub fn incremental_files(bundle_path: &Path) -> io::Result<Vec<(ObjectId, PathBuf)>> {
    let dir = parent_dir(bundle_path);
    let stem = bundle_stem(bundle_path);
    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some((file_stem, id)) = split_incremental_name(&name) {
            if file_stem == stem {
                found.push((id, entry.path()));
            }
        }
    }
    found.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(found)
}

/// Pack `object_ids` read from `source` into the bundle file at `path`.
///
/// Duplicate ids are packed once. Incremental files are always written before
/// the main file, every file is renamed into place only once complete, and
/// companions the new main file drops are deleted only after it is in place,
/// so a readable main file never refers to a missing companion.
pub fn create_bundle(
    path: &Path,
    source: &dyn Backend,
    object_ids: &[ObjectId],
    options: &BundleOptions,
) -> BundleResult<BundleReport> {
    if object_ids.is_empty() {
        return Err(BundleError::EmptyBundle(path.display().to_string()));
    }

    let mut seen = HashSet::with_capacity(object_ids.len());
    let ids: Vec<ObjectId> = object_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect();
    if let Some(missing) = ids.iter().find(|id| !source.exists(id)) {
        return Err(StoreError::NotFound(*missing).into());
    }
    let assets: Vec<(String, ObjectId)> = options
        .index
        .iter()
        .map(|(name, id)| (name.clone(), *id))
        .collect();

    let mut report = BundleReport {
        path: path.to_path_buf(),
        object_count: ids.len(),
        ..BundleReport::default()
    };

    fs::create_dir_all(parent_dir(path))?;
    if path.is_file() && is_unchanged(path, &ids, &assets, options) {
        info!(bundle = %path.display(), objects = ids.len(), "bundle unchanged; not rewritten");
        report.unchanged = true;
        return Ok(report);
    }

    let position: HashMap<ObjectId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut objects: Vec<(ObjectId, ObjectInfo)> =
        ids.iter().map(|id| (*id, ObjectInfo::default())).collect();
    let mut incremental_bundles = Vec::new();
    // Deleted only once the new main file is in place: until then the old
    // main file may still refer to them.
    let mut stale = Vec::new();

    for (incremental_id, incremental) in incremental_files(path)? {
        if !options.incremental {
            stale.push(incremental);
            continue;
        }
        let description = match read_description(&incremental) {
            Ok(description) => description,
            Err(e) => {
                warn!(path = %incremental.display(), error = %e, "unreadable incremental bundle");
                stale.push(incremental);
                continue;
            }
        };

        let total = description.payload_len();
        let needed: u64 = description
            .objects
            .iter()
            .filter(|(id, _)| position.contains_key(id))
            .map(|(_, info)| info.stored_len())
            .sum();
        if total == 0 || (needed as f64) < (total as f64) * INCREMENTAL_REUSE_RATIO {
            debug!(path = %incremental.display(), needed, total, "incremental bundle not worth keeping");
            stale.push(incremental);
            continue;
        }

        let file_index = incremental_bundles.len() as u32 + 1;
        for (id, info) in &description.objects {
            if let Some(&i) = position.get(id) {
                if objects[i].1.incremental_index == 0 {
                    objects[i].1 = ObjectInfo {
                        incremental_index: file_index,
                        ..*info
                    };
                }
            }
        }
        debug!(path = %incremental.display(), needed, total, "reusing incremental bundle");
        incremental_bundles.push(incremental_id);
        report.reused_incremental.push(incremental_id);
    }

    let pending: Vec<usize> = (0..objects.len())
        .filter(|&i| objects[i].1.incremental_index == 0)
        .collect();

    let mut main_payload = pending.clone();
    if options.incremental && !pending.is_empty() {
        let new_id = ObjectId::random();
        incremental_bundles.push(new_id);
        let file_index = incremental_bundles.len() as u32;

        let mut companion = BundleDescription {
            objects: pending.iter().map(|&i| (objects[i].0, ObjectInfo::default())).collect(),
            ..BundleDescription::default()
        };
        let all: Vec<usize> = (0..companion.objects.len()).collect();
        write_container(
            &incremental_path(path, &new_id),
            &mut companion,
            &all,
            source,
            options,
        )?;
        for (&i, (_, info)) in pending.iter().zip(&companion.objects) {
            objects[i].1 = ObjectInfo {
                incremental_index: file_index,
                ..*info
            };
        }
        report.new_incremental = Some(new_id);
        main_payload.clear();
    }

    let mut main = BundleDescription {
        dependencies: options.dependencies.clone(),
        incremental_bundles,
        objects,
        assets,
    };
    write_container(path, &mut main, &main_payload, source, options)?;
    for incremental in &stale {
        remove_stale(incremental, &mut report)?;
    }

    report.written_objects = pending.len();
    info!(
        bundle = %path.display(),
        objects = report.object_count,
        written = report.written_objects,
        reused = report.reused_incremental.len(),
        "bundle created"
    );
    Ok(report)
}

fn remove_stale(path: &Path, report: &mut BundleReport) -> BundleResult<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    debug!(path = %path.display(), "stale incremental bundle deleted");
    report.deleted_files.push(path.to_path_buf());
    Ok(())
}

fn is_unchanged(
    path: &Path,
    ids: &[ObjectId],
    assets: &[(String, ObjectId)],
    options: &BundleOptions,
) -> bool {
    let existing = match read_description(path) {
        Ok(existing) => existing,
        Err(e) => {
            debug!(bundle = %path.display(), error = %e, "existing bundle unreadable; rebuilding");
            return false;
        }
    };
    if existing.dependencies != options.dependencies {
        return false;
    }

    let mut existing_assets = existing.assets.clone();
    existing_assets.sort();
    if existing_assets != assets {
        return false;
    }

    let mut existing_ids: Vec<ObjectId> = existing.object_ids().copied().collect();
    existing_ids.sort();
    let mut wanted = ids.to_vec();
    wanted.sort();
    if existing_ids != wanted {
        return false;
    }

    if existing
        .objects
        .iter()
        .any(|(id, info)| info.compressed == options.no_compress.contains(id))
    {
        return false;
    }

    if options.incremental == existing.incremental_bundles.is_empty() {
        return false;
    }
    existing
        .incremental_bundles
        .iter()
        .all(|id| validate_file(&incremental_path(path, id)).is_ok())
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write one container file: header and placeholder manifest, then the
/// payload of `payload` entries, then the final header and manifest.
fn write_container(
    path: &Path,
    description: &mut BundleDescription,
    payload: &[usize],
    source: &dyn Backend,
    options: &BundleOptions,
) -> BundleResult<()> {
    let placeholder = description.encode()?;
    let mut temp = tempfile::Builder::new()
        .prefix(".tmp")
        .suffix(".partial")
        .tempfile_in(parent_dir(path))?;

    let total_size = {
        let file = temp.as_file_mut();
        let mut out = CountingWriter {
            inner: BufWriter::new(&mut *file),
            written: 0,
        };
        out.write_all(&[0u8; HEADER_LEN])?;
        out.write_all(&placeholder)?;

        for &i in payload {
            let id = description.objects[i].0;
            let mut reader = source.open_read(&id)?;
            let start = out.written;
            let compressed = !options.no_compress.contains(&id);
            let uncompressed = if compressed {
                let mut encoder = zstd::stream::Encoder::new(&mut out, options.compression_level)
                    .map_err(|e| BundleError::Compression(e.to_string()))?;
                let n = io::copy(&mut reader, &mut encoder)?;
                encoder
                    .finish()
                    .map_err(|e| BundleError::Compression(e.to_string()))?;
                n
            } else {
                io::copy(&mut reader, &mut out)?
            };
            description.objects[i].1 = ObjectInfo {
                start_offset: start,
                end_offset: out.written,
                uncompressed_size: uncompressed,
                compressed,
                incremental_index: 0,
            };
            debug!(id = %id.short_hex(), uncompressed, stored = out.written - start, "bundle entry written");
        }

        let total_size = out.written;
        let mut buffered = out.inner;
        buffered.flush()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;

        let manifest = description.encode()?;
        if manifest.len() != placeholder.len() {
            return Err(BundleError::corrupt(path, "manifest size changed while writing"));
        }
        let header = BundleHeader {
            total_size,
            manifest_len: manifest.len() as u64,
            manifest_crc: crc32fast::hash(&manifest),
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        file.write_all(&manifest)?;
        file.sync_all()?;
        total_size
    };

    temp.persist(path).map_err(|e| BundleError::Io(e.error))?;
    debug!(path = %path.display(), total_size, entries = payload.len(), "bundle file written");
    Ok(())
}
