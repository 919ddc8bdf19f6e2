//! On-disk index file: one JSON record per line, appended on every mutation.
//!
//! ```text
//! {"name":"textures/grass","id":"3f1c…"}
//! {"name":"meshes/tree","id":"a90b…"}
//! ```
//!
//! Later lines override earlier lines with the same name. Malformed lines
//! (for instance a torn tail after a crash) are skipped.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use cairn_types::ObjectId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IndexError, IndexResult};

/// One line of the index file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub name: String,
    pub id: ObjectId,
}

impl IndexRecord {
    pub fn new(name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// Read every valid record of an index file. A missing file reads as empty.
pub(crate) fn read_records(path: &Path) -> IndexResult<BTreeMap<String, ObjectId>> {
    let mut entries = BTreeMap::new();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(io_error(path, e)),
    };

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| io_error(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IndexRecord>(&line) {
            Ok(record) => {
                entries.insert(record.name, record.id);
            }
            Err(e) => {
                warn!(path = %path.display(), line = line_no + 1, error = %e, "skipping malformed index record");
            }
        }
    }

    debug!(path = %path.display(), entries = entries.len(), "index file loaded");
    Ok(entries)
}

/// Append-only writer for an index file.
#[derive(Debug)]
pub(crate) struct IndexFile {
    path: PathBuf,
    handle: Option<File>,
}

impl IndexFile {
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            handle: None,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk before returning.
    pub(crate) fn append(&mut self, record: &IndexRecord) -> IndexResult<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        line.push('\n');

        if self.handle.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_error(&self.path, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| io_error(&self.path, e))?;
            self.handle = Some(file);
        }

        let path = self.path.clone();
        if let Some(file) = self.handle.as_mut() {
            file.write_all(line.as_bytes())
                .map_err(|e| io_error(&path, e))?;
            file.sync_data().map_err(|e| io_error(&path, e))?;
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: io::Error) -> IndexError {
    IndexError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = read_records(&dir.path().join("nope")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("index");
        let mut file = IndexFile::new(&path);

        let a = ObjectId::from_bytes(b"a");
        let b = ObjectId::from_bytes(b"b");
        file.append(&IndexRecord::new("alpha", a)).unwrap();
        file.append(&IndexRecord::new("beta", b)).unwrap();
        file.append(&IndexRecord::new("alpha", b)).unwrap();

        let entries = read_records(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["alpha"], b, "later line must win");
        assert_eq!(entries["beta"], b);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let id = ObjectId::from_bytes(b"ok");
        let good = serde_json::to_string(&IndexRecord::new("ok", id)).unwrap();
        std::fs::write(&path, format!("{good}\n{{\"name\":\"torn\",\"id\":\"ab\n\n")).unwrap();

        let entries = read_records(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["ok"], id);
    }
}
