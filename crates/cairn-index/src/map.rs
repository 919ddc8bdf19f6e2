//! A single name → ObjectId slice.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use cairn_types::ObjectId;
use tracing::debug;

use crate::error::{IndexError, IndexResult};
use crate::file::{read_records, IndexFile, IndexRecord};

/// One name → [`ObjectId`] directory.
///
/// A slice is either writable or read-only. Writable slices backed by a file
/// append every [`insert`](Self::insert) to that file and flush it before the
/// entry becomes visible in memory. [`merge`](Self::merge) and
/// [`unmerge`](Self::unmerge) only touch the in-memory view; they are how
/// bundle names are layered in and out.
#[derive(Debug)]
pub struct ContentIndexMap {
    entries: RwLock<BTreeMap<String, ObjectId>>,
    file: Option<Mutex<IndexFile>>,
    read_only: bool,
}

impl ContentIndexMap {
    /// Empty, writable, in-memory map.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            file: None,
            read_only: false,
        }
    }

    /// Empty, read-only, in-memory map (used as a merge target).
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::new()
        }
    }

    /// Load a map from an index file. A missing file yields an empty map;
    /// writable maps create the file on their first insert.
    pub fn load(path: &Path, read_only: bool) -> IndexResult<Self> {
        let entries = read_records(path)?;
        Ok(Self {
            entries: RwLock::new(entries),
            file: Some(Mutex::new(IndexFile::new(path))),
            read_only,
        })
    }

    /// Whether [`insert`](Self::insert) is rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Path of the backing index file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.file
            .as_ref()
            .map(|f| f.lock().expect("index file lock poisoned").path().to_path_buf())
    }

    pub fn get(&self, name: &str) -> Option<ObjectId> {
        self.entries
            .read()
            .expect("index lock poisoned")
            .get(name)
            .copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("index lock poisoned")
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("index lock poisoned").is_empty()
    }

    /// Sorted snapshot of every entry.
    pub fn entries(&self) -> Vec<(String, ObjectId)> {
        self.entries
            .read()
            .expect("index lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Entries whose name starts with `prefix`, sorted by name.
    pub fn search_prefix(&self, prefix: &str) -> Vec<(String, ObjectId)> {
        self.entries
            .read()
            .expect("index lock poisoned")
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Bind `name` to `id`, persisting it first when the map is file backed.
    pub fn insert(&self, name: &str, id: ObjectId) -> IndexResult<()> {
        if self.read_only {
            return Err(IndexError::ReadOnly);
        }
        if name.is_empty() {
            return Err(IndexError::InvalidName(name.to_string()));
        }
        if let Some(file) = &self.file {
            file.lock()
                .expect("index file lock poisoned")
                .append(&IndexRecord::new(name, id))?;
        }
        self.entries
            .write()
            .expect("index lock poisoned")
            .insert(name.to_string(), id);
        debug!(name, id = %id.short_hex(), "index entry set");
        Ok(())
    }

    /// In-memory union. Entries merged later win over existing ones.
    pub fn merge<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, ObjectId)>,
    {
        let mut map = self.entries.write().expect("index lock poisoned");
        for (name, id) in entries {
            map.insert(name, id);
        }
    }

    /// Reverse a [`merge`](Self::merge): drop each name that still maps to the
    /// given id. Returns the names that were removed.
    pub fn unmerge<'a, I>(&self, entries: I) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a String, &'a ObjectId)>,
    {
        let mut map = self.entries.write().expect("index lock poisoned");
        let mut removed = Vec::new();
        for (name, id) in entries {
            if map.get(name) == Some(id) {
                map.remove(name);
                removed.push(name.clone());
            }
        }
        removed
    }

    /// Re-read the backing file, picking up records appended by other
    /// processes. In-memory merges of names absent from the file are kept.
    pub fn refresh(&self) -> IndexResult<usize> {
        let Some(file) = &self.file else {
            return Ok(0);
        };
        let path = file.lock().expect("index file lock poisoned").path().to_path_buf();
        let on_disk = read_records(&path)?;
        let mut map = self.entries.write().expect("index lock poisoned");
        let mut changed = 0;
        for (name, id) in on_disk {
            if map.get(&name) != Some(&id) {
                map.insert(name, id);
                changed += 1;
            }
        }
        Ok(changed)
    }
}

impl Default for ContentIndexMap {
    fn default() -> Self {
        Self::new()
    }
}
