//! The database-wide merged view over every index slice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cairn_types::ObjectId;
use tracing::debug;

use crate::error::{IndexError, IndexResult};
use crate::map::ContentIndexMap;

/// Merged name → id view owned by an object database.
///
/// Built from the slices each backend contributes (in priority order,
/// later slices shadowing earlier ones) and at most one writable slice.
/// Bundle names are layered on top with [`merge`](Self::merge) and removed
/// with [`unmerge`](Self::unmerge); a removed name falls back to whatever
/// the backend slices still say about it.
///
/// Names bound through [`insert`](Self::insert) are stamped with a logical
/// clock, so [`unmerge_with`](Self::unmerge_with) can tell whether a
/// replacement merged earlier is older or newer than the binding.
#[derive(Debug)]
pub struct DatabaseIndexMap {
    merged: ContentIndexMap,
    layers: Vec<Arc<ContentIndexMap>>,
    writable: Option<Arc<ContentIndexMap>>,
    clock: AtomicU64,
    inserted: Mutex<HashMap<String, u64>>,
}

impl DatabaseIndexMap {
    /// Build the merged view. `writable` must be read-write when present; it
    /// is merged last unless it already appears in `layers`.
    pub fn new(layers: Vec<Arc<ContentIndexMap>>, writable: Option<Arc<ContentIndexMap>>) -> Self {
        let merged = ContentIndexMap::read_only();
        for layer in &layers {
            merged.merge(layer.entries());
        }
        let writable = writable.filter(|w| !w.is_read_only());
        if let Some(w) = &writable {
            if !layers.iter().any(|l| Arc::ptr_eq(l, w)) {
                merged.merge(w.entries());
            }
        }
        Self {
            merged,
            layers,
            writable,
            clock: AtomicU64::new(0),
            inserted: Mutex::new(HashMap::new()),
        }
    }

    /// Advance the logical clock and return the new stamp. Stamps start at
    /// 1; names already on disk when the view was built count as stamp 0.
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The slice that receives name writes, if any.
    pub fn writable(&self) -> Option<&Arc<ContentIndexMap>> {
        self.writable.as_ref()
    }

    pub fn get(&self, name: &str) -> Option<ObjectId> {
        self.merged.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.merged.contains(name)
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    pub fn entries(&self) -> Vec<(String, ObjectId)> {
        self.merged.entries()
    }

    pub fn search_prefix(&self, prefix: &str) -> Vec<(String, ObjectId)> {
        self.merged.search_prefix(prefix)
    }

    /// Bind a name through the writable slice, then publish it.
    pub fn insert(&self, name: &str, id: ObjectId) -> IndexResult<()> {
        let writable = self.writable.as_ref().ok_or(IndexError::ReadOnly)?;
        writable.insert(name, id)?;
        let stamp = self.tick();
        self.inserted
            .lock()
            .expect("index lock poisoned")
            .insert(name.to_string(), stamp);
        self.merged.merge([(name.to_string(), id)]);
        Ok(())
    }

    /// Layer entries on top of the current view (last merged wins).
    pub fn merge<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, ObjectId)>,
    {
        self.merged.merge(entries);
    }

    /// Remove names that still map to the given ids, restoring any value the
    /// backend slices hold for them. Returns the removed names.
    pub fn unmerge<'a, I>(&self, entries: I) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a String, &'a ObjectId)>,
    {
        self.unmerge_with(entries, |_| None)
    }

    /// Like [`unmerge`](Self::unmerge), with `replacement` offering a stamped
    /// value for each removed name. The replacement wins over the writable
    /// slice unless the name was inserted after the replacement's stamp.
    pub fn unmerge_with<'a, I, F>(&self, entries: I, replacement: F) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a String, &'a ObjectId)>,
        F: Fn(&str) -> Option<(ObjectId, u64)>,
    {
        let removed = self.merged.unmerge(entries);
        let mut restored = 0usize;
        for name in &removed {
            if let Some(id) = self.restore_value(name, replacement(name)) {
                self.merged.merge([(name.clone(), id)]);
                restored += 1;
            }
        }
        debug!(removed = removed.len(), restored, "index entries unmerged");
        removed
    }

    fn restore_value(&self, name: &str, replacement: Option<(ObjectId, u64)>) -> Option<ObjectId> {
        let written = self.writable.as_ref().and_then(|w| w.get(name));
        match (written, replacement) {
            (Some(id), Some((_, stamp))) if self.inserted_stamp(name) > stamp => Some(id),
            (_, Some((id, _))) => Some(id),
            _ => self.base_value(name),
        }
    }

    fn inserted_stamp(&self, name: &str) -> u64 {
        self.inserted
            .lock()
            .expect("index lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn base_value(&self, name: &str) -> Option<ObjectId> {
        if let Some(id) = self.writable.as_ref().and_then(|w| w.get(name)) {
            return Some(id);
        }
        self.layers.iter().rev().find_map(|layer| layer.get(name))
    }
}

impl Default for DatabaseIndexMap {
    fn default() -> Self {
        Self::new(Vec::new(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn id(s: &str) -> ObjectId {
        ObjectId::from_bytes(s.as_bytes())
    }

    fn slice(entries: &[(&str, &str)], read_only: bool) -> Arc<ContentIndexMap> {
        let map = ContentIndexMap::new();
        map.merge(entries.iter().map(|(n, v)| (n.to_string(), id(v))));
        if read_only {
            let ro = ContentIndexMap::read_only();
            ro.merge(map.entries());
            Arc::new(ro)
        } else {
            Arc::new(map)
        }
    }

    #[test]
    fn later_layers_shadow_earlier_ones() {
        let primary = slice(&[("a", "primary"), ("b", "b")], true);
        let secondary = slice(&[("a", "secondary")], false);
        let map = DatabaseIndexMap::new(vec![primary, secondary.clone()], Some(secondary));
        assert_eq!(map.get("a"), Some(id("secondary")));
        assert_eq!(map.get("b"), Some(id("b")));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn insert_goes_through_writable_slice() {
        let writable = slice(&[], false);
        let map = DatabaseIndexMap::new(vec![writable.clone()], Some(writable.clone()));
        map.insert("new", id("new")).unwrap();
        assert_eq!(map.get("new"), Some(id("new")));
        assert_eq!(writable.get("new"), Some(id("new")));
    }

    #[test]
    fn insert_without_writable_fails() {
        let map = DatabaseIndexMap::new(vec![slice(&[], true)], None);
        assert!(matches!(map.insert("x", id("x")), Err(IndexError::ReadOnly)));
    }

    #[test]
    fn read_only_slice_is_not_accepted_as_writable() {
        let ro = slice(&[], true);
        let map = DatabaseIndexMap::new(vec![], Some(ro));
        assert!(map.writable().is_none());
    }

    #[test]
    fn unmerge_restores_backend_value() {
        let base = slice(&[("shared", "loose")], true);
        let map = DatabaseIndexMap::new(vec![base], None);

        let bundle: BTreeMap<String, ObjectId> = [
            ("shared".to_string(), id("bundled")),
            ("only-bundle".to_string(), id("ob")),
        ]
        .into_iter()
        .collect();
        map.merge(bundle.clone());
        assert_eq!(map.get("shared"), Some(id("bundled")));
        assert_eq!(map.get("only-bundle"), Some(id("ob")));

        let mut removed = map.unmerge(&bundle);
        removed.sort();
        assert_eq!(removed, ["only-bundle", "shared"]);
        assert_eq!(map.get("shared"), Some(id("loose")));
        assert!(!map.contains("only-bundle"));
    }

    #[test]
    fn replacement_respects_insert_order() {
        let writable = slice(&[], false);
        let map = DatabaseIndexMap::new(vec![writable.clone()], Some(writable));
        let older = [("x".to_string(), id("older"))];
        let newer = [("x".to_string(), id("newer"))];

        // older merged, then a user binding, then newer merged on top.
        let older_stamp = map.tick();
        map.merge(older.clone());
        map.insert("x", id("user")).unwrap();
        map.merge(newer.clone());
        assert_eq!(map.get("x"), Some(id("newer")));

        map.unmerge_with(newer.iter().map(|(n, v)| (n, v)), |_| Some((id("older"), older_stamp)));
        assert_eq!(map.get("x"), Some(id("user")));
    }

    #[test]
    fn replacement_newer_than_insert_wins() {
        let writable = slice(&[], false);
        let map = DatabaseIndexMap::new(vec![writable.clone()], Some(writable));
        let newer = [("x".to_string(), id("newer"))];

        map.insert("x", id("user")).unwrap();
        let older_stamp = map.tick();
        map.merge([("x".to_string(), id("older"))]);
        map.merge(newer.clone());

        map.unmerge_with(newer.iter().map(|(n, v)| (n, v)), |_| Some((id("older"), older_stamp)));
        assert_eq!(map.get("x"), Some(id("older")));
    }

    #[test]
    fn unmerge_skips_rebound_names() {
        let writable = slice(&[], false);
        let map = DatabaseIndexMap::new(vec![writable.clone()], Some(writable));
        let bundle = [("x".to_string(), id("bundled"))];
        map.merge(bundle.clone());
        map.insert("x", id("user")).unwrap();

        assert!(map.unmerge(bundle.iter().map(|(n, v)| (n, v))).is_empty());
        assert_eq!(map.get("x"), Some(id("user")));
    }
}
