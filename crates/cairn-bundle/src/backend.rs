//! Serving objects out of loaded bundles.
//!
//! Loading happens in two phases. The first reads and validates every
//! manifest the load needs (the bundle and any dependency not yet loaded)
//! without touching shared state; it is async and cancellable. The second
//! applies load counts, the resolution table and index merges under the
//! state lock in one step, so a failed or cancelled load merges nothing.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use cairn_index::{ContentIndexMap, DatabaseIndexMap};
use cairn_store::{Backend, ObjectReader, ObjectWriter, OpenMode, StoreError, StoreResult};
use cairn_types::ObjectId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BundleError, BundleResult};
use crate::format::{read_description_async, validate_file_async, BundleDescription, ObjectInfo, BUNDLE_EXTENSION};
use crate::reader::open_entry;
use crate::writer::{incremental_path, split_incremental_name};

/// Maps a bundle name to a file, or declines with `None`.
pub type BundleResolver = Box<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

/// Physical location of a bundle-resident object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectLocation {
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug)]
struct LoadedBundle {
    path: PathBuf,
    description: BundleDescription,
    /// Main file first, then incremental files in index order.
    files: Vec<PathBuf>,
    load_count: usize,
    sequence: u64,
    /// Target index clock reading when the names were merged.
    stamp: u64,
}

impl LoadedBundle {
    fn asset(&self, name: &str) -> Option<ObjectId> {
        self.description
            .assets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }
}

#[derive(Clone, Debug)]
struct Resolved {
    path: PathBuf,
    info: ObjectInfo,
}

#[derive(Debug, Default)]
struct BundleState {
    loaded: HashMap<String, LoadedBundle>,
    objects: HashMap<ObjectId, Resolved>,
    next_sequence: u64,
}

impl BundleState {
    fn publish(&mut self, bundle: &LoadedBundle) {
        for (id, info) in &bundle.description.objects {
            if let Some(path) = bundle.files.get(info.incremental_index as usize) {
                self.objects.insert(
                    *id,
                    Resolved {
                        path: path.clone(),
                        info: *info,
                    },
                );
            }
        }
    }
}

/// A bundle read and validated during the first load phase.
struct Planned {
    path: PathBuf,
    description: BundleDescription,
    files: Vec<PathBuf>,
}

/// Read-only backend over every loaded bundle.
///
/// Objects resolve through one table; when two loaded bundles carry the same
/// id, the one loaded last wins.
pub struct BundleBackend {
    directory: PathBuf,
    resolvers: RwLock<Vec<BundleResolver>>,
    state: Mutex<BundleState>,
    index: Arc<ContentIndexMap>,
}

impl BundleBackend {
    /// Backend resolving bundles from `directory`. Nothing is touched on disk.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            resolvers: RwLock::new(Vec::new()),
            state: Mutex::new(BundleState::default()),
            index: Arc::new(ContentIndexMap::read_only()),
        }
    }

    /// Like [`new`](Self::new), creating the directory if needed.
    pub fn open(directory: impl Into<PathBuf>) -> BundleResult<Self> {
        let backend = Self::new(directory);
        fs::create_dir_all(&backend.directory)?;
        Ok(backend)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Default file of a bundle name: `<directory>/<name>.bundle`.
    pub fn bundle_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.{BUNDLE_EXTENSION}"))
    }

    /// Register a resolver consulted, in registration order, before the
    /// default location.
    pub fn add_resolver<F>(&self, resolver: F)
    where
        F: Fn(&str) -> Option<PathBuf> + Send + Sync + 'static,
    {
        self.resolvers
            .write()
            .expect("lock poisoned")
            .push(Box::new(resolver));
    }

    /// Find the file backing a bundle name.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let custom = self
            .resolvers
            .read()
            .expect("lock poisoned")
            .iter()
            .find_map(|resolve| resolve(name));
        custom.or_else(|| {
            let path = self.bundle_path(name);
            path.is_file().then_some(path)
        })
    }

    /// Load a bundle and, first, every dependency it declares.
    ///
    /// Loading an already loaded bundle only bumps its load count. Names are
    /// merged into this backend's own index map and into `target`.
    pub async fn load_bundle(
        &self,
        name: &str,
        target: &DatabaseIndexMap,
        cancel: &CancellationToken,
    ) -> BundleResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(BundleError::Cancelled);
            }
            let mut plans = self.plan(name, cancel).await?;

            let applied = {
                let mut state = self.state.lock().expect("lock poisoned");
                match first_unplanned(&state, name, &plans) {
                    Some(missing) => {
                        debug!(bundle = %missing, "bundle set changed while loading; planning again");
                        false
                    }
                    None => {
                        self.apply_load(&mut state, name, &mut plans, target);
                        true
                    }
                }
            };
            if applied {
                return Ok(());
            }
        }
    }

    /// Phase one: read every manifest the load needs, without touching state.
    async fn plan(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> BundleResult<HashMap<String, Planned>> {
        let loaded: HashSet<String> = {
            let state = self.state.lock().expect("lock poisoned");
            state.loaded.keys().cloned().collect()
        };

        let mut plans = HashMap::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(next) = queue.pop_front() {
            if plans.contains_key(&next) || loaded.contains(&next) {
                continue;
            }
            let planned = cancellable(cancel, self.read_bundle(&next)).await?;
            queue.extend(planned.description.dependencies.iter().cloned());
            plans.insert(next, planned);
        }

        check_cycles(name, &plans, &mut Vec::new(), &mut HashSet::new())?;
        Ok(plans)
    }

    async fn read_bundle(&self, name: &str) -> BundleResult<Planned> {
        let path = self
            .resolve(name)
            .ok_or_else(|| BundleError::BundleNotFound(name.to_string()))?;
        let description = read_description_async(&path).await.map_err(|e| match e {
            BundleError::Io(io) if io.kind() == io::ErrorKind::NotFound => {
                BundleError::BundleNotFound(name.to_string())
            }
            other => other,
        })?;

        let mut files = vec![path.clone()];
        for id in &description.incremental_bundles {
            let incremental = incremental_path(&path, id);
            validate_file_async(&incremental).await.map_err(|e| match e {
                BundleError::Io(io) if io.kind() == io::ErrorKind::NotFound => {
                    BundleError::corrupt(&path, format!("missing incremental file {}", incremental.display()))
                }
                other => other,
            })?;
            files.push(incremental);
        }
        debug!(bundle = name, path = %path.display(), objects = description.objects.len(), "bundle manifest read");
        Ok(Planned {
            path,
            description,
            files,
        })
    }

    /// Phase two: runs under the state lock with every needed plan present.
    fn apply_load(
        &self,
        state: &mut BundleState,
        name: &str,
        plans: &mut HashMap<String, Planned>,
        target: &DatabaseIndexMap,
    ) {
        if let Some(bundle) = state.loaded.get_mut(name) {
            bundle.load_count += 1;
            debug!(bundle = name, load_count = bundle.load_count, "bundle load count raised");
            return;
        }
        let Some(plan) = plans.remove(name) else {
            return;
        };
        for dependency in &plan.description.dependencies {
            self.apply_load(state, dependency, plans, target);
        }

        let bundle = LoadedBundle {
            path: plan.path,
            description: plan.description,
            files: plan.files,
            load_count: 1,
            sequence: state.next_sequence,
            stamp: target.tick(),
        };
        state.next_sequence += 1;
        state.publish(&bundle);
        self.index.merge(bundle.description.assets.iter().cloned());
        target.merge(bundle.description.assets.iter().cloned());
        info!(
            bundle = name,
            path = %bundle.path.display(),
            objects = bundle.description.objects.len(),
            assets = bundle.description.assets.len(),
            "bundle loaded"
        );
        state.loaded.insert(name.to_string(), bundle);
    }

    /// Release one load of a bundle. When its count reaches zero its objects
    /// and names are withdrawn and its dependencies are released in turn.
    pub fn unload_bundle(&self, name: &str, target: &DatabaseIndexMap) -> BundleResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.loaded.contains_key(name) {
            return Err(BundleError::NotLoaded(name.to_string()));
        }

        let mut withdrawn = Vec::new();
        self.unload_recursive(&mut state, name, &mut withdrawn);
        if withdrawn.is_empty() {
            return Ok(());
        }

        // Ids shadowed by a removed bundle come back from the bundles still
        // loaded, in load order.
        let mut remaining: Vec<&LoadedBundle> = state.loaded.values().collect();
        remaining.sort_by_key(|b| b.sequence);
        let mut table = BundleState::default();
        for bundle in &remaining {
            table.publish(bundle);
        }

        // Only names the removed bundles still owned are touched. Each falls
        // back to the newest remaining bundle binding it, unless the target
        // was written after that bundle loaded.
        let shadowed = |name: &str| {
            remaining
                .iter()
                .rev()
                .find_map(|b| b.asset(name).map(|id| (id, b.stamp)))
        };
        for bundle in &withdrawn {
            let assets = bundle.description.assets.iter().map(|(n, id)| (n, id));
            for name in self.index.unmerge(assets.clone()) {
                if let Some((id, _)) = shadowed(&name) {
                    self.index.merge([(name, id)]);
                }
            }
            target.unmerge_with(assets, &shadowed);
        }
        state.objects = table.objects;
        Ok(())
    }

    fn unload_recursive(&self, state: &mut BundleState, name: &str, withdrawn: &mut Vec<LoadedBundle>) {
        let Some(bundle) = state.loaded.get_mut(name) else {
            warn!(bundle = name, "dependency already unloaded");
            return;
        };
        bundle.load_count -= 1;
        if bundle.load_count > 0 {
            debug!(bundle = name, load_count = bundle.load_count, "bundle load count lowered");
            return;
        }
        let Some(bundle) = state.loaded.remove(name) else {
            return;
        };
        info!(bundle = name, "bundle unloaded");

        for dependency in &bundle.description.dependencies {
            self.unload_recursive(state, dependency, withdrawn);
        }
        withdrawn.push(bundle);
    }

    /// Where a bundle-resident object is stored.
    pub fn try_get_object_location(&self, id: &ObjectId) -> Option<ObjectLocation> {
        let state = self.state.lock().expect("lock poisoned");
        state.objects.get(id).map(|r| ObjectLocation {
            path: r.path.clone(),
            start: r.info.start_offset,
            end: r.info.end_offset,
        })
    }

    /// Snapshot of the resolution table.
    pub fn object_infos(&self) -> HashMap<ObjectId, ObjectInfo> {
        let state = self.state.lock().expect("lock poisoned");
        state.objects.iter().map(|(id, r)| (*id, r.info)).collect()
    }

    /// Names of the loaded bundles, sorted.
    pub fn loaded_bundles(&self) -> Vec<String> {
        let state = self.state.lock().expect("lock poisoned");
        let mut names: Vec<String> = state.loaded.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current load count of a bundle, 0 when not loaded.
    pub fn load_count(&self, name: &str) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state.loaded.get(name).map_or(0, |b| b.load_count)
    }

    /// Delete every bundle in the directory whose main file path matches
    /// `predicate`, together with its incremental files. Returns the deleted
    /// paths.
    pub fn delete_bundles<F>(&self, predicate: F) -> BundleResult<Vec<PathBuf>>
    where
        F: Fn(&Path) -> bool,
    {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{BUNDLE_EXTENSION}");
        let mut groups: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(&suffix) {
                continue;
            }
            let main = match split_incremental_name(&name) {
                Some((stem, _)) => self.directory.join(format!("{stem}{suffix}")),
                None => entry.path(),
            };
            groups.entry(main).or_default().push(entry.path());
        }

        let mut deleted = Vec::new();
        for (main, mut files) in groups {
            if !predicate(&main) {
                continue;
            }
            files.sort();
            for file in files {
                match fs::remove_file(&file) {
                    Ok(()) => deleted.push(file),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            info!(bundle = %main.display(), "bundle deleted");
        }
        Ok(deleted)
    }

    fn resolved(&self, id: &ObjectId) -> StoreResult<Resolved> {
        let state = self.state.lock().expect("lock poisoned");
        state.objects.get(id).cloned().ok_or(StoreError::NotFound(*id))
    }
}

/// First bundle the apply phase would need but has neither loaded nor planned.
fn first_unplanned(
    state: &BundleState,
    name: &str,
    plans: &HashMap<String, Planned>,
) -> Option<String> {
    let mut visited = HashSet::new();
    let mut stack = vec![name.to_string()];
    while let Some(next) = stack.pop() {
        if state.loaded.contains_key(&next) || !visited.insert(next.clone()) {
            continue;
        }
        match plans.get(&next) {
            Some(plan) => stack.extend(plan.description.dependencies.iter().cloned()),
            None => return Some(next),
        }
    }
    None
}

fn check_cycles(
    name: &str,
    plans: &HashMap<String, Planned>,
    chain: &mut Vec<String>,
    done: &mut HashSet<String>,
) -> BundleResult<()> {
    if let Some(start) = chain.iter().position(|n| n == name) {
        let mut cycle = chain[start..].to_vec();
        cycle.push(name.to_string());
        return Err(BundleError::CyclicDependency(cycle.join(" -> ")));
    }
    if done.contains(name) {
        return Ok(());
    }
    let Some(plan) = plans.get(name) else {
        return Ok(());
    };
    chain.push(name.to_string());
    for dependency in &plan.description.dependencies {
        check_cycles(dependency, plans, chain, done)?;
    }
    chain.pop();
    done.insert(name.to_string());
    Ok(())
}

async fn cancellable<T, F>(cancel: &CancellationToken, work: F) -> BundleResult<T>
where
    F: Future<Output = BundleResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BundleError::Cancelled),
        result = work => result,
    }
}

impl Backend for BundleBackend {
    fn exists(&self, id: &ObjectId) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .objects
            .contains_key(id)
    }

    fn size(&self, id: &ObjectId) -> StoreResult<u64> {
        Ok(self.resolved(id)?.info.uncompressed_size)
    }

    fn open_read(&self, id: &ObjectId) -> StoreResult<ObjectReader> {
        let resolved = self.resolved(id)?;
        debug!(id = %id.short_hex(), path = %resolved.path.display(), "reading bundle entry");
        Ok(open_entry(&resolved.path, &resolved.info)?)
    }

    fn open_write(&self, _id: &ObjectId, _mode: OpenMode) -> StoreResult<ObjectWriter> {
        Err(StoreError::ReadOnly)
    }

    fn write(
        &self,
        _id: ObjectId,
        _source: &mut dyn io::Read,
        _size: u64,
        _force_write: bool,
    ) -> StoreResult<ObjectId> {
        Err(StoreError::ReadOnly)
    }

    fn delete(&self, _id: &ObjectId) -> StoreResult<()> {
        Err(StoreError::ReadOnly)
    }

    fn enumerate(&self) -> StoreResult<Vec<ObjectId>> {
        let state = self.state.lock().expect("lock poisoned");
        let mut ids: Vec<ObjectId> = state.objects.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn index_map(&self) -> Arc<ContentIndexMap> {
        Arc::clone(&self.index)
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for BundleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleBackend")
            .field("directory", &self.directory)
            .field("loaded", &self.loaded_bundles())
            .finish()
    }
}
