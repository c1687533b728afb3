//! Resource provider core (component F)
//!
//! Owns entry bookkeeping and drives the concurrent load pipeline:
//!
//! 1. First `execute` scans the resource directory (index-driven or by type
//!    headers) and arms the VFS watcher when hot reload is possible.
//! 2. Every `execute` drains watcher events into debounce records, promotes
//!    expired records, applies usage refcount events, then dispatches one
//!    serve worker per core against a shared priority-ordered operation
//!    cursor until the frame budget runs out.
//!
//! Workers only share the operation queue (behind a short lock) and the
//! per-type interface tables; everything else is single-threaded inside
//! `execute`.

use crate::clock::{Clock, MonotonicClock};
use crate::config::ProviderConfig;
use crate::entry::{
    path_hash, ContainerCell, ContainerId, DelayedAddition, EntryId, GenericEntry, LoadOperation,
    ResourceUsage, TypedEntry, UsageId,
};
use crate::error::ResourceError;
use crate::events::{
    ResourceLoadedEvent, ResourceRegisteredEvent, ResourceUpdatedEvent, UsageEvent, UsageEventKind,
};
use crate::generator::TypeInterface;
use crate::hot_reload::ReloadCoordinator;
use crate::serial::{
    read_type_header, BinaryReader, ReadState, ResourceIndex, ScriptStorage, StringRegistry,
    RESOURCE_EXTENSION, RESOURCE_INDEX_FILE, RESOURCE_INDEX_STRING_REGISTRY_FILE,
};
use crate::vfs::{Vfs, VfsEventKind, VfsWatcher};
use ember_reflect::{Name, Registry};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outcome of serving one operation within the frame budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeStatus {
    InProgress,
    Finished,
    Failed,
}

/// State shared by serve workers for one dispatch
struct ServeShared {
    /// Operations sorted ascending by priority; pop takes the highest
    queue: Mutex<Vec<LoadOperation>>,
    /// Operations that ran out of budget and resume next frame
    requeue: Mutex<Vec<LoadOperation>>,
    deadline_ns: u64,
}

/// Snapshot of one entry's bookkeeping, exposed for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryState {
    pub usage_count: u32,
    pub loaded_container: ContainerId,
    pub loading_container: ContainerId,
    pub has_operation: bool,
    pub removal_marked: bool,
    pub reload_pending: bool,
}

/// Hot-reloadable resource provider
pub struct ResourceProvider {
    config: ProviderConfig,
    registry: Arc<Registry>,
    script_storage: Arc<ScriptStorage>,
    vfs: Arc<dyn Vfs>,
    clock: Arc<dyn Clock>,
    coordinator: Option<Arc<dyn ReloadCoordinator>>,

    scan_done: bool,
    usage_id_counter: AtomicU64,
    entry_id_counter: u32,
    container_id_counter: AtomicU32,

    watcher: Option<Mutex<Box<dyn VfsWatcher>>>,
    string_registries: Vec<Arc<StringRegistry>>,

    entries: FxHashMap<EntryId, GenericEntry>,
    entries_by_name: FxHashMap<Name, Vec<EntryId>>,

    usages: FxHashMap<UsageId, ResourceUsage>,
    usages_by_key: FxHashMap<(Name, Name), Vec<UsageId>>,

    operations: FxHashMap<EntryId, LoadOperation>,
    delayed_additions: Vec<DelayedAddition>,

    interfaces: Vec<TypeInterface>,
    interface_index: FxHashMap<Name, usize>,

    usage_events: VecDeque<UsageEvent>,
    updated_events: Vec<ResourceUpdatedEvent>,
}

impl ResourceProvider {
    pub fn new(config: ProviderConfig, registry: Arc<Registry>, vfs: Arc<dyn Vfs>) -> Self {
        let interfaces = TypeInterface::collect(&registry);
        let interface_index = interfaces
            .iter()
            .enumerate()
            .map(|(slot, interface)| (interface.type_name, slot))
            .collect();

        Self {
            script_storage: ScriptStorage::new(registry.clone()),
            config,
            registry,
            vfs,
            clock: Arc::new(MonotonicClock::new()),
            coordinator: None,
            scan_done: false,
            usage_id_counter: AtomicU64::new(0),
            entry_id_counter: 0,
            container_id_counter: AtomicU32::new(0),
            watcher: None,
            string_registries: Vec::new(),
            entries: FxHashMap::default(),
            entries_by_name: FxHashMap::default(),
            usages: FxHashMap::default(),
            usages_by_key: FxHashMap::default(),
            operations: FxHashMap::default(),
            delayed_additions: Vec::new(),
            interfaces,
            interface_index,
            usage_events: VecDeque::new(),
            updated_events: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<dyn ReloadCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn scan_done(&self) -> bool {
        self.scan_done
    }

    /// String registries loaded from directory indexes during scanning
    pub fn loaded_string_registries(&self) -> &[Arc<StringRegistry>] {
        &self.string_registries
    }

    // ------------------------------------------------------------------
    // Usage surface
    // ------------------------------------------------------------------

    /// Add a refcount contribution; the matching load is scheduled during the
    /// next `execute`
    pub fn add_usage(&mut self, type_name: Name, name: Name, priority: u32) -> UsageId {
        let usage_id = UsageId(self.usage_id_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let usage = ResourceUsage {
            usage_id,
            type_name,
            name,
            priority,
        };

        self.usages.insert(usage_id, usage);
        self.usages_by_key
            .entry((type_name, name))
            .or_default()
            .push(usage_id);
        self.usage_events.push_back(UsageEvent {
            kind: UsageEventKind::Insert,
            type_name,
            name,
        });
        usage_id
    }

    /// Remove a previously added usage
    pub fn remove_usage(&mut self, usage_id: UsageId) -> bool {
        let Some(usage) = self.usages.remove(&usage_id) else {
            return false;
        };

        if let Some(bucket) = self.usages_by_key.get_mut(&(usage.type_name, usage.name)) {
            bucket.retain(|&candidate| candidate != usage_id);
        }

        self.usage_events.push_back(UsageEvent {
            kind: UsageEventKind::Delete,
            type_name: usage.type_name,
            name: usage.name,
        });
        true
    }

    // ------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------

    pub fn entry_state(&self, type_name: Name, name: Name) -> Option<EntryState> {
        let entry_id = self.find_entry(type_name, name)?;
        let entry = &self.entries[&entry_id];
        let interface = self.interface(type_name)?;

        let (loaded, loading) = interface.with_state(|state| {
            state
                .typed_entries
                .get(&entry_id)
                .map(|typed| (typed.loaded_container_id, typed.loading_container_id))
                .unwrap_or((ContainerId::INVALID, ContainerId::INVALID))
        });

        Some(EntryState {
            usage_count: entry.usage_counter,
            loaded_container: loaded,
            loading_container: loading,
            has_operation: self.operations.contains_key(&entry_id),
            removal_marked: entry.removal_mark,
            reload_pending: entry.reload_after_ns.is_some(),
        })
    }

    /// Run `access` against the loaded resource bytes, if any
    pub fn with_loaded<R>(
        &self,
        type_name: Name,
        name: Name,
        access: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        let entry_id = self.find_entry(type_name, name)?;
        let interface = self.interface(type_name)?;

        let container = interface.with_state(|state| {
            let typed = state.typed_entries.get(&entry_id)?;
            if !typed.loaded_container_id.is_valid() {
                return None;
            }
            state.containers.get(&typed.loaded_container_id).cloned()
        })?;

        Some(container.with_bytes(access))
    }

    pub fn drain_updated_events(&mut self) -> Vec<ResourceUpdatedEvent> {
        std::mem::take(&mut self.updated_events)
    }

    pub fn drain_registered_events(&self, type_name: Name) -> Vec<ResourceRegisteredEvent> {
        self.interface(type_name)
            .map(|interface| interface.with_state(|state| std::mem::take(&mut state.registered_events)))
            .unwrap_or_default()
    }

    pub fn drain_loaded_events(&self, type_name: Name) -> Vec<ResourceLoadedEvent> {
        self.interface(type_name)
            .map(|interface| interface.with_state(|state| std::mem::take(&mut state.loaded_events)))
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Frame execution
    // ------------------------------------------------------------------

    /// One provider frame: scan, watcher drain, debounce promotion, usage
    /// accounting, budgeted parallel serve
    pub fn execute(&mut self) {
        if !self.scan_done {
            let root = self.config.resource_directory.clone();
            self.scan_directory(&root);

            if self.coordinator.is_some() {
                match self.vfs.watch(&root) {
                    Ok(watcher) => self.watcher = Some(Mutex::new(watcher)),
                    Err(problem) => {
                        warn!(%problem, "failed to create resource watcher, hot reload disabled")
                    }
                }
            }

            self.scan_done = true;
        }

        // The scan frame is special; budget accounting starts afterwards.
        let frame_begin_ns = self.clock.now_ns();

        if self.watcher.is_some() {
            let events = self
                .watcher
                .as_ref()
                .map(|watcher| watcher.lock().drain())
                .unwrap_or_default();
            for event in events {
                if event.path.extension().and_then(|e| e.to_str()) != Some(RESOURCE_EXTENSION) {
                    continue;
                }

                match event.kind {
                    VfsEventKind::Added => self.process_file_added(event.path),
                    VfsEventKind::Modified => self.process_file_modified(&event.path),
                    VfsEventKind::Removed => self.process_file_removed(&event.path),
                }
            }

            if self
                .coordinator
                .as_ref()
                .is_some_and(|coordinator| coordinator.is_reload_allowed())
            {
                self.process_delayed_additions();
                self.process_delayed_modifications();
            }
        }

        while let Some(event) = self.usage_events.pop_front() {
            match event.kind {
                UsageEventKind::Insert => self.process_usage_insert(event.type_name, event.name),
                UsageEventKind::Delete => self.process_usage_delete(event.type_name, event.name),
            }
        }

        if self
            .coordinator
            .as_ref()
            .is_some_and(|coordinator| coordinator.is_executing())
        {
            // Hot reload is draining; new operations would only delay it.
            return;
        }

        self.dispatch_serve(frame_begin_ns);
    }

    // ------------------------------------------------------------------
    // Scan
    // ------------------------------------------------------------------

    fn scan_directory(&mut self, directory: &Path) {
        if self.load_directory_index(directory) {
            return;
        }

        let listing = match self.vfs.read_dir(directory) {
            Ok(listing) => listing,
            Err(problem) => {
                error!(path = %directory.display(), %problem, "failed to list resource directory");
                return;
            }
        };

        for child in listing {
            if child.is_directory {
                self.scan_directory(&child.path);
            } else if child.path.extension().and_then(|e| e.to_str()) == Some(RESOURCE_EXTENSION) {
                self.scan_file(&child.path);
            } else {
                debug!(path = %child.path.display(), "skipping non-binary entry during scan");
            }
        }
    }

    /// Returns true when the directory is index-driven (the recursion stops)
    fn load_directory_index(&mut self, directory: &Path) -> bool {
        let index_path = directory.join(RESOURCE_INDEX_FILE);
        if !self.vfs.exists(&index_path) {
            return false;
        }

        let registry_path = directory.join(RESOURCE_INDEX_STRING_REGISTRY_FILE);
        let string_registry = if self.vfs.exists(&registry_path) {
            match self
                .vfs
                .open_read(&registry_path)
                .map_err(Into::into)
                .and_then(|mut stream| StringRegistry::read(&mut stream))
            {
                Ok(loaded) => {
                    let shared = Arc::new(loaded);
                    self.string_registries.push(shared.clone());
                    Some(shared)
                }
                Err(problem) => {
                    error!(
                        path = %registry_path.display(),
                        %problem,
                        "failed to read index string registry"
                    );
                    return true;
                }
            }
        } else {
            None
        };

        let index = match self
            .vfs
            .open_read(&index_path)
            .map_err(Into::into)
            .and_then(|mut stream| ResourceIndex::read(&mut stream, string_registry.as_deref()))
        {
            Ok(index) => index,
            Err(problem) => {
                error!(path = %index_path.display(), %problem, "failed to read resource index");
                return true;
            }
        };

        for container in &index.containers {
            for item in &container.items {
                self.register_entry_checked(
                    container.type_name,
                    item.name,
                    directory.join(&item.path),
                    string_registry.clone(),
                );
            }
        }

        true
    }

    fn scan_file(&mut self, path: &Path) {
        match self.read_file_type(path) {
            Some((type_name, name)) => {
                self.register_entry_checked(type_name, name, path.to_path_buf(), None);
            }
            None => {
                error!(path = %path.display(), "failed to scan resource file");
            }
        }
    }

    /// Read the type header and derive the resource name from the file stem
    fn read_file_type(&self, path: &Path) -> Option<(Name, Name)> {
        let stem = path.file_stem().and_then(|stem| stem.to_str())?;
        let name = Name::intern(stem);

        let mut stream = match self.vfs.open_read(path) {
            Ok(stream) => stream,
            Err(problem) => {
                error!(path = %path.display(), %problem, "unable to open stream for type header");
                return None;
            }
        };

        // Non-indexed files are encoded without string registries.
        match read_type_header(&mut stream, None) {
            Ok(type_name) => Some((type_name, name)),
            Err(problem) => {
                error!(path = %path.display(), %problem, "unable to read type header");
                None
            }
        }
    }

    fn register_entry_checked(
        &mut self,
        type_name: Name,
        name: Name,
        path: PathBuf,
        string_registry: Option<Arc<StringRegistry>>,
    ) {
        let duplicate = self
            .entries_by_name
            .get(&name)
            .into_iter()
            .flatten()
            .any(|id| self.entries[id].type_name == type_name);

        if duplicate {
            error!(
                name = %name,
                type_name = %type_name,
                path = %path.display(),
                "failed to insert entry due to name collision"
            );
            return;
        }

        self.register_entry(type_name, name, path, string_registry);
    }

    fn register_entry(
        &mut self,
        type_name: Name,
        name: Name,
        path: PathBuf,
        string_registry: Option<Arc<StringRegistry>>,
    ) -> EntryId {
        let Some(slot) = self.interface_index.get(&type_name).copied() else {
            error!(
                name = %name,
                type_name = %type_name,
                path = %path.display(),
                "not a known resource type, check meta"
            );
            return EntryId::INVALID;
        };

        self.entry_id_counter += 1;
        let entry_id = EntryId(self.entry_id_counter);

        self.interfaces[slot].with_state(|state| {
            state
                .typed_entries
                .insert(entry_id, TypedEntry::new(entry_id, name, string_registry));
            state
                .registered_events
                .push(ResourceRegisteredEvent { entry_id, name });
        });

        let hash = path_hash(&path);
        self.entries.insert(
            entry_id,
            GenericEntry {
                entry_id,
                type_name,
                name,
                usage_counter: 0,
                reload_after_ns: None,
                removal_mark: false,
                path,
                path_hash: hash,
            },
        );
        self.entries_by_name.entry(name).or_default().push(entry_id);
        entry_id
    }

    // ------------------------------------------------------------------
    // Watcher events and debouncing
    // ------------------------------------------------------------------

    fn change_wait_ns(&self) -> u64 {
        self.coordinator
            .as_ref()
            .map(|coordinator| coordinator.change_wait_ns())
            .unwrap_or(0)
    }

    fn find_entry_by_path(&self, path: &Path) -> Option<EntryId> {
        let hash = path_hash(path);
        self.entries
            .values()
            .find(|entry| entry.path_hash == hash && entry.path == path)
            .map(|entry| entry.entry_id)
    }

    fn process_file_added(&mut self, path: PathBuf) {
        let investigate_after_ns = self.clock.now_ns() + self.change_wait_ns();
        self.delayed_additions.push(DelayedAddition {
            path_hash: path_hash(&path),
            path,
            investigate_after_ns,
        });
    }

    fn process_file_modified(&mut self, path: &Path) {
        let reload_after_ns = self.clock.now_ns() + self.change_wait_ns();

        if let Some(entry_id) = self.find_entry_by_path(path) {
            let entry = self.entries.get_mut(&entry_id).expect("entry just found");
            debug_assert!(!entry.removal_mark);
            entry.reload_after_ns = Some(reload_after_ns);

            self.updated_events.push(ResourceUpdatedEvent {
                entry_id,
                type_name: entry.type_name,
                name: entry.name,
            });
            return;
        }

        let hash = path_hash(path);
        if let Some(delayed) = self
            .delayed_additions
            .iter_mut()
            .find(|delayed| delayed.path_hash == hash && delayed.path == path)
        {
            delayed.investigate_after_ns = reload_after_ns;
        }
    }

    fn process_file_removed(&mut self, path: &Path) {
        if let Some(entry_id) = self.find_entry_by_path(path) {
            self.entries
                .get_mut(&entry_id)
                .expect("entry just found")
                .removal_mark = true;
            return;
        }

        let hash = path_hash(path);
        self.delayed_additions
            .retain(|delayed| !(delayed.path_hash == hash && delayed.path == path));
    }

    fn process_delayed_additions(&mut self) {
        let now_ns = self.clock.now_ns();
        let mut due = Vec::new();
        self.delayed_additions.retain(|delayed| {
            if delayed.investigate_after_ns <= now_ns {
                due.push(delayed.clone());
                false
            } else {
                true
            }
        });

        for delayed in due {
            let Some((type_name, name)) = self.read_file_type(&delayed.path) else {
                error!(path = %delayed.path.display(), "dropping delayed addition after scan failure");
                continue;
            };

            let existing = self.find_entry(type_name, name);
            let entry_id = match existing {
                Some(entry_id) => {
                    let entry = self.entries.get_mut(&entry_id).expect("indexed entry");
                    if !entry.removal_mark {
                        error!(
                            path = %delayed.path.display(),
                            name = %name,
                            type_name = %type_name,
                            existing = %entry.path.display(),
                            "delayed addition collides with a live entry"
                        );
                        continue;
                    }

                    if entry.path != delayed.path {
                        entry.path = delayed.path.clone();
                        entry.path_hash = delayed.path_hash;
                    }
                    entry.reload_after_ns = None;
                    entry.removal_mark = false;
                    entry_id
                }
                None => {
                    let entry_id = self.register_entry(type_name, name, delayed.path.clone(), None);
                    if !entry_id.is_valid() {
                        error!(
                            path = %delayed.path.display(),
                            "dropping delayed addition after registration failure"
                        );
                        continue;
                    }

                    // A fresh entry inherits usages that were waiting for it.
                    let waiting = self
                        .usages_by_key
                        .get(&(type_name, name))
                        .map(|bucket| bucket.len() as u32)
                        .unwrap_or(0);
                    self.entries
                        .get_mut(&entry_id)
                        .expect("entry just registered")
                        .usage_counter = waiting;
                    entry_id
                }
            };

            self.reload_entry(entry_id);
        }
    }

    fn process_delayed_modifications(&mut self) {
        let now_ns = self.clock.now_ns();
        let due: Vec<EntryId> = self
            .entries
            .values()
            .filter(|entry| entry.reload_after_ns.is_some_and(|after| after <= now_ns))
            .map(|entry| entry.entry_id)
            .collect();

        for entry_id in due {
            let (path, expected_type, removal_marked) = {
                let entry = self.entries.get_mut(&entry_id).expect("due entry");
                entry.reload_after_ns = None;
                (entry.path.clone(), entry.type_name, entry.removal_mark)
            };

            if removal_marked {
                continue;
            }

            match self.read_file_type(&path) {
                Some((type_name, _)) if type_name == expected_type => {}
                Some((type_name, _)) => {
                    error!(
                        path = %path.display(),
                        expected = %expected_type,
                        found = %type_name,
                        "modified file changed its resource type"
                    );
                    continue;
                }
                None => continue,
            }

            self.reload_entry(entry_id);
        }
    }

    /// Drop any pending load and schedule a fresh one at current priority
    fn reload_entry(&mut self, entry_id: EntryId) {
        let (type_name, name, usage_counter) = {
            let entry = &self.entries[&entry_id];
            (entry.type_name, entry.name, entry.usage_counter)
        };

        if usage_counter == 0 {
            return;
        }

        self.operations.remove(&entry_id);
        if let Some(interface) = self.interface(type_name) {
            interface.with_state(|state| {
                if let Some(typed) = state.typed_entries.get_mut(&entry_id) {
                    if typed.loading_container_id.is_valid() {
                        state.containers.remove(&typed.loading_container_id);
                        typed.loading_container_id = ContainerId::INVALID;
                    }
                }
            });
        }

        let priority = self.max_usage_priority(type_name, name);
        self.operations
            .insert(entry_id, LoadOperation::new(entry_id, type_name, priority));
    }

    // ------------------------------------------------------------------
    // Usage accounting
    // ------------------------------------------------------------------

    fn find_entry(&self, type_name: Name, name: Name) -> Option<EntryId> {
        self.entries_by_name
            .get(&name)?
            .iter()
            .copied()
            .find(|entry_id| self.entries[entry_id].type_name == type_name)
    }

    fn interface(&self, type_name: Name) -> Option<&TypeInterface> {
        self.interface_index
            .get(&type_name)
            .map(|&slot| &self.interfaces[slot])
    }

    fn max_usage_priority(&self, type_name: Name, name: Name) -> u32 {
        self.usages_by_key
            .get(&(type_name, name))
            .into_iter()
            .flatten()
            .map(|usage_id| self.usages[usage_id].priority)
            .max()
            .unwrap_or(0)
    }

    fn process_usage_insert(&mut self, type_name: Name, name: Name) {
        let Some(entry_id) = self.find_entry(type_name, name) else {
            error!(
                name = %name,
                type_name = %type_name,
                "failed to add usage: entry is not found"
            );
            return;
        };

        let priority = self.max_usage_priority(type_name, name);
        let entry = self.entries.get_mut(&entry_id).expect("indexed entry");
        entry.usage_counter += 1;

        if entry.usage_counter == 1 {
            if entry.removal_mark {
                warn!(
                    name = %name,
                    type_name = %type_name,
                    "usage added, but the file is removed in the actual filesystem"
                );
            } else if entry.reload_after_ns.is_some() {
                debug!(
                    name = %name,
                    type_name = %type_name,
                    "usage added, loading delayed by a pending reload timer"
                );
            } else {
                self.operations
                    .insert(entry_id, LoadOperation::new(entry_id, type_name, priority));
            }
        } else if let Some(operation) = self.operations.get_mut(&entry_id) {
            operation.priority = priority;
        }
    }

    fn process_usage_delete(&mut self, type_name: Name, name: Name) {
        let Some(entry_id) = self.find_entry(type_name, name) else {
            return;
        };

        let remaining = {
            let entry = self.entries.get_mut(&entry_id).expect("indexed entry");
            debug_assert!(entry.usage_counter > 0);
            entry.usage_counter = entry.usage_counter.saturating_sub(1);
            entry.usage_counter
        };

        if remaining > 0 {
            let priority = self.max_usage_priority(type_name, name);
            if let Some(operation) = self.operations.get_mut(&entry_id) {
                operation.priority = priority;
            }
            return;
        }

        self.operations.remove(&entry_id);
        if let Some(interface) = self.interface(type_name) {
            interface.with_state(|state| {
                if let Some(typed) = state.typed_entries.get_mut(&entry_id) {
                    if typed.loaded_container_id.is_valid() {
                        state.containers.remove(&typed.loaded_container_id);
                        typed.loaded_container_id = ContainerId::INVALID;
                    }
                    if typed.loading_container_id.is_valid() {
                        state.containers.remove(&typed.loading_container_id);
                        typed.loading_container_id = ContainerId::INVALID;
                    }
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Serving
    // ------------------------------------------------------------------

    fn dispatch_serve(&mut self, frame_begin_ns: u64) {
        if self.operations.is_empty() {
            return;
        }

        let mut queue: Vec<LoadOperation> =
            self.operations.drain().map(|(_, operation)| operation).collect();
        // Ascending sort; ties prefer older entries so pop() serves the
        // highest priority, first registered.
        queue.sort_by_key(|operation| (operation.priority, Reverse(operation.entry_id)));

        let shared = ServeShared {
            queue: Mutex::new(queue),
            requeue: Mutex::new(Vec::new()),
            deadline_ns: frame_begin_ns + self.config.serve_budget_ns,
        };

        let workers = self.config.effective_worker_count();
        {
            let this: &ResourceProvider = self;
            rayon::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|_| this.serve_worker(&shared));
                }
            });
        }

        for operation in shared.requeue.into_inner() {
            self.operations.insert(operation.entry_id, operation);
        }
    }

    fn serve_worker(&self, shared: &ServeShared) {
        let reload_scheduled = self
            .coordinator
            .as_ref()
            .is_some_and(|coordinator| coordinator.is_scheduled());
        let mut done_any_work = false;

        loop {
            if done_any_work && self.clock.now_ns() > shared.deadline_ns {
                if reload_scheduled {
                    if let Some(coordinator) = &self.coordinator {
                        coordinator.delay();
                    }
                }
                break;
            }

            done_any_work = true;
            let Some(mut operation) = shared.queue.lock().pop() else {
                break;
            };

            match self.serve_one(&mut operation, shared.deadline_ns) {
                ServeStatus::InProgress => {
                    if reload_scheduled {
                        if let Some(coordinator) = &self.coordinator {
                            coordinator.delay();
                        }
                    }
                    shared.requeue.lock().push(operation);
                }
                ServeStatus::Finished | ServeStatus::Failed => {
                    // Operation execution is done either way; it is dropped.
                }
            }
        }
    }

    fn drop_loading_container(&self, interface: &TypeInterface, entry_id: EntryId) {
        interface.with_state(|state| {
            if let Some(typed) = state.typed_entries.get_mut(&entry_id) {
                if typed.loading_container_id.is_valid() {
                    state.containers.remove(&typed.loading_container_id);
                    typed.loading_container_id = ContainerId::INVALID;
                }
            }
        });
    }

    fn serve_one(&self, operation: &mut LoadOperation, deadline_ns: u64) -> ServeStatus {
        let Some(interface) = self.interface(operation.type_name) else {
            error!(type_name = %operation.type_name, "operation references an unknown resource type");
            return ServeStatus::Failed;
        };

        // Registry swapped mid-load: reset to a fresh start.
        if operation
            .used_registry
            .as_ref()
            .is_some_and(|used| !Arc::ptr_eq(used, &self.registry))
        {
            operation.reset_progress();
            self.drop_loading_container(interface, operation.entry_id);
        }

        let bound_registry = interface.with_state(|state| {
            state
                .typed_entries
                .get(&operation.entry_id)
                .and_then(|typed| typed.bound_string_registry.clone())
        });

        if operation.stream.is_none() && operation.reader.is_none() {
            let Some(entry) = self.entries.get(&operation.entry_id) else {
                error!("operation references a missing entry");
                return ServeStatus::Failed;
            };

            let mut stream = match self.vfs.open_read(&entry.path) {
                Ok(stream) => stream,
                Err(problem) => {
                    error!(
                        path = %entry.path.display(),
                        name = %entry.name,
                        %problem,
                        "failed to open resource stream"
                    );
                    self.drop_loading_container(interface, operation.entry_id);
                    return ServeStatus::Failed;
                }
            };

            match read_type_header(&mut stream, bound_registry.as_deref()) {
                Ok(found) if found == operation.type_name => {}
                Ok(found) => {
                    error!(
                        name = %entry.name,
                        expected = %operation.type_name,
                        found = %found,
                        "type header mismatch while loading entry"
                    );
                    self.drop_loading_container(interface, operation.entry_id);
                    return ServeStatus::Failed;
                }
                Err(problem) => {
                    error!(name = %entry.name, %problem, "failed to read type header while loading");
                    self.drop_loading_container(interface, operation.entry_id);
                    return ServeStatus::Failed;
                }
            }

            operation.stream = Some(stream);
            operation.used_registry = Some(self.registry.clone());
        }

        if operation.reader.is_none() {
            // Allocate or reuse the loading container, then point a fresh
            // reader at its payload.
            let container = interface.with_state(|state| {
                let Some(typed) = state.typed_entries.get_mut(&operation.entry_id) else {
                    return Err(ResourceError::unknown_resource_type(
                        "operation references a missing typed entry",
                    ));
                };

                if typed.loading_container_id.is_valid() {
                    return state
                        .containers
                        .get(&typed.loading_container_id)
                        .cloned()
                        .ok_or_else(|| {
                            ResourceError::layout("loading container is missing from its interface")
                        });
                }

                let container_id =
                    ContainerId(self.container_id_counter.fetch_add(1, Ordering::SeqCst) + 1);
                let container = ContainerCell::new(container_id, interface.struct_type.clone())?;
                state.containers.insert(container_id, container.clone());
                typed.loading_container_id = container_id;
                Ok(container)
            });

            let container = match container {
                Ok(container) => container,
                Err(problem) => {
                    error!(
                        type_name = %operation.type_name,
                        %problem,
                        "failed to prepare loading container"
                    );
                    self.drop_loading_container(interface, operation.entry_id);
                    return ServeStatus::Failed;
                }
            };

            let stream = operation.stream.take().expect("stream opened above");
            match BinaryReader::new(
                stream,
                self.script_storage.clone(),
                operation.type_name,
                container,
                bound_registry.clone(),
            ) {
                Ok(reader) => operation.reader = Some(reader),
                Err(problem) => {
                    error!(type_name = %operation.type_name, %problem, "failed to create reader");
                    self.drop_loading_container(interface, operation.entry_id);
                    return ServeStatus::Failed;
                }
            }
        }

        let reader = operation.reader.as_mut().expect("reader created above");
        loop {
            match reader.step() {
                ReadState::InProgress => {
                    if self.clock.now_ns() > deadline_ns {
                        return ServeStatus::InProgress;
                    }
                }
                ReadState::Finished => break,
                ReadState::Failed => {
                    self.drop_loading_container(interface, operation.entry_id);
                    return ServeStatus::Failed;
                }
            }
        }

        // Promote: the loading container becomes the loaded one.
        interface.with_state(|state| {
            if let Some(typed) = state.typed_entries.get_mut(&operation.entry_id) {
                if typed.loaded_container_id.is_valid() {
                    state.containers.remove(&typed.loaded_container_id);
                }

                typed.loaded_container_id = typed.loading_container_id;
                typed.loading_container_id = ContainerId::INVALID;
                state.loaded_events.push(ResourceLoadedEvent {
                    entry_id: operation.entry_id,
                    name: typed.name,
                });
            }
        });

        ServeStatus::Finished
    }
}
