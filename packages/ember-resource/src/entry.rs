//! Resource bookkeeping records
//!
//! Three records describe every known resource: the generic entry (path and
//! usage metadata), the typed entry view (per-type container bindings) and
//! the container holding the deserialized payload. Usages contribute
//! refcounts, operations track in-flight loads and delayed additions debounce
//! filesystem churn.

use crate::error::{ResourceError, Result};
use crate::serial::string_registry::StringRegistry;
use crate::serial::BinaryReader;
use crate::vfs::ReadSeek;
use ember_reflect::{Name, StructType};
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identifier of a generic/typed entry pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u32);

impl EntryId {
    pub const INVALID: EntryId = EntryId(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Identifier of a resource container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub u32);

impl ContainerId {
    pub const INVALID: ContainerId = ContainerId(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Identifier of one usage record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageId(pub u64);

/// Stable hash for watcher-event matching against entry paths
pub fn path_hash(path: &Path) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    path.hash(&mut hasher);
    hasher.finish()
}

/// One record per known resource file
#[derive(Debug, Clone)]
pub struct GenericEntry {
    pub entry_id: EntryId,
    pub type_name: Name,
    pub name: Name,
    pub usage_counter: u32,
    /// Debounce deadline set by Modified watcher events
    pub reload_after_ns: Option<u64>,
    /// Set when the backing file disappeared from the filesystem
    pub removal_mark: bool,
    pub path: PathBuf,
    pub path_hash: u64,
}

/// Per-type view of an entry: container bindings and string registry
#[derive(Clone)]
pub struct TypedEntry {
    pub entry_id: EntryId,
    pub name: Name,
    pub loaded_container_id: ContainerId,
    pub loading_container_id: ContainerId,
    pub bound_string_registry: Option<Arc<StringRegistry>>,
}

impl TypedEntry {
    pub fn new(entry_id: EntryId, name: Name, registry: Option<Arc<StringRegistry>>) -> Self {
        Self {
            entry_id,
            name,
            loaded_container_id: ContainerId::INVALID,
            loading_container_id: ContainerId::INVALID,
            bound_string_registry: registry,
        }
    }
}

/// Heap buffer aligned for a reflected struct payload
#[derive(Debug)]
pub struct AlignedBuf {
    data: *mut u8,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned; all access goes through &/&mut self.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer sized and aligned for `struct_type`
    ///
    /// Registration validates descriptors, but a struct can still reach this
    /// crate through a bad codegen path; an unusable layout surfaces as an
    /// error rather than tearing down the serve worker.
    pub fn for_struct(struct_type: &StructType) -> Result<Self> {
        let layout = Layout::from_size_align(
            struct_type.size.max(1) as usize,
            struct_type.alignment.max(1) as usize,
        )
        .map_err(|_| {
            ResourceError::layout(format!(
                "struct {} has an unusable layout (size {}, alignment {})",
                struct_type.name, struct_type.size, struct_type.alignment
            ))
        })?;

        // SAFETY: layout has non-zero size.
        let data = unsafe { alloc_zeroed(layout) };
        if data.is_null() {
            return Err(ResourceError::layout(format!(
                "container allocation failed for struct {}",
                struct_type.name
            )));
        }

        Ok(Self { data, layout })
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: data is valid for layout.size() bytes for the buffer's life.
        unsafe { std::slice::from_raw_parts(self.data, self.layout.size()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus &mut self guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with the stored layout in for_struct.
        unsafe { dealloc(self.data, self.layout) };
    }
}

/// Aligned box holding one deserialized resource value
///
/// The payload is written by serve workers through short per-step locks; the
/// init hook runs at creation and the shutdown hook when the container is
/// destroyed.
pub struct ContainerCell {
    pub container_id: ContainerId,
    struct_type: Arc<StructType>,
    data: Mutex<AlignedBuf>,
}

impl ContainerCell {
    pub fn new(container_id: ContainerId, struct_type: Arc<StructType>) -> Result<Arc<Self>> {
        let mut buf = AlignedBuf::for_struct(&struct_type)?;
        if let Some(init) = &struct_type.init {
            init(buf.bytes_mut());
        }

        Ok(Arc::new(Self {
            container_id,
            struct_type,
            data: Mutex::new(buf),
        }))
    }

    pub fn type_name(&self) -> Name {
        self.struct_type.name
    }

    /// Read access to the stored resource bytes
    pub fn with_bytes<R>(&self, access: impl FnOnce(&[u8]) -> R) -> R {
        access(self.data.lock().bytes())
    }

    /// Write access to the stored resource bytes
    pub fn with_bytes_mut<R>(&self, access: impl FnOnce(&mut [u8]) -> R) -> R {
        access(self.data.lock().bytes_mut())
    }
}

impl Drop for ContainerCell {
    fn drop(&mut self) {
        if let Some(shutdown) = self.struct_type.shutdown.clone() {
            shutdown(self.data.get_mut().bytes_mut());
        }
    }
}

/// One refcount contribution with a load ordering priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub usage_id: UsageId,
    pub type_name: Name,
    pub name: Name,
    pub priority: u32,
}

/// In-flight load operation
pub struct LoadOperation {
    pub entry_id: EntryId,
    pub priority: u32,
    /// Cached so serving never goes back through the generic entry
    pub type_name: Name,

    pub stream: Option<Box<dyn ReadSeek>>,
    /// Registry the in-progress deserialization was started against; a swap
    /// mid-load resets the operation
    pub used_registry: Option<Arc<ember_reflect::Registry>>,
    pub reader: Option<BinaryReader>,
}

impl LoadOperation {
    pub fn new(entry_id: EntryId, type_name: Name, priority: u32) -> Self {
        Self {
            entry_id,
            priority,
            type_name,
            stream: None,
            used_registry: None,
            reader: None,
        }
    }

    /// Drop stream and reader state, returning to a fresh start
    pub fn reset_progress(&mut self) {
        self.reader = None;
        self.stream = None;
        self.used_registry = None;
    }
}

/// Debounced record for a file addition awaiting investigation
#[derive(Debug, Clone)]
pub struct DelayedAddition {
    pub path_hash: u64,
    pub path: PathBuf,
    pub investigate_after_ns: u64,
}
