//! ember-resource - Hot-reloadable resource provider
//!
//! Concurrent load pipeline on top of `ember-reflect`:
//! - scans a virtual filesystem for binary resource files (or a directory
//!   index), registering one entry per `(type, name)`
//! - tracks per-resource usage refcounts and schedules budgeted parallel
//!   deserialization jobs ordered by priority
//! - reacts to filesystem change events with debounced reloads
//!
//! Resource types are reflected structs marked with the `resource_type`
//! struct meta; the generator registers their typed-entry, container and
//! event companion descriptors.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod events;
pub mod generator;
pub mod hot_reload;
pub mod provider;
pub mod serial;
pub mod vfs;

pub use clock::{Clock, ManualClock, MonotonicClock, TickingClock};
pub use config::ProviderConfig;
pub use entry::{ContainerId, EntryId, ResourceUsage, UsageId};
pub use error::{ErrorKind, ResourceError, Result};
pub use events::{ResourceLoadedEvent, ResourceRegisteredEvent, ResourceUpdatedEvent};
pub use generator::{bootstrap_resource_types, mark_resource_type, ResourceTypeMeta, RESOURCE_TYPE_META};
pub use hot_reload::{DefaultCoordinator, ReloadCoordinator};
pub use provider::{EntryState, ResourceProvider};
pub use serial::{BinaryReader, BinaryWriter, ReadState, ResourceIndex, ScriptStorage, StringRegistry};
pub use vfs::{DiskVfs, MemoryVfs, Vfs, VfsEvent, VfsEventKind, VfsWatcher};
