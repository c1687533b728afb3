//! ember-reflect - Runtime reflection, binary patches and type migration
//!
//! Core of the ember engine runtime. Provides:
//! - A reflection registry storing typed descriptions of enums, structs and
//!   functions plus attached metadata
//! - Dotted-path field location inside registered struct layouts
//! - Compact binary overlays ("patches") built against a struct type
//! - A migration pipeline that compares two registries, classifies every type,
//!   compiles per-struct command programs and rewrites live instances and
//!   stored patches from the old layout to the new one
//!
//! Instances are raw byte buffers whose layout is described by a registered
//! [`StructType`]; all reads and writes go through field offsets.

pub mod adapt;
pub mod dynarray;
pub mod error;
pub mod interner;
pub mod locator;
pub mod migrator;
pub mod patch;
pub mod registry;
pub mod seed;
pub mod types;

pub use error::{ErrorKind, ReflectError, Result};
pub use interner::Name;
pub use locator::{query_local_field, FieldLookup};
pub use migrator::StructMigrator;
pub use patch::{PatchBuilder, PatchData};
pub use registry::{MetaValue, PatchHandle, Registry};
pub use seed::{EnumSeed, MigrationSeed, MigrationStatus, StructSeed};
pub use types::{
    check_visibility, Archetype, Argument, EnumType, EnumValue, Field, FieldCondition, FieldLayout,
    FunctionType, InstanceHook, ItemLayout, StructType,
};
