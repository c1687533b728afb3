//! Resource type generation
//!
//! Every struct annotated with the `resource_type` struct meta gets four
//! generated companion types registered into the reflection registry:
//!
//! - `typed_entry_<T>` - per-type entry view
//! - `container_<T>` - aligned box holding one deserialized `T`
//! - `resource_registered_event_<T>` / `resource_loaded_event_<T>`
//!
//! The provider dispatches through one [`TypeInterface`] record per resource
//! type, the runtime counterpart of those descriptors.

use crate::entry::{ContainerCell, ContainerId, EntryId, TypedEntry};
use crate::events::{ResourceLoadedEvent, ResourceRegisteredEvent};
use ember_reflect::{Field, FieldLayout, Name, Registry, StructType};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Struct meta marking a reflected struct as a loadable resource type
pub const RESOURCE_TYPE_META: &str = "resource_type";

/// Opaque payload attached under [`RESOURCE_TYPE_META`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceTypeMeta;

/// Mark a registered struct as a resource type
pub fn mark_resource_type(registry: &mut Registry, type_name: Name) {
    registry.add_struct_meta(
        type_name,
        Name::intern(RESOURCE_TYPE_META),
        Arc::new(ResourceTypeMeta),
    );
}

fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Register the four generated companion descriptors for every marked
/// resource type; returns the resource type names found
pub fn bootstrap_resource_types(registry: &mut Registry) -> Vec<Name> {
    let meta_type = Name::intern(RESOURCE_TYPE_META);
    let resource_types: Vec<Arc<StructType>> = registry
        .structs()
        .filter(|descriptor| {
            registry
                .query_struct_meta(descriptor.name, meta_type)
                .next()
                .is_some()
        })
        .cloned()
        .collect();

    for source in &resource_types {
        let typed_entry_name = Name::intern(&format!("typed_entry_{}", source.name));
        if registry.query_struct(typed_entry_name).is_some() {
            // Already generated by a previous bootstrap pass.
            continue;
        }

        registry.add_struct(typed_entry_descriptor(typed_entry_name));
        registry.add_struct(container_descriptor(source));
        registry.add_struct(event_descriptor(&format!(
            "resource_registered_event_{}",
            source.name
        )));
        registry.add_struct(event_descriptor(&format!(
            "resource_loaded_event_{}",
            source.name
        )));

        debug!(resource_type = %source.name, "generated resource companion types");
    }

    resource_types.iter().map(|source| source.name).collect()
}

fn typed_entry_descriptor(name: Name) -> StructType {
    StructType::new(
        name,
        32,
        8,
        vec![
            Field::new("entry_id", 0, 4, FieldLayout::UnsignedInt),
            Field::new("name", 8, 8, FieldLayout::InternedString),
            Field::new("loaded_container_id", 16, 4, FieldLayout::UnsignedInt),
            Field::new("loading_container_id", 20, 4, FieldLayout::UnsignedInt),
            Field::new("bound_string_registry", 24, 8, FieldLayout::ExternalPointer),
        ],
    )
}

fn container_descriptor(source: &Arc<StructType>) -> StructType {
    let alignment = source.alignment.max(4);
    let payload_offset = align_up(4, source.alignment.max(1));
    let size = align_up(payload_offset + source.size, alignment);

    let mut descriptor = StructType::new(
        Name::intern(&format!("container_{}", source.name)),
        size,
        alignment,
        vec![
            Field::new("container_id", 0, 4, FieldLayout::UnsignedInt),
            Field::new(
                "stored_resource",
                payload_offset,
                source.size,
                FieldLayout::Struct {
                    type_name: source.name,
                },
            ),
        ],
    );

    // Container lifecycle forwards to the stored resource's hooks on the
    // aligned payload.
    let begin = payload_offset as usize;
    let end = begin + source.size as usize;
    if let Some(init) = source.init.clone() {
        descriptor.init = Some(Arc::new(move |bytes: &mut [u8]| init(&mut bytes[begin..end])));
    }
    if let Some(shutdown) = source.shutdown.clone() {
        descriptor.shutdown = Some(Arc::new(move |bytes: &mut [u8]| {
            shutdown(&mut bytes[begin..end])
        }));
    }

    descriptor
}

fn event_descriptor(name: &str) -> StructType {
    StructType::new(
        Name::intern(name),
        16,
        8,
        vec![
            Field::new("entry_id", 0, 4, FieldLayout::UnsignedInt),
            Field::new("name", 8, 8, FieldLayout::InternedString),
        ],
    )
}

/// Mutable per-type tables, locked per access during parallel serving
pub(crate) struct InterfaceState {
    pub typed_entries: FxHashMap<EntryId, TypedEntry>,
    pub containers: FxHashMap<ContainerId, Arc<ContainerCell>>,
    pub registered_events: Vec<ResourceRegisteredEvent>,
    pub loaded_events: Vec<ResourceLoadedEvent>,
}

/// Runtime dispatch record for one resource type
pub struct TypeInterface {
    pub type_name: Name,
    pub struct_type: Arc<StructType>,
    state: Mutex<InterfaceState>,
}

impl TypeInterface {
    fn new(struct_type: Arc<StructType>) -> Self {
        Self {
            type_name: struct_type.name,
            struct_type,
            state: Mutex::new(InterfaceState {
                typed_entries: FxHashMap::default(),
                containers: FxHashMap::default(),
                registered_events: Vec::new(),
                loaded_events: Vec::new(),
            }),
        }
    }

    /// Build interface records for every marked resource type
    pub fn collect(registry: &Registry) -> Vec<TypeInterface> {
        let meta_type = Name::intern(RESOURCE_TYPE_META);
        registry
            .structs()
            .filter(|descriptor| {
                registry
                    .query_struct_meta(descriptor.name, meta_type)
                    .next()
                    .is_some()
            })
            .map(|descriptor| TypeInterface::new(descriptor.clone()))
            .collect()
    }

    pub(crate) fn with_state<R>(&self, access: impl FnOnce(&mut InterfaceState) -> R) -> R {
        access(&mut self.state.lock())
    }
}
