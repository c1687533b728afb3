//! Reflection registry
//!
//! Catalogue of enum, struct and function descriptors plus attached metadata.
//! The registry is write-once-per-name: after construction concurrent readers
//! are allowed, re-registering a name is rejected. Compiled patches are linked
//! into their owning registry and live until destroyed with it.
//!
//! Metadata payloads are opaque `Arc<dyn Any>` values keyed by
//! `(owner [, member], meta_type_name)`. Keys are not unique - iteration
//! yields every match in insertion order.

use crate::interner::Name;
use crate::patch::PatchData;
use crate::types::{
    Archetype, Argument, EnumType, Field, FieldLayout, FunctionType, StructType,
    DYN_ARRAY_HEADER_SIZE, ENUM_VALUE_SIZE, HANDLE_SIZE,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;
use tracing::error;

/// Opaque metadata payload
pub type MetaValue = Arc<dyn Any + Send + Sync>;

/// Handle to a compiled patch linked into a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchHandle(pub(crate) u32);

impl PatchHandle {
    /// Failure sentinel returned by rejected patch builds
    pub const INVALID: PatchHandle = PatchHandle(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Insertion-ordered name-keyed descriptor store
struct NamedStore<T> {
    items: Vec<Arc<T>>,
    index: FxHashMap<Name, usize>,
}

impl<T> NamedStore<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    fn add(&mut self, name: Name, item: Arc<T>) -> bool {
        if self.index.contains_key(&name) {
            return false;
        }

        self.index.insert(name, self.items.len());
        self.items.push(item);
        true
    }

    fn get(&self, name: Name) -> Option<&Arc<T>> {
        self.index.get(&name).map(|&slot| &self.items[slot])
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.items.iter()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct MetaKey {
    owner: Name,
    member: Option<Name>,
    meta_type: Name,
}

/// Append-only metadata store; duplicate keys permitted
struct MetaStore {
    entries: Vec<MetaValue>,
    index: FxHashMap<MetaKey, Vec<usize>>,
}

impl MetaStore {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    fn add(&mut self, key: MetaKey, value: MetaValue) {
        let slot = self.entries.len();
        self.entries.push(value);
        self.index.entry(key).or_default().push(slot);
    }

    fn query(&self, key: MetaKey) -> impl Iterator<Item = &MetaValue> {
        self.index
            .get(&key)
            .map(|slots| slots.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|&slot| &self.entries[slot])
    }
}

struct PatchSlab {
    slots: Vec<Option<Arc<PatchData>>>,
    free: Vec<u32>,
}

impl PatchSlab {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn attach(&mut self, data: Arc<PatchData>) -> PatchHandle {
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(data);
            return PatchHandle(slot);
        }

        let slot = self.slots.len() as u32;
        self.slots.push(Some(data));
        PatchHandle(slot)
    }

    fn get(&self, handle: PatchHandle) -> Option<Arc<PatchData>> {
        self.slots
            .get(handle.0 as usize)
            .and_then(|slot| slot.clone())
    }

    fn remove(&mut self, handle: PatchHandle) -> Option<Arc<PatchData>> {
        let taken = self.slots.get_mut(handle.0 as usize)?.take();
        if taken.is_some() {
            self.free.push(handle.0);
        }
        taken
    }
}

/// Reflection registry (component A)
///
/// Descriptors are shared via `Arc`: the registry is a catalogue, not the sole
/// owner. Dropping the registry drops every compiled patch linked into it.
pub struct Registry {
    enums: NamedStore<EnumType>,
    structs: NamedStore<StructType>,
    functions: NamedStore<FunctionType>,

    enum_meta: MetaStore,
    enum_value_meta: MetaStore,
    struct_meta: MetaStore,
    struct_field_meta: MetaStore,
    function_meta: MetaStore,
    function_argument_meta: MetaStore,

    // Patch additions take this short lock; patch application and iteration
    // clone the Arc and run lock-free.
    patches: Mutex<PatchSlab>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            enums: NamedStore::new(),
            structs: NamedStore::new(),
            functions: NamedStore::new(),
            enum_meta: MetaStore::new(),
            enum_value_meta: MetaStore::new(),
            struct_meta: MetaStore::new(),
            struct_field_meta: MetaStore::new(),
            function_meta: MetaStore::new(),
            function_argument_meta: MetaStore::new(),
            patches: Mutex::new(PatchSlab::new()),
        }
    }

    /// Register an enum descriptor; returns false on a name conflict
    pub fn add_enum(&mut self, descriptor: EnumType) -> bool {
        let name = descriptor.name;
        if self.enums.get(name).is_some() {
            return false;
        }

        if let Err(problem) = validate_enum(&descriptor) {
            error!(name = %name, %problem, "ill-formed enum registered");
            debug_assert!(false, "ill-formed enum {name}: {problem}");
        }

        self.enums.add(name, Arc::new(descriptor))
    }

    /// Register a struct descriptor; returns false on a name conflict
    pub fn add_struct(&mut self, descriptor: StructType) -> bool {
        let name = descriptor.name;
        if self.structs.get(name).is_some() {
            return false;
        }

        if let Err(problem) = validate_struct(&descriptor) {
            error!(name = %name, %problem, "ill-formed struct registered");
            debug_assert!(false, "ill-formed struct {name}: {problem}");
        }

        self.structs.add(name, Arc::new(descriptor))
    }

    /// Register a function descriptor; returns false on a name conflict
    pub fn add_function(&mut self, descriptor: FunctionType) -> bool {
        let name = descriptor.name;
        if self.functions.get(name).is_some() {
            return false;
        }

        if let Err(problem) = validate_function(&descriptor) {
            error!(name = %name, %problem, "ill-formed function registered");
            debug_assert!(false, "ill-formed function {name}: {problem}");
        }

        self.functions.add(name, Arc::new(descriptor))
    }

    pub fn query_enum(&self, name: Name) -> Option<&Arc<EnumType>> {
        self.enums.get(name)
    }

    pub fn query_struct(&self, name: Name) -> Option<&Arc<StructType>> {
        self.structs.get(name)
    }

    pub fn query_function(&self, name: Name) -> Option<&Arc<FunctionType>> {
        self.functions.get(name)
    }

    /// All registered enums in insertion order
    pub fn enums(&self) -> impl Iterator<Item = &Arc<EnumType>> {
        self.enums.iter()
    }

    /// All registered structs in insertion order
    pub fn structs(&self) -> impl Iterator<Item = &Arc<StructType>> {
        self.structs.iter()
    }

    /// All registered functions in insertion order
    pub fn functions(&self) -> impl Iterator<Item = &Arc<FunctionType>> {
        self.functions.iter()
    }

    pub fn add_enum_meta(&mut self, owner: Name, meta_type: Name, value: MetaValue) {
        self.enum_meta.add(meta_key(owner, None, meta_type), value);
    }

    pub fn add_enum_value_meta(&mut self, owner: Name, value_name: Name, meta_type: Name, value: MetaValue) {
        self.enum_value_meta
            .add(meta_key(owner, Some(value_name), meta_type), value);
    }

    pub fn add_struct_meta(&mut self, owner: Name, meta_type: Name, value: MetaValue) {
        self.struct_meta.add(meta_key(owner, None, meta_type), value);
    }

    pub fn add_struct_field_meta(&mut self, owner: Name, field: Name, meta_type: Name, value: MetaValue) {
        self.struct_field_meta
            .add(meta_key(owner, Some(field), meta_type), value);
    }

    pub fn add_function_meta(&mut self, owner: Name, meta_type: Name, value: MetaValue) {
        self.function_meta.add(meta_key(owner, None, meta_type), value);
    }

    pub fn add_function_argument_meta(&mut self, owner: Name, argument: Name, meta_type: Name, value: MetaValue) {
        self.function_argument_meta
            .add(meta_key(owner, Some(argument), meta_type), value);
    }

    pub fn query_enum_meta(&self, owner: Name, meta_type: Name) -> impl Iterator<Item = &MetaValue> {
        self.enum_meta.query(meta_key(owner, None, meta_type))
    }

    pub fn query_enum_value_meta(
        &self,
        owner: Name,
        value_name: Name,
        meta_type: Name,
    ) -> impl Iterator<Item = &MetaValue> {
        self.enum_value_meta
            .query(meta_key(owner, Some(value_name), meta_type))
    }

    pub fn query_struct_meta(&self, owner: Name, meta_type: Name) -> impl Iterator<Item = &MetaValue> {
        self.struct_meta.query(meta_key(owner, None, meta_type))
    }

    pub fn query_struct_field_meta(
        &self,
        owner: Name,
        field: Name,
        meta_type: Name,
    ) -> impl Iterator<Item = &MetaValue> {
        self.struct_field_meta
            .query(meta_key(owner, Some(field), meta_type))
    }

    pub fn query_function_meta(&self, owner: Name, meta_type: Name) -> impl Iterator<Item = &MetaValue> {
        self.function_meta.query(meta_key(owner, None, meta_type))
    }

    pub fn query_function_argument_meta(
        &self,
        owner: Name,
        argument: Name,
        meta_type: Name,
    ) -> impl Iterator<Item = &MetaValue> {
        self.function_argument_meta
            .query(meta_key(owner, Some(argument), meta_type))
    }

    // ------------------------------------------------------------------
    // Compiled patch list
    // ------------------------------------------------------------------

    pub(crate) fn attach_patch(&self, data: Arc<PatchData>) -> PatchHandle {
        self.patches.lock().attach(data)
    }

    /// Shared view of a compiled patch's nodes
    pub fn patch_data(&self, handle: PatchHandle) -> Option<Arc<PatchData>> {
        if !handle.is_valid() {
            return None;
        }
        self.patches.lock().get(handle)
    }

    /// Apply every patch node to `target` (`memcpy` per node)
    pub fn patch_apply(&self, handle: PatchHandle, target: &mut [u8]) -> bool {
        match self.patch_data(handle) {
            Some(data) => {
                data.apply(target);
                true
            }
            None => false,
        }
    }

    /// Struct type the patch was built against
    pub fn patch_type(&self, handle: PatchHandle) -> Option<Arc<StructType>> {
        self.patch_data(handle).map(|data| data.struct_type.clone())
    }

    /// Destroy a patch, unlinking it from this registry
    pub fn patch_destroy(&self, handle: PatchHandle) -> bool {
        if !handle.is_valid() {
            return false;
        }
        self.patches.lock().remove(handle).is_some()
    }

    /// Number of live patches linked into this registry
    pub fn patch_count(&self) -> usize {
        self.patches
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Detach every live patch, returning `(former slot, data)` pairs in slot
    /// order. Used by patch migration.
    pub(crate) fn drain_patches(&self) -> Vec<(u32, Arc<PatchData>)> {
        let mut slab = self.patches.lock();
        let drained = slab
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, entry)| entry.take().map(|data| (slot as u32, data)))
            .collect();
        slab.free.clear();
        slab.slots.clear();
        drained
    }
}

fn meta_key(owner: Name, member: Option<Name>, meta_type: Name) -> MetaKey {
    MetaKey {
        owner,
        member,
        meta_type,
    }
}

fn validate_enum(descriptor: &EnumType) -> Result<(), String> {
    if descriptor.values.is_empty() {
        return Err("enum has no values".to_owned());
    }
    Ok(())
}

fn validate_struct(descriptor: &StructType) -> Result<(), String> {
    if descriptor.size == 0 || descriptor.alignment == 0 {
        return Err("zero size or alignment".to_owned());
    }

    if !descriptor.alignment.is_power_of_two() {
        return Err(format!(
            "alignment {} is not a power of two",
            descriptor.alignment
        ));
    }

    if descriptor.size % descriptor.alignment != 0 {
        return Err(format!(
            "size {} is not a multiple of alignment {}",
            descriptor.size, descriptor.alignment
        ));
    }

    if descriptor.fields.is_empty() {
        return Err("struct has no fields".to_owned());
    }

    let mut previous_offset = 0u32;
    for field in &descriptor.fields {
        if field.offset < previous_offset {
            return Err(format!("field {} breaks offset ordering", field.name));
        }
        previous_offset = field.offset;

        if field.size == 0 {
            return Err(format!("field {} has zero size", field.name));
        }

        validate_field_layout(field)?;
    }

    Ok(())
}

fn validate_field_layout(field: &Field) -> Result<(), String> {
    match &field.layout {
        FieldLayout::SignedInt | FieldLayout::UnsignedInt => {
            if !matches!(field.size, 1 | 2 | 4 | 8) {
                return Err(format!("field {} has invalid integer width {}", field.name, field.size));
            }
        }
        FieldLayout::Floating => {
            if !matches!(field.size, 4 | 8) {
                return Err(format!("field {} has invalid float width {}", field.name, field.size));
            }
        }
        FieldLayout::StringPointer | FieldLayout::InternedString => {
            if field.size != HANDLE_SIZE {
                return Err(format!("field {} must be a pointer-sized slot", field.name));
            }
        }
        FieldLayout::Enum { .. } => {
            if field.size != ENUM_VALUE_SIZE {
                return Err(format!("field {} must use the enum storage width", field.name));
            }
        }
        FieldLayout::InlineArray { item_count, .. } => {
            // Nested arrays are unrepresentable through ItemLayout.
            if *item_count == 0 {
                return Err(format!("inline array {} has zero items", field.name));
            }
        }
        FieldLayout::DynamicArray { .. } => {
            if field.size != DYN_ARRAY_HEADER_SIZE {
                return Err(format!(
                    "dynamic array {} must span the array header",
                    field.name
                ));
            }
        }
        FieldLayout::ExternalPointer
        | FieldLayout::Struct { .. }
        | FieldLayout::StructPointer { .. }
        | FieldLayout::Patch => {}
    }

    Ok(())
}

fn validate_function(descriptor: &FunctionType) -> Result<(), String> {
    if let Some(return_type) = &descriptor.return_type {
        validate_argument(return_type, true)?;
    }

    for argument in &descriptor.arguments {
        validate_argument(argument, false)?;
    }

    Ok(())
}

fn validate_argument(argument: &Argument, is_return: bool) -> Result<(), String> {
    match argument.archetype {
        Archetype::InlineArray | Archetype::DynamicArray => {
            return Err(format!(
                "argument {} has array archetype, arrays are not callable surface",
                argument.name
            ));
        }
        Archetype::SignedInt => {
            if !(matches!(argument.size, 1 | 2 | 4 | 8) || (is_return && argument.size == 0)) {
                return Err(format!("argument {} has invalid width", argument.name));
            }
        }
        Archetype::UnsignedInt => {
            if !matches!(argument.size, 1 | 2 | 4 | 8) {
                return Err(format!("argument {} has invalid width", argument.name));
            }
        }
        Archetype::Floating => {
            if !matches!(argument.size, 4 | 8) {
                return Err(format!("argument {} has invalid width", argument.name));
            }
        }
        Archetype::Enum => {
            if argument.size != ENUM_VALUE_SIZE {
                return Err(format!("argument {} has invalid enum width", argument.name));
            }
        }
        Archetype::StringPointer | Archetype::InternedString => {
            if argument.size != HANDLE_SIZE {
                return Err(format!("argument {} must be pointer-sized", argument.name));
            }
        }
        Archetype::ExternalPointer | Archetype::Struct | Archetype::StructPointer | Archetype::Patch => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_enum() -> EnumType {
        EnumType::new("color_t", false, vec![("red", 0), ("green", 1), ("blue", 2)])
    }

    fn transform_struct() -> StructType {
        StructType::new(
            "transform_t",
            16,
            8,
            vec![
                Field::new("x", 0, 4, FieldLayout::Floating),
                Field::new("y", 4, 4, FieldLayout::Floating),
                Field::new("generation", 8, 8, FieldLayout::UnsignedInt),
            ],
        )
    }

    #[test]
    fn test_duplicate_enum_rejected() {
        let mut registry = Registry::new();
        assert!(registry.add_enum(color_enum()));
        assert!(!registry.add_enum(color_enum()));
        assert_eq!(registry.enums().count(), 1);
    }

    #[test]
    fn test_duplicate_struct_rejected() {
        let mut registry = Registry::new();
        assert!(registry.add_struct(transform_struct()));
        assert!(!registry.add_struct(transform_struct()));
    }

    #[test]
    fn test_query_by_name() {
        let mut registry = Registry::new();
        registry.add_struct(transform_struct());
        let name = Name::intern("transform_t");
        let descriptor = registry.query_struct(name).expect("registered");
        assert_eq!(descriptor.size, 16);
        assert!(registry.query_struct(Name::intern("missing_t")).is_none());
    }

    #[test]
    fn test_insertion_order_iteration() {
        let mut registry = Registry::new();
        registry.add_enum(color_enum());
        registry.add_enum(EnumType::new("blend_t", false, vec![("opaque", 0)]));

        let names: Vec<_> = registry.enums().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["color_t", "blend_t"]);
    }

    #[test]
    fn test_meta_duplicates_all_returned() {
        let mut registry = Registry::new();
        registry.add_struct(transform_struct());

        let owner = Name::intern("transform_t");
        let meta_type = Name::intern("network_replicated");
        registry.add_struct_meta(owner, meta_type, Arc::new(1u32));
        registry.add_struct_meta(owner, meta_type, Arc::new(2u32));

        let collected: Vec<u32> = registry
            .query_struct_meta(owner, meta_type)
            .map(|value| *value.downcast_ref::<u32>().unwrap())
            .collect();
        assert_eq!(collected, vec![1, 2]);
    }

    #[test]
    fn test_field_meta_keyed_by_member() {
        let mut registry = Registry::new();
        registry.add_struct(transform_struct());

        let owner = Name::intern("transform_t");
        let meta_type = Name::intern("interpolated");
        registry.add_struct_field_meta(owner, Name::intern("x"), meta_type, Arc::new(true));

        assert_eq!(
            registry
                .query_struct_field_meta(owner, Name::intern("x"), meta_type)
                .count(),
            1
        );
        assert_eq!(
            registry
                .query_struct_field_meta(owner, Name::intern("y"), meta_type)
                .count(),
            0
        );
    }

    #[test]
    fn test_function_registration_and_meta() {
        let mut registry = Registry::new();
        let descriptor = FunctionType {
            name: Name::intern("transform_reset"),
            return_type: None,
            arguments: vec![Argument {
                name: Name::intern("target"),
                archetype: Archetype::StructPointer,
                size: 8,
                type_name: Some(Name::intern("transform_t")),
            }],
            call: Arc::new(|_return_slot, _arguments| {}),
        };

        assert!(registry.add_function(descriptor.clone()));
        assert!(!registry.add_function(descriptor));

        let owner = Name::intern("transform_reset");
        let meta_type = Name::intern("script_exposed");
        registry.add_function_meta(owner, meta_type, Arc::new(()));
        registry.add_function_argument_meta(owner, Name::intern("target"), meta_type, Arc::new(()));

        assert_eq!(registry.query_function_meta(owner, meta_type).count(), 1);
        assert_eq!(
            registry
                .query_function_argument_meta(owner, Name::intern("target"), meta_type)
                .count(),
            1
        );
        assert!(registry.query_function(owner).is_some());
    }

    #[test]
    fn test_struct_validation_catches_misalignment() {
        let descriptor = StructType::new(
            "broken_t",
            10,
            8,
            vec![Field::new("a", 0, 4, FieldLayout::UnsignedInt)],
        );
        assert!(validate_struct(&descriptor).is_err());
    }

    #[test]
    fn test_struct_validation_catches_non_power_of_two_alignment() {
        let descriptor = StructType::new(
            "skewed_t",
            12,
            3,
            vec![Field::new("a", 0, 4, FieldLayout::UnsignedInt)],
        );
        assert!(validate_struct(&descriptor).is_err());
    }

    #[test]
    fn test_struct_validation_catches_unsorted_fields() {
        let descriptor = StructType::new(
            "unsorted_t",
            16,
            8,
            vec![
                Field::new("b", 8, 4, FieldLayout::UnsignedInt),
                Field::new("a", 0, 4, FieldLayout::UnsignedInt),
            ],
        );
        assert!(validate_struct(&descriptor).is_err());
    }
}
