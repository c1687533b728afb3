//! Struct migrator (component E)
//!
//! Compiles migration seeds into per-struct command programs and executes
//! them. A program is six parallel command streams sharing one condition
//! index space:
//!
//! - `Condition` - visibility checks with optional parent chaining
//! - `Copy` - raw byte moves (coalesced when ranges abut)
//! - `AdaptNumeric` - width conversion for integer/float fields
//! - `AdaptEnum` - value remapping through the migration seed
//! - `AdaptDynamicArray` - element-by-element array conversion
//! - `SetZero` - source cleanup after ownership transfer (coalesced)
//!
//! Programs run against live instances and against compiled patches; the
//! latter rewrites every patch of the source registry onto the target
//! registry using a worker pool.

use crate::adapt::{adapt_enum, adapt_numeric};
use crate::dynarray;
use crate::interner::Name;
use crate::patch::{PatchBuilder, PatchData};
use crate::registry::PatchHandle;
use crate::seed::{MigrationSeed, MigrationStatus};
use crate::types::{
    check_visibility, Archetype, Field, FieldLayout, ItemLayout, StructType, DYN_ARRAY_HEADER_SIZE,
    ENUM_VALUE_SIZE,
};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Patches per worker task during patch migration
const PATCH_BUNDLE_SIZE: usize = 64;

/// Visibility condition compiled into a program
///
/// `parent` indices always reference earlier conditions: a nested condition
/// implies the conjunction of its chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub src_offset: u32,
    pub field: Field,
    pub values: Vec<i64>,
    pub parent: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyCmd {
    pub src_offset: u32,
    pub dst_offset: u32,
    pub size: u32,
    pub condition: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptNumericCmd {
    pub src_offset: u32,
    pub dst_offset: u32,
    pub src_size: u32,
    pub dst_size: u32,
    pub archetype: Archetype,
    pub condition: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptEnumCmd {
    pub src_offset: u32,
    pub dst_offset: u32,
    pub type_name: Name,
    pub condition: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptDynArrayCmd {
    pub src_offset: u32,
    pub dst_offset: u32,
    pub item: ItemLayout,
    pub src_item_size: u32,
    pub dst_item_size: u32,
    pub dst_item_align: u32,
    pub condition: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetZeroCmd {
    pub src_offset: u32,
    pub size: u32,
    pub condition: Option<u32>,
}

/// Compiled command program for one source struct
#[derive(Debug, Clone, Default)]
pub struct StructProgram {
    pub conditions: Vec<Condition>,
    pub copy: Vec<CopyCmd>,
    pub adapt_numeric: Vec<AdaptNumericCmd>,
    pub adapt_enum: Vec<AdaptEnumCmd>,
    pub adapt_dynamic_array: Vec<AdaptDynArrayCmd>,
    pub set_zero: Vec<SetZeroCmd>,
}

impl StructProgram {
    fn add_condition(&mut self, condition: Condition) -> u32 {
        // Conditions are few; a linear dedup scan mirrors build-time cost of
        // the command emission itself.
        for (index, existing) in self.conditions.iter().enumerate() {
            if existing.src_offset == condition.src_offset
                && existing.field.name == condition.field.name
                && existing.values == condition.values
                && existing.parent == condition.parent
            {
                return index as u32;
            }
        }

        self.conditions.push(condition);
        (self.conditions.len() - 1) as u32
    }

    fn add_copy(&mut self, command: CopyCmd) {
        if let Some(last) = self.copy.last_mut() {
            let source_abuts = last.src_offset + last.size == command.src_offset;
            let target_abuts = last.dst_offset + last.size == command.dst_offset;
            if source_abuts && target_abuts && last.condition == command.condition {
                last.size += command.size;
                return;
            }
        }

        self.copy.push(command);
    }

    fn add_set_zero(&mut self, command: SetZeroCmd) {
        if let Some(last) = self.set_zero.last_mut() {
            let abuts = last.src_offset + last.size == command.src_offset;
            if abuts && last.condition == command.condition {
                last.size += command.size;
                return;
            }
        }

        self.set_zero.push(command);
    }

    fn add_handle_transfer(&mut self, src_offset: u32, dst_offset: u32, size: u32, condition: Option<u32>) {
        self.add_copy(CopyCmd {
            src_offset,
            dst_offset,
            size,
            condition,
        });
        self.add_set_zero(SetZeroCmd {
            src_offset,
            size,
            condition,
        });
    }

    fn add_numeric(
        &mut self,
        src_offset: u32,
        dst_offset: u32,
        src_size: u32,
        dst_size: u32,
        archetype: Archetype,
        condition: Option<u32>,
    ) {
        if src_size == dst_size {
            self.add_copy(CopyCmd {
                src_offset,
                dst_offset,
                size: src_size,
                condition,
            });
        } else {
            self.adapt_numeric.push(AdaptNumericCmd {
                src_offset,
                dst_offset,
                src_size,
                dst_size,
                archetype,
                condition,
            });
        }
    }

    fn add_enum(
        &mut self,
        src_offset: u32,
        dst_offset: u32,
        type_name: Name,
        copyable: bool,
        condition: Option<u32>,
    ) {
        if copyable {
            self.add_copy(CopyCmd {
                src_offset,
                dst_offset,
                size: ENUM_VALUE_SIZE,
                condition,
            });
        } else {
            self.adapt_enum.push(AdaptEnumCmd {
                src_offset,
                dst_offset,
                type_name,
                condition,
            });
        }
    }
}

/// Executes migration programs compiled from a [`MigrationSeed`]
pub struct StructMigrator {
    seed: MigrationSeed,
    programs: FxHashMap<Name, StructProgram>,
}

impl StructMigrator {
    /// Compile a program for every struct whose seed status is not `Removed`
    pub fn build(seed: MigrationSeed) -> Self {
        let mut migrator = Self {
            seed,
            programs: FxHashMap::default(),
        };

        let names: Vec<Name> = migrator.seed.source_registry().structs().map(|s| s.name).collect();
        for name in names {
            let removed = migrator
                .seed
                .struct_seed(name)
                .map(|node| node.status == MigrationStatus::Removed)
                .unwrap_or(true);
            if !removed {
                migrator.request_program(name);
            }
        }

        migrator
    }

    /// Compiled program for a source struct, if one was built
    pub fn program(&self, type_name: Name) -> Option<&StructProgram> {
        self.programs.get(&type_name)
    }

    pub fn seed(&self) -> &MigrationSeed {
        &self.seed
    }

    fn request_program(&mut self, type_name: Name) -> bool {
        if self.programs.contains_key(&type_name) {
            return true;
        }

        let source_struct = match self.seed.source_registry().query_struct(type_name) {
            Some(found) => found.clone(),
            None => {
                error!(name = %type_name, "unable to find source struct, corrupted seed?");
                debug_assert!(false, "unreachable source struct {type_name}");
                return false;
            }
        };

        let Some(struct_seed) = self.seed.struct_seed(type_name) else {
            error!(name = %type_name, "unable to find migration seed node, corrupted seed?");
            debug_assert!(false, "missing seed node for {type_name}");
            return false;
        };

        debug_assert!(struct_seed.status != MigrationStatus::Removed);
        let field_remap = struct_seed.field_remap.clone();
        let not_needed = struct_seed.status == MigrationStatus::NotNeeded;

        let program = self.build_program(&source_struct, not_needed, &field_remap);
        self.programs.insert(type_name, program);
        true
    }

    fn build_program(
        &mut self,
        source_struct: &StructType,
        not_needed: bool,
        field_remap: &[Option<usize>],
    ) -> StructProgram {
        let mut program = StructProgram::default();

        if not_needed {
            program.add_copy(CopyCmd {
                src_offset: 0,
                dst_offset: 0,
                size: source_struct.size,
                condition: None,
            });
            return program;
        }

        let target_struct = self
            .seed
            .target_registry()
            .query_struct(source_struct.name)
            .expect("non-removed seed implies target struct")
            .clone();

        for (field_index, source_field) in source_struct.fields.iter().enumerate() {
            let Some(target_index) = field_remap[field_index] else {
                // No field mapped, skipping migration.
                continue;
            };
            let target_field = &target_struct.fields[target_index];

            let condition = source_field.visibility.as_ref().and_then(|visibility| {
                let Some((_, condition_field)) = source_struct.field(visibility.field) else {
                    error!(
                        field = %source_field.name,
                        condition = %visibility.field,
                        owner = %source_struct.name,
                        "visibility condition references an unknown field"
                    );
                    return None;
                };
                Some(program.add_condition(Condition {
                    src_offset: condition_field.offset,
                    field: condition_field.clone(),
                    values: visibility.values.clone(),
                    parent: None,
                }))
            });

            self.emit_field(
                &mut program,
                source_field,
                target_field,
                source_field.offset,
                target_field.offset,
                condition,
            );
        }

        program
    }

    fn emit_field(
        &mut self,
        program: &mut StructProgram,
        source_field: &Field,
        target_field: &Field,
        src_offset: u32,
        dst_offset: u32,
        condition: Option<u32>,
    ) {
        match (&source_field.layout, &target_field.layout) {
            (FieldLayout::SignedInt, _) | (FieldLayout::UnsignedInt, _) | (FieldLayout::Floating, _) => {
                program.add_numeric(
                    src_offset,
                    dst_offset,
                    source_field.size,
                    target_field.size,
                    source_field.layout.archetype(),
                    condition,
                );
            }

            (FieldLayout::StringPointer, _)
            | (FieldLayout::ExternalPointer, _)
            | (FieldLayout::StructPointer { .. }, _)
            | (FieldLayout::Patch, _) => {
                debug_assert_eq!(source_field.size, target_field.size);
                program.add_handle_transfer(src_offset, dst_offset, source_field.size, condition);
            }

            (FieldLayout::InternedString, _) => {
                program.add_copy(CopyCmd {
                    src_offset,
                    dst_offset,
                    size: source_field.size,
                    condition,
                });
            }

            (FieldLayout::Enum { type_name }, _) => {
                program.add_enum(
                    src_offset,
                    dst_offset,
                    *type_name,
                    self.is_enum_copyable(*type_name),
                    condition,
                );
            }

            (FieldLayout::Struct { type_name }, _) => {
                self.emit_struct_import(program, *type_name, src_offset, dst_offset, condition);
            }

            (
                FieldLayout::InlineArray {
                    item: source_item,
                    item_size: source_item_size,
                    item_count: source_count,
                },
                FieldLayout::InlineArray {
                    item_size: target_item_size,
                    item_count: target_count,
                    ..
                },
            ) => {
                // The full declared extent is migrated; there is no awareness
                // of companion logical-length fields.
                let items = (*source_count).min(*target_count);
                for index in 0..items {
                    let item_src = src_offset + source_item_size * index;
                    let item_dst = dst_offset + target_item_size * index;
                    self.emit_item(
                        program,
                        source_item,
                        *source_item_size,
                        *target_item_size,
                        item_src,
                        item_dst,
                        condition,
                    );
                }
            }

            (
                FieldLayout::DynamicArray {
                    item: source_item,
                    item_size: source_item_size,
                },
                FieldLayout::DynamicArray {
                    item_size: target_item_size,
                    ..
                },
            ) => {
                let can_copy = match source_item {
                    ItemLayout::SignedInt | ItemLayout::UnsignedInt | ItemLayout::Floating => {
                        source_item_size == target_item_size
                    }
                    ItemLayout::StringPointer
                    | ItemLayout::InternedString
                    | ItemLayout::ExternalPointer
                    | ItemLayout::StructPointer { .. }
                    | ItemLayout::Patch => true,
                    ItemLayout::Enum { type_name } => self.is_enum_copyable(*type_name),
                    ItemLayout::Struct { type_name } => self.is_struct_copyable(*type_name),
                };

                if can_copy {
                    program.add_copy(CopyCmd {
                        src_offset,
                        dst_offset,
                        size: source_field.size,
                        condition,
                    });
                    program.add_set_zero(SetZeroCmd {
                        src_offset,
                        size: DYN_ARRAY_HEADER_SIZE,
                        condition,
                    });
                } else {
                    program.adapt_dynamic_array.push(AdaptDynArrayCmd {
                        src_offset,
                        dst_offset,
                        item: source_item.clone(),
                        src_item_size: *source_item_size,
                        dst_item_size: *target_item_size,
                        dst_item_align: self.item_alignment(source_item, *target_item_size),
                        condition,
                    });
                }
            }

            _ => {
                // Mappability guarantees matching archetypes; a mismatch here
                // means the seed is corrupted.
                debug_assert!(
                    false,
                    "field {} mapped across archetypes",
                    source_field.name
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_item(
        &mut self,
        program: &mut StructProgram,
        item: &ItemLayout,
        src_size: u32,
        dst_size: u32,
        src_offset: u32,
        dst_offset: u32,
        condition: Option<u32>,
    ) {
        match item {
            ItemLayout::SignedInt | ItemLayout::UnsignedInt | ItemLayout::Floating => {
                program.add_numeric(src_offset, dst_offset, src_size, dst_size, item.archetype(), condition);
            }
            ItemLayout::StringPointer
            | ItemLayout::ExternalPointer
            | ItemLayout::StructPointer { .. }
            | ItemLayout::Patch => {
                debug_assert_eq!(src_size, dst_size);
                program.add_handle_transfer(src_offset, dst_offset, src_size, condition);
            }
            ItemLayout::InternedString => {
                program.add_copy(CopyCmd {
                    src_offset,
                    dst_offset,
                    size: src_size,
                    condition,
                });
            }
            ItemLayout::Enum { type_name } => {
                program.add_enum(
                    src_offset,
                    dst_offset,
                    *type_name,
                    self.is_enum_copyable(*type_name),
                    condition,
                );
            }
            ItemLayout::Struct { type_name } => {
                self.emit_struct_import(program, *type_name, src_offset, dst_offset, condition);
            }
        }
    }

    /// Import a sub-struct's program rebased by the current field offsets.
    /// `None` conditions of the inner program inherit the outer condition;
    /// other conditions shift by the outer condition count at import time.
    fn emit_struct_import(
        &mut self,
        program: &mut StructProgram,
        type_name: Name,
        src_offset: u32,
        dst_offset: u32,
        condition: Option<u32>,
    ) {
        if !self.request_program(type_name) {
            return;
        }

        let inner = self.programs[&type_name].clone();
        let own_conditions = program.conditions.len() as u32;

        let shift = |inner_condition: Option<u32>| match inner_condition {
            None => condition,
            Some(index) => Some(index + own_conditions),
        };

        for (index, inner_condition) in inner.conditions.iter().enumerate() {
            let mut imported = inner_condition.clone();
            imported.src_offset += src_offset;
            if imported.parent.is_none() {
                imported.parent = condition;
            } else {
                imported.parent = imported.parent.map(|parent| parent + own_conditions);
            }

            let imported_index = program.add_condition(imported);
            // Conditions belong to the inner struct's own field ecosystem and
            // must stay unique after rebasing.
            debug_assert_eq!(imported_index, own_conditions + index as u32);
        }

        for command in &inner.copy {
            program.add_copy(CopyCmd {
                src_offset: command.src_offset + src_offset,
                dst_offset: command.dst_offset + dst_offset,
                size: command.size,
                condition: shift(command.condition),
            });
        }

        for command in &inner.adapt_numeric {
            program.adapt_numeric.push(AdaptNumericCmd {
                src_offset: command.src_offset + src_offset,
                dst_offset: command.dst_offset + dst_offset,
                condition: shift(command.condition),
                ..*command
            });
        }

        for command in &inner.adapt_enum {
            program.adapt_enum.push(AdaptEnumCmd {
                src_offset: command.src_offset + src_offset,
                dst_offset: command.dst_offset + dst_offset,
                condition: shift(command.condition),
                ..*command
            });
        }

        for command in &inner.adapt_dynamic_array {
            let mut imported = command.clone();
            imported.src_offset += src_offset;
            imported.dst_offset += dst_offset;
            imported.condition = shift(command.condition);
            program.adapt_dynamic_array.push(imported);
        }

        for command in &inner.set_zero {
            program.add_set_zero(SetZeroCmd {
                src_offset: command.src_offset + src_offset,
                size: command.size,
                condition: shift(command.condition),
            });
        }
    }

    fn is_enum_copyable(&self, type_name: Name) -> bool {
        match self.seed.enum_seed(type_name) {
            Some(node) => match node.status {
                MigrationStatus::NotNeeded => true,
                MigrationStatus::Needed => false,
                MigrationStatus::Removed => {
                    debug_assert!(false, "copy query for removed enum {type_name}");
                    false
                }
            },
            None => {
                debug_assert!(false, "copy query for unknown enum {type_name}");
                false
            }
        }
    }

    fn is_struct_copyable(&self, type_name: Name) -> bool {
        match self.seed.struct_seed(type_name) {
            Some(node) => match node.status {
                MigrationStatus::NotNeeded => true,
                MigrationStatus::Needed => false,
                MigrationStatus::Removed => {
                    debug_assert!(false, "copy query for removed struct {type_name}");
                    false
                }
            },
            None => {
                debug_assert!(false, "copy query for unknown struct {type_name}");
                false
            }
        }
    }

    fn item_alignment(&self, item: &ItemLayout, dst_item_size: u32) -> u32 {
        match item {
            ItemLayout::Enum { .. } => ENUM_VALUE_SIZE,
            ItemLayout::Struct { type_name } => self
                .seed
                .target_registry()
                .query_struct(*type_name)
                .map(|descriptor| descriptor.alignment)
                .unwrap_or(dst_item_size.max(1)),
            _ => dst_item_size.max(1),
        }
    }

    // ------------------------------------------------------------------
    // Instance migration
    // ------------------------------------------------------------------

    /// Rewrite one instance from the source layout into the target layout
    ///
    /// `src` is mutable because ownership-transferring commands zero the
    /// transferred source bytes; the caller must not read moved-out fields
    /// afterwards. Returns false (and logs) when no program exists for the
    /// type.
    pub fn migrate_instance(&self, type_name: Name, src: &mut [u8], dst: &mut [u8]) -> bool {
        let Some(program) = self.programs.get(&type_name) else {
            error!(name = %type_name, "unable to find migrator for struct");
            return false;
        };

        let mut conditions = vec![false; program.conditions.len()];
        for (index, condition) in program.conditions.iter().enumerate() {
            if let Some(parent) = condition.parent {
                debug_assert!((parent as usize) < index);
                if !conditions[parent as usize] {
                    conditions[index] = false;
                    continue;
                }
            }

            conditions[index] = check_visibility(
                &condition.field,
                &condition.values,
                &src[condition.src_offset as usize..],
            );
        }

        let passes = |condition: Option<u32>| condition.map_or(true, |index| conditions[index as usize]);

        for command in &program.copy {
            if !passes(command.condition) {
                continue;
            }
            let (src_begin, dst_begin) = (command.src_offset as usize, command.dst_offset as usize);
            let size = command.size as usize;
            dst[dst_begin..dst_begin + size].copy_from_slice(&src[src_begin..src_begin + size]);
        }

        for command in &program.adapt_numeric {
            if !passes(command.condition) {
                continue;
            }
            let src_begin = command.src_offset as usize;
            let dst_begin = command.dst_offset as usize;
            adapt_numeric(
                command.archetype,
                &src[src_begin..src_begin + command.src_size as usize],
                &mut dst[dst_begin..dst_begin + command.dst_size as usize],
            );
        }

        for command in &program.adapt_enum {
            if !passes(command.condition) {
                continue;
            }
            let src_begin = command.src_offset as usize;
            let dst_begin = command.dst_offset as usize;
            adapt_enum(
                &self.seed,
                command.type_name,
                &src[src_begin..src_begin + ENUM_VALUE_SIZE as usize],
                &mut dst[dst_begin..dst_begin + ENUM_VALUE_SIZE as usize],
            );
        }

        for command in &program.adapt_dynamic_array {
            if !passes(command.condition) {
                continue;
            }
            self.adapt_dynamic_array(command, src, dst);
        }

        for command in &program.set_zero {
            if !passes(command.condition) {
                continue;
            }
            let begin = command.src_offset as usize;
            src[begin..begin + command.size as usize].fill(0);
        }

        true
    }

    /// Allocate the target array at the source capacity and convert element
    /// by element. Handle-like element kinds never reach this routine - they
    /// take the copyable fast path at program build time.
    fn adapt_dynamic_array(&self, command: &AdaptDynArrayCmd, src: &mut [u8], dst: &mut [u8]) {
        let src_header = dynarray::read_header(&src[command.src_offset as usize..]);
        let buffer = dynarray::allocate_elements(
            src_header.cap,
            command.dst_item_size,
            command.dst_item_align,
        );

        dynarray::write_header(
            &mut dst[command.dst_offset as usize..],
            dynarray::DynArrayHeader {
                data: buffer,
                len: src_header.len,
                cap: src_header.cap,
            },
        );

        for index in 0..src_header.len {
            // SAFETY: both buffers were allocated for at least `cap` items of
            // their respective element sizes; indexes stay below `len <= cap`.
            let (src_element, dst_element) = unsafe {
                let src_ptr = src_header.data.add((index * command.src_item_size as u64) as usize);
                let dst_ptr = buffer.add((index * command.dst_item_size as u64) as usize);
                (
                    std::slice::from_raw_parts_mut(src_ptr, command.src_item_size as usize),
                    std::slice::from_raw_parts_mut(dst_ptr, command.dst_item_size as usize),
                )
            };

            match &command.item {
                ItemLayout::SignedInt | ItemLayout::UnsignedInt | ItemLayout::Floating => {
                    adapt_numeric(command.item.archetype(), src_element, dst_element);
                }
                ItemLayout::Enum { type_name } => {
                    adapt_enum(&self.seed, *type_name, src_element, dst_element);
                }
                ItemLayout::Struct { type_name } => {
                    self.migrate_instance(*type_name, src_element, dst_element);
                }
                other => {
                    debug_assert!(false, "adapt dispatched for copyable element {other:?}");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Patch migration
    // ------------------------------------------------------------------

    /// Rewrite every patch of the source registry onto the target registry
    ///
    /// Patches whose type has no migrator (the type is gone) are destroyed.
    /// Returns a remap table indexed by the former source-registry slot:
    /// `remap[old_slot]` is the new handle in the target registry, or
    /// [`PatchHandle::INVALID`] for destroyed patches.
    pub fn migrate_patches(&self) -> Vec<PatchHandle> {
        let drained = self.seed.source_registry().drain_patches();
        if drained.is_empty() {
            return Vec::new();
        }

        let slots = drained.iter().map(|(slot, _)| *slot as usize).max().unwrap_or(0) + 1;
        let mut remap = vec![PatchHandle::INVALID; slots];

        let migrated: Vec<(u32, PatchHandle)> = drained
            .par_chunks(PATCH_BUNDLE_SIZE)
            .flat_map_iter(|bundle| {
                bundle.iter().filter_map(|(slot, data)| {
                    self.migrate_one_patch(data).map(|handle| (*slot, handle))
                })
            })
            .collect();

        for (slot, handle) in migrated {
            remap[slot as usize] = handle;
        }

        remap
    }

    fn migrate_one_patch(&self, data: &Arc<PatchData>) -> Option<PatchHandle> {
        let type_name = data.type_name();
        let Some(program) = self.programs.get(&type_name) else {
            // Type is deleted, therefore patch should be destroyed too.
            debug!(name = %type_name, "dropping patch for removed type");
            return None;
        };

        let mut builder = PatchBuilder::new();
        let mut statuses = vec![PatchConditionStatus::NotComputed; program.conditions.len()];

        let mut copy_cursor = 0usize;
        let mut numeric_cursor = 0usize;
        let mut enum_cursor = 0usize;

        for node_index in 0..data.node_count() {
            let node_bytes = data.node_bytes(node_index);
            let node_offset = data.node_offset(node_index);
            let node_end = node_offset + node_bytes.len() as u32;
            let mut offset = node_offset;

            while offset < node_end {
                // Skip commands that can no longer match this walk position,
                // and commands whose condition evaluates false.
                while copy_cursor < program.copy.len() {
                    let command = &program.copy[copy_cursor];
                    let exhausted = command.src_offset + command.size <= offset;
                    if exhausted
                        || !self.eval_patch_condition(
                            program,
                            &mut statuses,
                            data,
                            node_index,
                            command.condition,
                        )
                    {
                        copy_cursor += 1;
                    } else {
                        break;
                    }
                }

                while numeric_cursor < program.adapt_numeric.len() {
                    let command = &program.adapt_numeric[numeric_cursor];
                    if command.src_offset < offset
                        || !self.eval_patch_condition(
                            program,
                            &mut statuses,
                            data,
                            node_index,
                            command.condition,
                        )
                    {
                        numeric_cursor += 1;
                    } else {
                        break;
                    }
                }

                while enum_cursor < program.adapt_enum.len() {
                    let command = &program.adapt_enum[enum_cursor];
                    if command.src_offset < offset
                        || !self.eval_patch_condition(
                            program,
                            &mut statuses,
                            data,
                            node_index,
                            command.condition,
                        )
                    {
                        enum_cursor += 1;
                    } else {
                        break;
                    }
                }

                let copy_command = program.copy.get(copy_cursor).filter(|command| {
                    offset >= command.src_offset && offset < command.src_offset + command.size
                });
                let numeric_command = program
                    .adapt_numeric
                    .get(numeric_cursor)
                    .filter(|command| command.src_offset == offset);
                let enum_command = program
                    .adapt_enum
                    .get(enum_cursor)
                    .filter(|command| command.src_offset == offset);

                if let Some(command) = copy_command {
                    let from_source = offset - command.src_offset;
                    let remaining = command.size - from_source;
                    let available = node_end - offset;
                    let emit = remaining.min(available);

                    let node_begin = (offset - node_offset) as usize;
                    let chunk = &node_bytes[node_begin..node_begin + emit as usize];
                    let _ = builder.add_chunk(command.dst_offset + from_source, chunk);

                    offset += emit;
                    if emit == remaining {
                        copy_cursor += 1;
                    }
                } else if let Some(command) = numeric_command {
                    if node_end - offset >= command.src_size {
                        let node_begin = (offset - node_offset) as usize;
                        let mut output = [0u8; 8];
                        adapt_numeric(
                            command.archetype,
                            &node_bytes[node_begin..node_begin + command.src_size as usize],
                            &mut output[..command.dst_size as usize],
                        );
                        let _ = builder.add_chunk(
                            command.dst_offset,
                            &output[..command.dst_size as usize],
                        );
                        offset += command.src_size;
                    } else {
                        debug!(
                            offset,
                            name = %type_name,
                            "patch covers a truncated numeric value, dropping the command"
                        );
                        offset = node_end;
                    }
                    numeric_cursor += 1;
                } else if let Some(command) = enum_command {
                    if node_end - offset >= ENUM_VALUE_SIZE {
                        let node_begin = (offset - node_offset) as usize;
                        let mut output = [0u8; ENUM_VALUE_SIZE as usize];
                        adapt_enum(
                            &self.seed,
                            command.type_name,
                            &node_bytes[node_begin..node_begin + ENUM_VALUE_SIZE as usize],
                            &mut output,
                        );
                        let _ = builder.add_chunk(command.dst_offset, &output);
                        offset += ENUM_VALUE_SIZE;
                    } else {
                        debug!(
                            offset,
                            name = %type_name,
                            "patch covers a truncated enum value, dropping the command"
                        );
                        offset = node_end;
                    }
                    enum_cursor += 1;
                } else {
                    // This partition is absent in the target layout; jump to
                    // the next command start.
                    let mut next = data.struct_type.size;
                    if let Some(command) = program.copy.get(copy_cursor) {
                        next = next.min(command.src_offset);
                    }
                    if let Some(command) = program.adapt_numeric.get(numeric_cursor) {
                        next = next.min(command.src_offset);
                    }
                    if let Some(command) = program.adapt_enum.get(enum_cursor) {
                        next = next.min(command.src_offset);
                    }
                    debug_assert!(next > offset);
                    offset = next.max(offset + 1);
                }
            }
        }

        match builder.build(self.seed.target_registry(), type_name) {
            Ok(handle) => Some(handle),
            Err(problem) => {
                error!(name = %type_name, %problem, "failed to migrate patch");
                None
            }
        }
    }

    /// Derive a condition's value from the patch's own covered bytes. When no
    /// visited node carries the byte, the first condition at that source
    /// offset defaults to true and later ones to false, so a patch that does
    /// not assert a union tag never executes duplicate commands.
    fn eval_patch_condition(
        &self,
        program: &StructProgram,
        statuses: &mut [PatchConditionStatus],
        data: &Arc<PatchData>,
        node_index: usize,
        condition: Option<u32>,
    ) -> bool {
        let Some(index) = condition else {
            return true;
        };
        let index = index as usize;

        if statuses[index] == PatchConditionStatus::NotComputed {
            let condition_data = &program.conditions[index];

            if let Some(parent) = condition_data.parent {
                if !self.eval_patch_condition(program, statuses, data, node_index, Some(parent)) {
                    statuses[index] = PatchConditionStatus::False;
                    return false;
                }
            }

            let mut carrier = None;
            for visited in (0..=node_index).rev() {
                let node_offset = data.node_offset(visited);
                let node_len = data.node_bytes(visited).len() as u32;
                if condition_data.src_offset >= node_offset
                    && condition_data.src_offset < node_offset + node_len
                {
                    carrier = Some((node_offset, visited));
                    break;
                }
            }

            statuses[index] = match carrier {
                Some((node_offset, visited)) => {
                    let inside = (condition_data.src_offset - node_offset) as usize;
                    let bytes = data.node_bytes(visited);
                    if check_visibility(&condition_data.field, &condition_data.values, &bytes[inside..]) {
                        PatchConditionStatus::True
                    } else {
                        PatchConditionStatus::False
                    }
                }
                None => {
                    let first_on_this_address = index == 0
                        || program.conditions[index - 1].src_offset != condition_data.src_offset;
                    if first_on_this_address {
                        PatchConditionStatus::True
                    } else {
                        PatchConditionStatus::False
                    }
                }
            };
        }

        statuses[index] == PatchConditionStatus::True
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchConditionStatus {
    True,
    False,
    NotComputed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::types::{EnumType, StructType};

    fn seed_pair(
        source: impl FnOnce(&mut Registry),
        target: impl FnOnce(&mut Registry),
    ) -> MigrationSeed {
        let mut source_registry = Registry::new();
        source(&mut source_registry);
        let mut target_registry = Registry::new();
        target(&mut target_registry);
        MigrationSeed::build(Arc::new(source_registry), Arc::new(target_registry))
    }

    #[test]
    fn test_identity_program_is_single_copy() {
        let build = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "point_t",
                8,
                4,
                vec![
                    Field::new("x", 0, 4, FieldLayout::Floating),
                    Field::new("y", 4, 4, FieldLayout::Floating),
                ],
            ));
        };

        let migrator = StructMigrator::build(seed_pair(build, build));
        let program = migrator.program(Name::intern("point_t")).unwrap();
        assert_eq!(
            program.copy,
            vec![CopyCmd {
                src_offset: 0,
                dst_offset: 0,
                size: 8,
                condition: None
            }]
        );
        assert!(program.adapt_numeric.is_empty());
        assert!(program.set_zero.is_empty());
    }

    #[test]
    fn test_copy_coalescing_is_maximal() {
        // Same layout but target is larger, forcing per-field emission where
        // the first two fields still abut in both images.
        let source = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "packet_t",
                12,
                4,
                vec![
                    Field::new("a", 0, 4, FieldLayout::UnsignedInt),
                    Field::new("b", 4, 4, FieldLayout::UnsignedInt),
                    Field::new("c", 8, 4, FieldLayout::UnsignedInt),
                ],
            ));
        };
        let target = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "packet_t",
                16,
                8,
                vec![
                    Field::new("a", 0, 4, FieldLayout::UnsignedInt),
                    Field::new("b", 4, 4, FieldLayout::UnsignedInt),
                    Field::new("c", 8, 8, FieldLayout::UnsignedInt),
                ],
            ));
        };

        let migrator = StructMigrator::build(seed_pair(source, target));
        let program = migrator.program(Name::intern("packet_t")).unwrap();

        // a and b coalesce into one copy; c widens through adapt-numeric.
        assert_eq!(
            program.copy,
            vec![CopyCmd {
                src_offset: 0,
                dst_offset: 0,
                size: 8,
                condition: None
            }]
        );
        assert_eq!(program.adapt_numeric.len(), 1);
        let widen = program.adapt_numeric[0];
        assert_eq!((widen.src_offset, widen.dst_offset), (8, 8));
        assert_eq!((widen.src_size, widen.dst_size), (4, 8));

        // Coalescing must be maximal: no adjacent same-condition pair abuts.
        for pair in program.copy.windows(2) {
            let abuts = pair[0].src_offset + pair[0].size == pair[1].src_offset
                && pair[0].dst_offset + pair[0].size == pair[1].dst_offset
                && pair[0].condition == pair[1].condition;
            assert!(!abuts);
        }
    }

    #[test]
    fn test_condition_parents_precede_children() {
        let source = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "inner_t",
                8,
                4,
                vec![
                    Field::new("mode", 0, 4, FieldLayout::UnsignedInt),
                    Field::new("extra", 4, 4, FieldLayout::UnsignedInt)
                        .with_visibility("mode", vec![1]),
                ],
            ));
            registry.add_struct(StructType::new(
                "outer_t",
                16,
                4,
                vec![
                    Field::new("kind", 0, 4, FieldLayout::UnsignedInt),
                    Field::new(
                        "payload",
                        4,
                        8,
                        FieldLayout::Struct {
                            type_name: Name::intern("inner_t"),
                        },
                    )
                    .with_visibility("kind", vec![2]),
                    Field::new("tail", 12, 4, FieldLayout::UnsignedInt),
                ],
            ));
        };
        // Shifted target layout forces per-field programs everywhere.
        let target = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "inner_t",
                12,
                4,
                vec![
                    Field::new("mode", 0, 4, FieldLayout::UnsignedInt),
                    Field::new("extra", 8, 4, FieldLayout::UnsignedInt)
                        .with_visibility("mode", vec![1]),
                ],
            ));
            registry.add_struct(StructType::new(
                "outer_t",
                20,
                4,
                vec![
                    Field::new("kind", 0, 4, FieldLayout::UnsignedInt),
                    Field::new(
                        "payload",
                        4,
                        12,
                        FieldLayout::Struct {
                            type_name: Name::intern("inner_t"),
                        },
                    )
                    .with_visibility("kind", vec![2]),
                    Field::new("tail", 16, 4, FieldLayout::UnsignedInt),
                ],
            ));
        };

        let migrator = StructMigrator::build(seed_pair(source, target));
        let program = migrator.program(Name::intern("outer_t")).unwrap();

        assert_eq!(program.conditions.len(), 2);
        // Outer condition on "kind" at offset 0, imported inner condition on
        // "mode" rebased to the payload offset with the outer as parent.
        assert_eq!(program.conditions[0].src_offset, 0);
        assert_eq!(program.conditions[0].parent, None);
        assert_eq!(program.conditions[1].src_offset, 4);
        assert_eq!(program.conditions[1].parent, Some(0));

        for (index, condition) in program.conditions.iter().enumerate() {
            if let Some(parent) = condition.parent {
                assert!((parent as usize) < index);
            }
        }
    }

    #[test]
    fn test_pointer_transfer_emits_copy_and_zero() {
        let source = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "holder_t",
                16,
                8,
                vec![
                    Field::new("blob", 0, 8, FieldLayout::ExternalPointer),
                    Field::new("len", 8, 8, FieldLayout::UnsignedInt),
                ],
            ));
        };
        let target = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "holder_t",
                24,
                8,
                vec![
                    Field::new("blob", 0, 8, FieldLayout::ExternalPointer),
                    Field::new("len", 16, 8, FieldLayout::UnsignedInt),
                ],
            ));
        };

        let migrator = StructMigrator::build(seed_pair(source, target));
        let program = migrator.program(Name::intern("holder_t")).unwrap();
        assert_eq!(program.set_zero.len(), 1);
        assert_eq!(program.set_zero[0].src_offset, 0);
        assert_eq!(program.set_zero[0].size, 8);

        let mut src = [0u8; 16];
        src[..8].copy_from_slice(&0xDEAD_BEEFusize.to_ne_bytes());
        src[8..].copy_from_slice(&7u64.to_ne_bytes());
        let mut dst = [0u8; 24];

        assert!(migrator.migrate_instance(Name::intern("holder_t"), &mut src, &mut dst));
        assert_eq!(&dst[..8], &0xDEAD_BEEFusize.to_ne_bytes());
        assert_eq!(&dst[16..24], &7u64.to_ne_bytes());
        // Ownership moved: source pointer slot is zeroed.
        assert_eq!(&src[..8], &[0u8; 8]);
    }

    #[test]
    fn test_missing_program_is_soft_failure() {
        let seed = seed_pair(|_| {}, |_| {});
        let migrator = StructMigrator::build(seed);
        let mut src = [0u8; 4];
        let mut dst = [0u8; 4];
        assert!(!migrator.migrate_instance(Name::intern("ghost_t"), &mut src, &mut dst));
    }

    #[test]
    fn test_inline_array_migrates_min_extent() {
        let source = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "lut_t",
                16,
                4,
                vec![Field::new(
                    "slots",
                    0,
                    16,
                    FieldLayout::InlineArray {
                        item: ItemLayout::UnsignedInt,
                        item_size: 4,
                        item_count: 4,
                    },
                )],
            ));
        };
        let target = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "lut_t",
                8,
                4,
                vec![Field::new(
                    "slots",
                    0,
                    8,
                    FieldLayout::InlineArray {
                        item: ItemLayout::UnsignedInt,
                        item_size: 4,
                        item_count: 2,
                    },
                )],
            ));
        };

        let migrator = StructMigrator::build(seed_pair(source, target));
        let mut src = [0u8; 16];
        for (slot, value) in [10u32, 20, 30, 40].iter().enumerate() {
            src[slot * 4..slot * 4 + 4].copy_from_slice(&value.to_ne_bytes());
        }
        let mut dst = [0u8; 8];
        migrator.migrate_instance(Name::intern("lut_t"), &mut src, &mut dst);

        assert_eq!(u32::from_ne_bytes(dst[0..4].try_into().unwrap()), 10);
        assert_eq!(u32::from_ne_bytes(dst[4..8].try_into().unwrap()), 20);
    }

    #[test]
    fn test_enum_field_with_needed_seed_uses_adapt() {
        let source = |registry: &mut Registry| {
            registry.add_enum(EnumType::new("state_t", false, vec![("idle", 0), ("busy", 1)]));
            registry.add_struct(StructType::new(
                "task_t",
                4,
                4,
                vec![Field::new(
                    "state",
                    0,
                    4,
                    FieldLayout::Enum {
                        type_name: Name::intern("state_t"),
                    },
                )],
            ));
        };
        let target = |registry: &mut Registry| {
            registry.add_enum(EnumType::new("state_t", false, vec![("busy", 0), ("idle", 1)]));
            registry.add_struct(StructType::new(
                "task_t",
                4,
                4,
                vec![Field::new(
                    "state",
                    0,
                    4,
                    FieldLayout::Enum {
                        type_name: Name::intern("state_t"),
                    },
                )],
            ));
        };

        let migrator = StructMigrator::build(seed_pair(source, target));
        let program = migrator.program(Name::intern("task_t")).unwrap();
        assert!(program.copy.is_empty());
        assert_eq!(program.adapt_enum.len(), 1);

        let mut src = 0i32.to_ne_bytes(); // idle
        let mut dst = [0u8; 4];
        migrator.migrate_instance(Name::intern("task_t"), &mut src, &mut dst);
        assert_eq!(i32::from_ne_bytes(dst), 1); // idle in the new value space
    }
}
