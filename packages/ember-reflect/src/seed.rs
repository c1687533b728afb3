//! Migration seed (component D)
//!
//! Pure comparison of two registries: classifies every source enum and struct
//! as `NotNeeded`, `Needed` or `Removed` and builds per-type remap tables that
//! the struct migrator compiles into command programs.

use crate::interner::Name;
use crate::registry::Registry;
use crate::types::{EnumType, Field, FieldLayout, ItemLayout, StructType};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::{error, warn};

/// Classification of a type's evolution between two registries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Byte-identical, a plain copy suffices
    NotNeeded,
    /// Layout or values changed, adaptation commands required
    Needed,
    /// Absent in the target registry
    Removed,
}

/// Per-enum seed: status plus source-value -> target-value index remap
#[derive(Debug, Clone)]
pub struct EnumSeed {
    pub status: MigrationStatus,
    /// Indexed by source value ordinal; holds the target value ordinal.
    /// Missing target values fall back to ordinal 0 (logged at build time).
    pub value_remap: Vec<usize>,
}

/// Per-struct seed: status plus source-field -> target-field index remap
#[derive(Debug, Clone)]
pub struct StructSeed {
    pub status: MigrationStatus,
    /// Indexed by source field ordinal; `None` when the field is unmappable.
    pub field_remap: Vec<Option<usize>>,
}

/// Pre-computed classification of every type between two registries
pub struct MigrationSeed {
    source: Arc<Registry>,
    target: Arc<Registry>,
    enums: FxHashMap<Name, EnumSeed>,
    structs: FxHashMap<Name, StructSeed>,
}

impl MigrationSeed {
    /// Compare `source` against `target`, classifying every source type
    pub fn build(source: Arc<Registry>, target: Arc<Registry>) -> Self {
        let mut seed = Self {
            source,
            target,
            enums: FxHashMap::default(),
            structs: FxHashMap::default(),
        };

        let enum_names: Vec<Name> = seed.source.enums().map(|e| e.name).collect();
        for name in enum_names {
            let descriptor = seed.source.query_enum(name).expect("iterated name").clone();
            let node = seed.classify_enum(&descriptor);
            seed.enums.insert(name, node);
        }

        let struct_names: Vec<Name> = seed.source.structs().map(|s| s.name).collect();
        let mut in_progress = FxHashSet::default();
        for name in struct_names {
            if !seed.structs.contains_key(&name) {
                seed.request_struct(name, &mut in_progress);
            }
        }

        seed
    }

    pub fn enum_seed(&self, name: Name) -> Option<&EnumSeed> {
        self.enums.get(&name)
    }

    pub fn struct_seed(&self, name: Name) -> Option<&StructSeed> {
        self.structs.get(&name)
    }

    pub fn source_registry(&self) -> &Arc<Registry> {
        &self.source
    }

    pub fn target_registry(&self) -> &Arc<Registry> {
        &self.target
    }

    fn classify_enum(&self, source_enum: &EnumType) -> EnumSeed {
        let target_enum = match self.target.query_enum(source_enum.name) {
            Some(found) => found,
            None => {
                return EnumSeed {
                    status: MigrationStatus::Removed,
                    value_remap: Vec::new(),
                }
            }
        };

        let mut status = if source_enum.is_flags == target_enum.is_flags {
            MigrationStatus::NotNeeded
        } else {
            MigrationStatus::Needed
        };

        let mut value_remap = Vec::with_capacity(source_enum.values.len());
        for source_value in &source_enum.values {
            match target_enum.value_by_name(source_value.name) {
                Some((target_index, target_value)) => {
                    if target_value.value != source_value.value {
                        status = MigrationStatus::Needed;
                    }
                    value_remap.push(target_index);
                }
                None => {
                    warn!(
                        value = %source_value.name,
                        enum_name = %source_enum.name,
                        fallback = %target_enum.values[0].name,
                        "failed to find replacement target for enum value"
                    );
                    status = MigrationStatus::Needed;
                    value_remap.push(0);
                }
            }
        }

        EnumSeed { status, value_remap }
    }

    /// Fetch or build the seed node for a struct. Requests hitting a struct
    /// that is currently being classified (self-referential chains) are
    /// answered without descending.
    fn request_struct(&mut self, name: Name, in_progress: &mut FxHashSet<Name>) -> MigrationStatus {
        if let Some(existing) = self.structs.get(&name) {
            return existing.status;
        }

        let source_struct = match self.source.query_struct(name) {
            Some(found) => found.clone(),
            None => {
                error!(name = %name, "unable to find source struct, corrupted source registry?");
                debug_assert!(false, "unreachable source struct {name}");
                return MigrationStatus::Removed;
            }
        };

        in_progress.insert(name);
        let node = self.classify_struct(&source_struct, in_progress);
        in_progress.remove(&name);

        let status = node.status;
        self.structs.insert(name, node);
        status
    }

    fn classify_struct(
        &mut self,
        source_struct: &StructType,
        in_progress: &mut FxHashSet<Name>,
    ) -> StructSeed {
        let target_struct = match self.target.query_struct(source_struct.name) {
            Some(found) => found.clone(),
            None => {
                return StructSeed {
                    status: MigrationStatus::Removed,
                    field_remap: Vec::new(),
                }
            }
        };

        let mut status = if source_struct.size == target_struct.size
            && source_struct.alignment == target_struct.alignment
            && source_struct.fields.len() == target_struct.fields.len()
        {
            MigrationStatus::NotNeeded
        } else {
            MigrationStatus::Needed
        };

        let mut field_remap = Vec::with_capacity(source_struct.fields.len());
        for source_field in &source_struct.fields {
            let target_entry = target_struct.field(source_field.name);
            let mapped = match target_entry {
                Some((target_index, target_field)) => {
                    if self.check_field_mappable(source_field, target_field, &mut status, in_progress) {
                        if source_field.size != target_field.size
                            || source_field.offset != target_field.offset
                        {
                            status = MigrationStatus::Needed;
                        }
                        Some(target_index)
                    } else {
                        status = MigrationStatus::Needed;
                        None
                    }
                }
                None => {
                    status = MigrationStatus::Needed;
                    None
                }
            };

            field_remap.push(mapped);
        }

        StructSeed { status, field_remap }
    }

    fn check_field_mappable(
        &mut self,
        source_field: &Field,
        target_field: &Field,
        status: &mut MigrationStatus,
        in_progress: &mut FxHashSet<Name>,
    ) -> bool {
        if source_field.layout.archetype() != target_field.layout.archetype() {
            return false;
        }

        match (&source_field.layout, &target_field.layout) {
            (FieldLayout::SignedInt, _)
            | (FieldLayout::UnsignedInt, _)
            | (FieldLayout::Floating, _)
            | (FieldLayout::StringPointer, _)
            | (FieldLayout::InternedString, _)
            | (FieldLayout::ExternalPointer, _)
            | (FieldLayout::StructPointer { .. }, _)
            | (FieldLayout::Patch, _) => true,

            (
                FieldLayout::Enum { type_name: source },
                FieldLayout::Enum { type_name: target },
            ) => self.check_enum_mappable(*source, *target, status),

            (
                FieldLayout::Struct { type_name: source },
                FieldLayout::Struct { type_name: target },
            ) => self.check_struct_mappable(*source, *target, status, in_progress),

            (
                FieldLayout::InlineArray {
                    item: source_item,
                    item_size: source_item_size,
                    item_count: source_count,
                },
                FieldLayout::InlineArray {
                    item: target_item,
                    item_size: target_item_size,
                    item_count: target_count,
                },
            ) => {
                let mappable =
                    self.check_item_mappable(source_item, target_item, status, in_progress);
                if source_item_size != target_item_size || source_count != target_count {
                    *status = MigrationStatus::Needed;
                }
                mappable
            }

            (
                FieldLayout::DynamicArray {
                    item: source_item,
                    item_size: source_item_size,
                },
                FieldLayout::DynamicArray {
                    item: target_item,
                    item_size: target_item_size,
                },
            ) => {
                let mappable =
                    self.check_item_mappable(source_item, target_item, status, in_progress);
                if source_item_size != target_item_size {
                    *status = MigrationStatus::Needed;
                }
                mappable
            }

            _ => false,
        }
    }

    fn check_item_mappable(
        &mut self,
        source_item: &ItemLayout,
        target_item: &ItemLayout,
        status: &mut MigrationStatus,
        in_progress: &mut FxHashSet<Name>,
    ) -> bool {
        if source_item.archetype() != target_item.archetype() {
            return false;
        }

        match (source_item, target_item) {
            (ItemLayout::Enum { type_name: source }, ItemLayout::Enum { type_name: target }) => {
                self.check_enum_mappable(*source, *target, status)
            }
            (ItemLayout::Struct { type_name: source }, ItemLayout::Struct { type_name: target }) => {
                self.check_struct_mappable(*source, *target, status, in_progress)
            }
            _ => true,
        }
    }

    fn check_enum_mappable(
        &self,
        source_name: Name,
        target_name: Name,
        status: &mut MigrationStatus,
    ) -> bool {
        if source_name != target_name {
            return false;
        }

        match self.enums.get(&source_name) {
            Some(node) => match node.status {
                MigrationStatus::Needed => *status = MigrationStatus::Needed,
                MigrationStatus::NotNeeded => {}
                MigrationStatus::Removed => {
                    error!(
                        name = %source_name,
                        "enum is marked removed in migration, but still referenced by target type"
                    );
                }
            },
            None => {
                error!(name = %source_name, "unable to find migrated enum");
            }
        }

        true
    }

    fn check_struct_mappable(
        &mut self,
        source_name: Name,
        target_name: Name,
        status: &mut MigrationStatus,
        in_progress: &mut FxHashSet<Name>,
    ) -> bool {
        if source_name != target_name {
            return false;
        }

        // A request that lands on a struct currently being classified is a
        // self-referential chain; allow the field without descending.
        if in_progress.contains(&source_name) {
            return true;
        }

        match self.request_struct(source_name, in_progress) {
            MigrationStatus::Needed => *status = MigrationStatus::Needed,
            MigrationStatus::NotNeeded => {}
            MigrationStatus::Removed => {
                error!(
                    name = %source_name,
                    "struct is marked removed in migration, but still referenced by target type"
                );
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnumType, Field, StructType};

    fn registry(build: impl FnOnce(&mut Registry)) -> Arc<Registry> {
        let mut registry = Registry::new();
        build(&mut registry);
        Arc::new(registry)
    }

    fn simple_struct(name: &str, fields: Vec<Field>, size: u32) -> StructType {
        StructType::new(name, size, 4, fields)
    }

    #[test]
    fn test_identical_registries_not_needed() {
        let build = |registry: &mut Registry| {
            registry.add_enum(EnumType::new("color_t", false, vec![("red", 0), ("blue", 1)]));
            registry.add_struct(simple_struct(
                "sprite_t",
                vec![
                    Field::new("width", 0, 4, FieldLayout::UnsignedInt),
                    Field::new(
                        "tint",
                        4,
                        4,
                        FieldLayout::Enum {
                            type_name: Name::intern("color_t"),
                        },
                    ),
                ],
                8,
            ));
        };

        let seed = MigrationSeed::build(registry(build), registry(build));
        assert_eq!(
            seed.enum_seed(Name::intern("color_t")).unwrap().status,
            MigrationStatus::NotNeeded
        );
        let sprite = seed.struct_seed(Name::intern("sprite_t")).unwrap();
        assert_eq!(sprite.status, MigrationStatus::NotNeeded);
        assert_eq!(sprite.field_remap, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_enum_reorder_marked_needed() {
        let source = registry(|r| {
            r.add_enum(EnumType::new("color_t", false, vec![("red", 0), ("blue", 1)]));
        });
        let target = registry(|r| {
            r.add_enum(EnumType::new("color_t", false, vec![("blue", 0), ("red", 1)]));
        });

        let seed = MigrationSeed::build(source, target);
        let node = seed.enum_seed(Name::intern("color_t")).unwrap();
        assert_eq!(node.status, MigrationStatus::Needed);
        // red -> target index 1, blue -> target index 0
        assert_eq!(node.value_remap, vec![1, 0]);
    }

    #[test]
    fn test_enum_missing_value_falls_back_to_first() {
        let source = registry(|r| {
            r.add_enum(EnumType::new("mode_t", false, vec![("legacy", 0), ("kept", 1)]));
        });
        let target = registry(|r| {
            r.add_enum(EnumType::new("mode_t", false, vec![("kept", 1), ("fresh", 2)]));
        });

        let seed = MigrationSeed::build(source, target);
        let node = seed.enum_seed(Name::intern("mode_t")).unwrap();
        assert_eq!(node.status, MigrationStatus::Needed);
        assert_eq!(node.value_remap, vec![0, 0]);
    }

    #[test]
    fn test_removed_types_classified() {
        let source = registry(|r| {
            r.add_enum(EnumType::new("gone_t", false, vec![("only", 0)]));
            r.add_struct(simple_struct(
                "gone_struct_t",
                vec![Field::new("a", 0, 4, FieldLayout::UnsignedInt)],
                4,
            ));
        });
        let target = registry(|_| {});

        let seed = MigrationSeed::build(source, target);
        assert_eq!(
            seed.enum_seed(Name::intern("gone_t")).unwrap().status,
            MigrationStatus::Removed
        );
        assert_eq!(
            seed.struct_seed(Name::intern("gone_struct_t")).unwrap().status,
            MigrationStatus::Removed
        );
    }

    #[test]
    fn test_widened_field_stays_mapped() {
        let source = registry(|r| {
            r.add_struct(simple_struct(
                "entity_t",
                vec![
                    Field::new("a", 0, 4, FieldLayout::SignedInt),
                    Field::new("b", 4, 4, FieldLayout::SignedInt),
                ],
                8,
            ));
        });
        let target = registry(|r| {
            r.add_struct(StructType::new(
                "entity_t",
                16,
                8,
                vec![
                    Field::new("a", 0, 8, FieldLayout::SignedInt),
                    Field::new("b", 8, 4, FieldLayout::SignedInt),
                ],
            ));
        });

        let seed = MigrationSeed::build(source, target);
        let node = seed.struct_seed(Name::intern("entity_t")).unwrap();
        assert_eq!(node.status, MigrationStatus::Needed);
        assert_eq!(node.field_remap, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_archetype_change_unmaps_field() {
        let source = registry(|r| {
            r.add_struct(simple_struct(
                "config_t",
                vec![Field::new("value", 0, 4, FieldLayout::SignedInt)],
                4,
            ));
        });
        let target = registry(|r| {
            r.add_struct(simple_struct(
                "config_t",
                vec![Field::new("value", 0, 4, FieldLayout::Floating)],
                4,
            ));
        });

        let seed = MigrationSeed::build(source, target);
        let node = seed.struct_seed(Name::intern("config_t")).unwrap();
        assert_eq!(node.status, MigrationStatus::Needed);
        assert_eq!(node.field_remap, vec![None]);
    }

    #[test]
    fn test_self_referential_dynamic_array_terminates() {
        let build = |registry: &mut Registry| {
            registry.add_struct(StructType::new(
                "tree_node_t",
                32,
                8,
                vec![
                    Field::new("value", 0, 8, FieldLayout::UnsignedInt),
                    Field::new(
                        "children",
                        8,
                        24,
                        FieldLayout::DynamicArray {
                            item: ItemLayout::Struct {
                                type_name: Name::intern("tree_node_t"),
                            },
                            item_size: 32,
                        },
                    ),
                ],
            ));
        };

        let seed = MigrationSeed::build(registry(build), registry(build));
        let node = seed.struct_seed(Name::intern("tree_node_t")).unwrap();
        assert_eq!(node.status, MigrationStatus::NotNeeded);
        assert_eq!(node.field_remap, vec![Some(0), Some(1)]);
    }
}
