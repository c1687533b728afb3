//! Deserialization scripts
//!
//! A script ("plan") is the flattened field walk for one registered struct,
//! compiled on first use and cached in the shared [`ScriptStorage`]. Nested
//! struct references stay symbolic so self-referential types (a struct with a
//! dynamic array of itself) resolve lazily at read time.

use crate::error::{ResourceError, Result};
use ember_reflect::{FieldLayout, ItemLayout, Name, Registry, StructType};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// One element of a serialized array; scalar width comes from the owning
/// array's item size
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanItem {
    Scalar,
    Enum,
    InternedString,
    Struct { type_name: Name },
}

/// One plan step, ordered by field declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOp {
    /// Integer or float value: `size` bytes little-endian on the wire
    Scalar { offset: u32, size: u32 },
    /// 4-byte enum value
    Enum { offset: u32 },
    /// Flagged string written into an 8-byte intern-id slot
    InternedString { offset: u32 },
    /// Nested struct, resolved through the script storage
    Struct { offset: u32, type_name: Name },
    InlineArray {
        offset: u32,
        item: PlanItem,
        item_size: u32,
        item_count: u32,
    },
    /// `u32` length followed by the elements; the buffer is heap-allocated
    /// and the in-instance header points at it
    DynamicArray {
        offset: u32,
        item: PlanItem,
        item_size: u32,
        item_align: u32,
    },
}

/// Compiled deserialization walk for one struct
#[derive(Debug)]
pub struct TypePlan {
    pub type_name: Name,
    pub struct_type: Arc<StructType>,
    pub ops: Vec<PlanOp>,
}

/// Shared cache of per-type plans compiled from a reflection registry
pub struct ScriptStorage {
    registry: Arc<Registry>,
    plans: Mutex<FxHashMap<Name, Arc<TypePlan>>>,
}

impl ScriptStorage {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            plans: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Fetch or compile the plan for a struct
    pub fn plan(&self, type_name: Name) -> Result<Arc<TypePlan>> {
        if let Some(existing) = self.plans.lock().get(&type_name) {
            return Ok(existing.clone());
        }

        let struct_type = self
            .registry
            .query_struct(type_name)
            .ok_or_else(|| {
                ResourceError::unknown_resource_type(format!(
                    "struct {type_name} is not registered"
                ))
            })?
            .clone();

        let compiled = Arc::new(compile_plan(&struct_type)?);
        self.plans
            .lock()
            .entry(type_name)
            .or_insert_with(|| compiled.clone());
        Ok(compiled)
    }
}

fn compile_plan(struct_type: &Arc<StructType>) -> Result<TypePlan> {
    let mut ops = Vec::with_capacity(struct_type.fields.len());

    for field in &struct_type.fields {
        let op = match &field.layout {
            FieldLayout::SignedInt | FieldLayout::UnsignedInt | FieldLayout::Floating => {
                PlanOp::Scalar {
                    offset: field.offset,
                    size: field.size,
                }
            }
            FieldLayout::Enum { .. } => PlanOp::Enum {
                offset: field.offset,
            },
            FieldLayout::InternedString => PlanOp::InternedString {
                offset: field.offset,
            },
            FieldLayout::Struct { type_name } => PlanOp::Struct {
                offset: field.offset,
                type_name: *type_name,
            },
            FieldLayout::InlineArray {
                item,
                item_size,
                item_count,
            } => PlanOp::InlineArray {
                offset: field.offset,
                item: compile_item(item, &field.name)?,
                item_size: *item_size,
                item_count: *item_count,
            },
            FieldLayout::DynamicArray { item, item_size } => PlanOp::DynamicArray {
                offset: field.offset,
                item: compile_item(item, &field.name)?,
                item_size: *item_size,
                item_align: item_alignment(item, *item_size),
            },
            FieldLayout::StringPointer
            | FieldLayout::ExternalPointer
            | FieldLayout::StructPointer { .. }
            | FieldLayout::Patch => {
                return Err(ResourceError::serialization(format!(
                    "field {} of {} has a non-serializable archetype",
                    field.name, struct_type.name
                )));
            }
        };

        ops.push(op);
    }

    Ok(TypePlan {
        type_name: struct_type.name,
        struct_type: struct_type.clone(),
        ops,
    })
}

fn compile_item(item: &ItemLayout, field_name: &Name) -> Result<PlanItem> {
    match item {
        ItemLayout::SignedInt | ItemLayout::UnsignedInt | ItemLayout::Floating => {
            Ok(PlanItem::Scalar)
        }
        ItemLayout::Enum { .. } => Ok(PlanItem::Enum),
        ItemLayout::InternedString => Ok(PlanItem::InternedString),
        ItemLayout::Struct { type_name } => Ok(PlanItem::Struct {
            type_name: *type_name,
        }),
        ItemLayout::StringPointer
        | ItemLayout::ExternalPointer
        | ItemLayout::StructPointer { .. }
        | ItemLayout::Patch => Err(ResourceError::serialization(format!(
            "array field {field_name} has a non-serializable element archetype"
        ))),
    }
}

fn item_alignment(item: &ItemLayout, item_size: u32) -> u32 {
    match item {
        ItemLayout::Enum { .. } => 4,
        ItemLayout::Struct { .. } => item_size.min(8).max(1),
        _ => item_size.max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_reflect::{Field, StructType};

    fn storage(build: impl FnOnce(&mut Registry)) -> Arc<ScriptStorage> {
        let mut registry = Registry::new();
        build(&mut registry);
        ScriptStorage::new(Arc::new(registry))
    }

    #[test]
    fn test_plan_follows_field_order() {
        let storage = storage(|r| {
            r.add_struct(StructType::new(
                "mesh_t",
                24,
                8,
                vec![
                    Field::new("vertex_count", 0, 4, FieldLayout::UnsignedInt),
                    Field::new("scale", 4, 4, FieldLayout::Floating),
                    Field::new("name", 8, 8, FieldLayout::InternedString),
                    Field::new("padding", 16, 8, FieldLayout::UnsignedInt),
                ],
            ));
        });

        let plan = storage.plan(Name::intern("mesh_t")).unwrap();
        assert_eq!(plan.ops.len(), 4);
        assert_eq!(plan.ops[0], PlanOp::Scalar { offset: 0, size: 4 });
        assert_eq!(plan.ops[2], PlanOp::InternedString { offset: 8 });
    }

    #[test]
    fn test_plan_is_cached() {
        let storage = storage(|r| {
            r.add_struct(StructType::new(
                "mesh_t",
                4,
                4,
                vec![Field::new("a", 0, 4, FieldLayout::UnsignedInt)],
            ));
        });

        let first = storage.plan(Name::intern("mesh_t")).unwrap();
        let second = storage.plan(Name::intern("mesh_t")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_pointer_fields_rejected() {
        let storage = storage(|r| {
            r.add_struct(StructType::new(
                "bad_t",
                8,
                8,
                vec![Field::new("raw", 0, 8, FieldLayout::ExternalPointer)],
            ));
        });

        assert!(storage.plan(Name::intern("bad_t")).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let storage = storage(|_| {});
        assert!(storage.plan(Name::intern("ghost_t")).is_err());
    }
}
