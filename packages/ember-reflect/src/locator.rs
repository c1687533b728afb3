//! Field locator (component B)
//!
//! Resolves dotted field paths inside registered struct layouts to
//! `(field, absolute offset, size with padding)`. Feeds the patch builder with
//! absolute offsets and serialization diagnostics with padded extents.

use crate::interner::Name;
use crate::registry::Registry;
use crate::types::{Field, FieldLayout, StructType};
use std::sync::Arc;
use tracing::warn;

/// Result of a successful path resolution
#[derive(Debug, Clone)]
pub struct FieldLookup {
    /// Struct that declares the resolved field
    pub owner: Arc<StructType>,
    /// Index of the resolved field inside `owner.fields`
    pub field_index: usize,
    /// Offset of the field from the start of the root struct
    pub absolute_offset: u32,
    /// Extent up to the next field at a higher offset (or the struct end)
    pub size_with_padding: u32,
}

impl FieldLookup {
    pub fn field(&self) -> &Field {
        &self.owner.fields[self.field_index]
    }
}

/// Resolve a dotted field path within `struct_name`
///
/// Each path element selects a field; intermediate elements must have struct
/// archetype. Pointers and arrays stop traversal - their data either leaves
/// the local layout or has no statically resolvable element offsets. Fields
/// sharing an offset (union members) are skipped when computing the padded
/// extent.
pub fn query_local_field(registry: &Registry, struct_name: Name, path: &[Name]) -> Option<FieldLookup> {
    if path.is_empty() {
        return None;
    }

    let mut current = match registry.query_struct(struct_name) {
        Some(descriptor) => descriptor.clone(),
        None => {
            warn!(name = %struct_name, "struct is not registered");
            return None;
        }
    };

    let mut absolute_offset = 0u32;
    let mut size_with_padding = current.size;
    let mut resolved_index = 0usize;
    let mut resolved_owner = current.clone();

    for (depth, &element) in path.iter().enumerate() {
        let (field_index, field_offset, field_size, field_layout) = match current.field(element) {
            Some((index, field)) => (index, field.offset, field.size, field.layout.clone()),
            None => {
                warn!(field = %element, owner = %current.name, "unable to find field");
                return None;
            }
        };

        // Extent runs to the next field at a higher offset; union members at
        // the same offset do not bound the layout.
        let mut element_extent = 0u32;
        for next in &current.fields[field_index + 1..] {
            if next.offset > field_offset {
                element_extent = next.offset - field_offset;
                break;
            }
        }

        if element_extent == 0 {
            element_extent = size_with_padding - field_offset;
        }

        debug_assert!(element_extent >= field_size);
        size_with_padding = element_extent;
        absolute_offset += field_offset;
        resolved_index = field_index;
        resolved_owner = current.clone();

        if depth + 1 == path.len() {
            break;
        }

        match field_layout {
            FieldLayout::Struct { type_name } => {
                current = match registry.query_struct(type_name) {
                    Some(descriptor) => descriptor.clone(),
                    None => {
                        warn!(name = %type_name, "struct is not registered");
                        return None;
                    }
                };
            }
            FieldLayout::ExternalPointer
            | FieldLayout::StructPointer { .. }
            | FieldLayout::DynamicArray { .. } => {
                warn!(
                    field = %element,
                    owner = %current.name,
                    "cannot descend into field: data leaves the local layout"
                );
                return None;
            }
            FieldLayout::InlineArray { .. } => {
                warn!(
                    field = %element,
                    owner = %current.name,
                    "cannot descend into inline array fields"
                );
                return None;
            }
            _ => {
                warn!(
                    field = %element,
                    owner = %current.name,
                    "cannot descend into field with basic archetype"
                );
                return None;
            }
        }
    }

    Some(FieldLookup {
        owner: resolved_owner,
        field_index: resolved_index,
        absolute_offset,
        size_with_padding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Field, StructType};

    fn names(path: &[&str]) -> Vec<Name> {
        path.iter().map(|p| Name::intern(p)).collect()
    }

    fn registry_with_nested() -> Registry {
        let mut registry = Registry::new();
        registry.add_struct(StructType::new(
            "vector2_t",
            8,
            4,
            vec![
                Field::new("x", 0, 4, FieldLayout::Floating),
                Field::new("y", 4, 4, FieldLayout::Floating),
            ],
        ));
        registry.add_struct(StructType::new(
            "body_t",
            24,
            8,
            vec![
                Field::new(
                    "position",
                    0,
                    8,
                    FieldLayout::Struct {
                        type_name: Name::intern("vector2_t"),
                    },
                ),
                Field::new("mass", 8, 4, FieldLayout::Floating),
                Field::new("flags", 16, 8, FieldLayout::UnsignedInt),
            ],
        ));
        registry
    }

    #[test]
    fn test_single_element_path() {
        let registry = registry_with_nested();
        let lookup =
            query_local_field(&registry, Name::intern("body_t"), &names(&["mass"])).unwrap();
        assert_eq!(lookup.absolute_offset, 8);
        // mass pads up to flags at offset 16
        assert_eq!(lookup.size_with_padding, 8);
        assert_eq!(lookup.field().name.as_str(), "mass");
    }

    #[test]
    fn test_nested_path_accumulates_offsets() {
        let registry = registry_with_nested();
        let lookup =
            query_local_field(&registry, Name::intern("body_t"), &names(&["position", "y"]))
                .unwrap();
        assert_eq!(lookup.absolute_offset, 4);
        assert_eq!(lookup.size_with_padding, 4);
        assert_eq!(lookup.owner.name.as_str(), "vector2_t");
    }

    #[test]
    fn test_tail_field_extent_runs_to_struct_end() {
        let registry = registry_with_nested();
        let lookup =
            query_local_field(&registry, Name::intern("body_t"), &names(&["flags"])).unwrap();
        assert_eq!(lookup.absolute_offset, 16);
        assert_eq!(lookup.size_with_padding, 8);
    }

    #[test]
    fn test_union_members_do_not_bound_extent() {
        let mut registry = Registry::new();
        registry.add_struct(StructType::new(
            "variant_t",
            16,
            8,
            vec![
                Field::new("tag", 0, 4, FieldLayout::UnsignedInt),
                Field::new("as_int", 8, 8, FieldLayout::SignedInt),
                Field::new("as_float", 8, 8, FieldLayout::Floating),
            ],
        ));

        let lookup =
            query_local_field(&registry, Name::intern("variant_t"), &names(&["as_int"])).unwrap();
        // as_float shares the offset, so the extent runs to the struct end.
        assert_eq!(lookup.size_with_padding, 8);

        let tag =
            query_local_field(&registry, Name::intern("variant_t"), &names(&["tag"])).unwrap();
        assert_eq!(tag.size_with_padding, 8);
    }

    #[test]
    fn test_missing_field_fails() {
        let registry = registry_with_nested();
        assert!(query_local_field(&registry, Name::intern("body_t"), &names(&["ghost"])).is_none());
    }

    #[test]
    fn test_descent_through_basic_archetype_fails() {
        let registry = registry_with_nested();
        assert!(
            query_local_field(&registry, Name::intern("body_t"), &names(&["mass", "x"])).is_none()
        );
    }
}
