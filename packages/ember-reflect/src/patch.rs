//! Patch builder and compiled patches (component C)
//!
//! A patch builder accepts out-of-order `(offset, bytes)` chunks and compiles
//! them into a sorted, merged overlay tagged with a struct type. Compiled
//! patches are linked into their owning registry so migration can walk them.
//!
//! Offsets and chunk sizes must fit in 16 bits; adjacent contiguous chunks are
//! merged into one node at build time.

use crate::error::{ReflectError, Result};
use crate::interner::Name;
use crate::registry::{PatchHandle, Registry};
use crate::types::StructType;
use std::sync::Arc;
use tracing::error;

struct BuilderChunk {
    offset: u16,
    bytes: Vec<u8>,
}

/// Grow-only chunk stream compiled into a patch by [`PatchBuilder::build`]
#[derive(Default)]
pub struct PatchBuilder {
    chunks: Vec<BuilderChunk>,
}

/// One merged node of a compiled patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeSpan {
    pub offset: u16,
    pub len: u16,
    pub start: u32,
}

/// Compiled patch payload: contiguous blob plus ordered node spans
pub struct PatchData {
    pub(crate) struct_type: Arc<StructType>,
    pub(crate) spans: Box<[NodeSpan]>,
    pub(crate) blob: Box<[u8]>,
}

impl PatchData {
    /// Struct type the patch was built against
    pub fn type_name(&self) -> Name {
        self.struct_type.name
    }

    pub fn node_count(&self) -> usize {
        self.spans.len()
    }

    /// Iterate `(offset, bytes)` for every compiled node in ascending order
    pub fn chunks(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.spans.iter().map(|span| {
            let begin = span.start as usize;
            let end = begin + span.len as usize;
            (span.offset, &self.blob[begin..end])
        })
    }

    /// Copy every node into `target` at its offset
    pub fn apply(&self, target: &mut [u8]) {
        for (offset, bytes) in self.chunks() {
            let begin = offset as usize;
            target[begin..begin + bytes.len()].copy_from_slice(bytes);
        }
    }

    pub(crate) fn node_bytes(&self, node: usize) -> &[u8] {
        let span = self.spans[node];
        &self.blob[span.start as usize..span.start as usize + span.len as usize]
    }

    pub(crate) fn node_offset(&self, node: usize) -> u32 {
        self.spans[node].offset as u32
    }
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    /// Append a chunk; insertion order is preserved until build time
    pub fn add_chunk(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        if offset >= u16::MAX as u32 || bytes.len() >= u16::MAX as usize {
            return Err(ReflectError::patch_build(format!(
                "chunk at offset {offset} with size {} does not fit the node header",
                bytes.len()
            )));
        }

        self.chunks.push(BuilderChunk {
            offset: offset as u16,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    /// Append a chunk addressed by a dotted field path of `struct_name`
    ///
    /// Resolves the path through the registry and targets the field's
    /// absolute offset; the payload must fit the field's padded extent.
    pub fn add_field_chunk(
        &mut self,
        registry: &Registry,
        struct_name: Name,
        path: &[Name],
        bytes: &[u8],
    ) -> Result<()> {
        let lookup = crate::locator::query_local_field(registry, struct_name, path).ok_or_else(|| {
            ReflectError::patch_build(format!(
                "cannot resolve field path inside struct {struct_name}"
            ))
        })?;

        if bytes.len() as u32 > lookup.size_with_padding {
            return Err(ReflectError::patch_build(format!(
                "payload of {} bytes does not fit field {} of {struct_name}",
                bytes.len(),
                lookup.field().name
            )));
        }

        self.add_chunk(lookup.absolute_offset, bytes)
    }

    /// Number of buffered chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Drop buffered chunks without building
    pub fn reset(&mut self) {
        self.chunks.clear();
    }

    /// Compile buffered chunks into a patch linked into `registry`
    ///
    /// Chunks are stably sorted by offset, rejected on overlap and merged when
    /// contiguous. The builder is reset whether the build succeeds or fails.
    pub fn build(&mut self, registry: &Registry, type_name: Name) -> Result<PatchHandle> {
        let struct_type = match registry.query_struct(type_name) {
            Some(descriptor) => descriptor.clone(),
            None => {
                self.reset();
                return Err(ReflectError::patch_build(format!(
                    "cannot build patch for unregistered struct {type_name}"
                )));
            }
        };

        let mut order: Vec<usize> = (0..self.chunks.len()).collect();
        order.sort_by_key(|&index| self.chunks[index].offset);

        // Reject overlaps before writing anything.
        for pair in order.windows(2) {
            let previous = &self.chunks[pair[0]];
            let next = &self.chunks[pair[1]];
            if previous.offset as usize + previous.bytes.len() > next.offset as usize {
                self.reset();
                error!(type_name = %type_name, "found overlapping chunks");
                return Err(ReflectError::patch_build("found overlapping chunks"));
            }
        }

        let mut spans: Vec<NodeSpan> = Vec::new();
        let mut blob: Vec<u8> = Vec::new();

        for &index in &order {
            let chunk = &self.chunks[index];
            let contiguous = spans
                .last()
                .is_some_and(|span| span.offset as usize + span.len as usize == chunk.offset as usize);

            if contiguous {
                let span = spans.last_mut().expect("checked non-empty");
                span.len += chunk.bytes.len() as u16;
            } else {
                spans.push(NodeSpan {
                    offset: chunk.offset,
                    len: chunk.bytes.len() as u16,
                    start: blob.len() as u32,
                });
            }

            blob.extend_from_slice(&chunk.bytes);
        }

        let data = PatchData {
            struct_type,
            spans: spans.into_boxed_slice(),
            blob: blob.into_boxed_slice(),
        };

        #[cfg(debug_assertions)]
        validate_patch(registry, &data);

        self.reset();
        Ok(registry.attach_patch(Arc::new(data)))
    }
}

/// Debug-only structural validation: every node must target primitives,
/// interned strings, enums, structs (recursively) or inline arrays of those.
/// Pointers, dynamic arrays and nested patches are not patchable.
#[cfg(debug_assertions)]
fn validate_patch(registry: &Registry, data: &PatchData) {
    for span in data.spans.iter() {
        validate_node_against(
            registry,
            &data.struct_type,
            0,
            span.offset as u32,
            span.len as u32,
        );
    }
}

#[cfg(debug_assertions)]
fn validate_node_against(
    registry: &Registry,
    struct_type: &StructType,
    base_offset: u32,
    node_offset: u32,
    node_len: u32,
) {
    use crate::types::{FieldLayout, ItemLayout};

    for field in &struct_type.fields {
        let field_begin = base_offset + field.offset;
        if field_begin >= node_offset + node_len {
            return;
        }

        let field_end = field_begin + field.size;
        if field_end < node_offset {
            continue;
        }

        match &field.layout {
            FieldLayout::SignedInt
            | FieldLayout::UnsignedInt
            | FieldLayout::Floating
            | FieldLayout::InternedString
            | FieldLayout::Enum { .. } => {}

            FieldLayout::Struct { type_name } => {
                if let Some(nested) = registry.query_struct(*type_name) {
                    validate_node_against(registry, nested, field_begin, node_offset, node_len);
                }
            }

            FieldLayout::InlineArray {
                item,
                item_size,
                item_count,
            } => match item {
                ItemLayout::SignedInt
                | ItemLayout::UnsignedInt
                | ItemLayout::Floating
                | ItemLayout::InternedString
                | ItemLayout::Enum { .. } => {}
                ItemLayout::Struct { type_name } => {
                    if let Some(nested) = registry.query_struct(*type_name) {
                        for element in 0..*item_count {
                            validate_node_against(
                                registry,
                                nested,
                                field_begin + element * item_size,
                                node_offset,
                                node_len,
                            );
                        }
                    }
                }
                _ => {
                    debug_assert!(
                        false,
                        "patch node covers unsupported inline array element in {}",
                        field.name
                    );
                }
            },

            FieldLayout::StringPointer
            | FieldLayout::ExternalPointer
            | FieldLayout::StructPointer { .. }
            | FieldLayout::DynamicArray { .. }
            | FieldLayout::Patch => {
                debug_assert!(
                    false,
                    "patch node covers non-patchable field {} of {}",
                    field.name, struct_type.name
                );
            }
        }
    }
}
