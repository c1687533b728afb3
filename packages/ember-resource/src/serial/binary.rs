//! Binary stream reader and writer
//!
//! The reader is step-driven: every [`BinaryReader::step`] consumes one leaf
//! value from the stream and writes it into the target container, so a load
//! operation can span many frames without holding locks. The writer is the
//! one-shot inverse used by resource build tooling and fixtures.

use crate::entry::ContainerCell;
use crate::error::{ResourceError, Result};
use crate::serial::script::{PlanItem, PlanOp, ScriptStorage, TypePlan};
use crate::serial::string_registry::StringRegistry;
use crate::serial::{RESOURCE_MAGIC, RESOURCE_VERSION};
use crate::vfs::ReadSeek;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ember_reflect::dynarray::{self, DynArrayHeader};
use ember_reflect::Name;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::error;

/// Progress state of a step-driven read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    InProgress,
    Finished,
    Failed,
}

// ---------------------------------------------------------------------------
// Type header
// ---------------------------------------------------------------------------

/// Write the stream prologue: magic, version, struct name
pub fn write_type_header(
    stream: &mut dyn Write,
    type_name: Name,
    registry: Option<&StringRegistry>,
) -> Result<()> {
    stream.write_u32::<LittleEndian>(RESOURCE_MAGIC)?;
    stream.write_u8(RESOURCE_VERSION)?;
    write_flagged_name(stream, type_name, registry)
}

/// Read and verify the stream prologue, returning the stored struct name
pub fn read_type_header<R: Read + ?Sized>(
    stream: &mut R,
    registry: Option<&StringRegistry>,
) -> Result<Name> {
    let magic = stream.read_u32::<LittleEndian>()?;
    if magic != RESOURCE_MAGIC {
        return Err(ResourceError::serialization(format!(
            "bad resource magic {magic:#x}"
        )));
    }

    let version = stream.read_u8()?;
    if version != RESOURCE_VERSION {
        return Err(ResourceError::serialization(format!(
            "unsupported resource version {version}"
        )));
    }

    read_flagged_name(stream, registry)
}

pub(crate) fn write_flagged_name(
    stream: &mut dyn Write,
    name: Name,
    registry: Option<&StringRegistry>,
) -> Result<()> {
    if let Some(slot) = registry.and_then(|table| table.find(name)) {
        stream.write_u8(1)?;
        stream.write_u32::<LittleEndian>(slot)?;
        return Ok(());
    }

    let text = name.as_str();
    stream.write_u8(0)?;
    stream.write_u16::<LittleEndian>(text.len() as u16)?;
    stream.write_all(text.as_bytes())?;
    Ok(())
}

pub(crate) fn read_flagged_name<R: Read + ?Sized>(
    stream: &mut R,
    registry: Option<&StringRegistry>,
) -> Result<Name> {
    match stream.read_u8()? {
        0 => {
            let length = stream.read_u16::<LittleEndian>()? as usize;
            let mut bytes = vec![0u8; length];
            stream.read_exact(&mut bytes)?;
            let text = String::from_utf8(bytes)
                .map_err(|_| ResourceError::serialization("string payload is not UTF-8"))?;
            Ok(Name::intern(&text))
        }
        1 => {
            let slot = stream.read_u32::<LittleEndian>()?;
            let table = registry.ok_or_else(|| {
                ResourceError::serialization("stream references a string registry, none is bound")
            })?;
            table.get(slot).ok_or_else(|| {
                ResourceError::serialization(format!("string registry index {slot} out of range"))
            })
        }
        flag => Err(ResourceError::serialization(format!(
            "unknown string flag {flag}"
        ))),
    }
}

fn read_scalar<R: Read + ?Sized>(stream: &mut R, size: u32) -> Result<[u8; 8]> {
    let mut native = [0u8; 8];
    match size {
        1 => native[0] = stream.read_u8()?,
        2 => native[..2].copy_from_slice(&stream.read_u16::<LittleEndian>()?.to_ne_bytes()),
        4 => native[..4].copy_from_slice(&stream.read_u32::<LittleEndian>()?.to_ne_bytes()),
        8 => native[..8].copy_from_slice(&stream.read_u64::<LittleEndian>()?.to_ne_bytes()),
        other => {
            return Err(ResourceError::serialization(format!(
                "unsupported scalar width {other}"
            )));
        }
    }
    Ok(native)
}

fn write_scalar(stream: &mut dyn Write, bytes: &[u8]) -> Result<()> {
    match bytes.len() {
        1 => stream.write_u8(bytes[0])?,
        2 => stream.write_u16::<LittleEndian>(u16::from_ne_bytes(bytes.try_into().unwrap()))?,
        4 => stream.write_u32::<LittleEndian>(u32::from_ne_bytes(bytes.try_into().unwrap()))?,
        8 => stream.write_u64::<LittleEndian>(u64::from_ne_bytes(bytes.try_into().unwrap()))?,
        other => {
            return Err(ResourceError::serialization(format!(
                "unsupported scalar width {other}"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Step-driven reader
// ---------------------------------------------------------------------------

/// Raw write cursor that may cross worker threads between steps
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);

// SAFETY: the pointed-at buffer is owned by the instance under construction,
// which only one worker touches at a time.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Where a frame's values land: inside the container or in a heap element
/// buffer of a dynamic array
#[derive(Clone, Copy)]
enum Target {
    Container { offset: u32 },
    Raw(SendPtr),
}

impl Target {
    fn rebase(&self, extra: u32) -> Target {
        match self {
            Target::Container { offset } => Target::Container {
                offset: offset + extra,
            },
            // SAFETY: callers only rebase within allocated extents.
            Target::Raw(ptr) => Target::Raw(SendPtr(unsafe { ptr.0.add(extra as usize) })),
        }
    }
}

struct ArrayProgress {
    item: PlanItem,
    item_size: u32,
    index: u32,
    count: u32,
    dst: Target,
}

struct Frame {
    plan: Arc<TypePlan>,
    op_index: usize,
    base: Target,
    array: Option<ArrayProgress>,
}

/// Reflection-driven incremental deserializer
///
/// Created against an open stream positioned right after the type header;
/// writes the decoded struct into the container payload.
pub struct BinaryReader {
    storage: Arc<ScriptStorage>,
    stream: Box<dyn ReadSeek>,
    container: Arc<ContainerCell>,
    string_registry: Option<Arc<StringRegistry>>,
    stack: Vec<Frame>,
    failed: bool,
}

impl BinaryReader {
    pub fn new(
        stream: Box<dyn ReadSeek>,
        storage: Arc<ScriptStorage>,
        type_name: Name,
        container: Arc<ContainerCell>,
        string_registry: Option<Arc<StringRegistry>>,
    ) -> Result<Self> {
        let plan = storage.plan(type_name)?;
        Ok(Self {
            storage,
            stream,
            container,
            string_registry,
            stack: vec![Frame {
                plan,
                op_index: 0,
                base: Target::Container { offset: 0 },
                array: None,
            }],
            failed: false,
        })
    }

    /// Decode one leaf value (or open/close one frame)
    pub fn step(&mut self) -> ReadState {
        if self.failed {
            return ReadState::Failed;
        }

        if self.stack.is_empty() {
            return ReadState::Finished;
        }

        match self.step_inner() {
            Ok(()) => {
                if self.stack.is_empty() {
                    ReadState::Finished
                } else {
                    ReadState::InProgress
                }
            }
            Err(problem) => {
                error!(%problem, "binary read failed");
                self.failed = true;
                ReadState::Failed
            }
        }
    }

    fn step_inner(&mut self) -> Result<()> {
        let top = self.stack.len() - 1;

        if self.stack[top].array.is_some() {
            return self.step_array(top);
        }

        if self.stack[top].op_index >= self.stack[top].plan.ops.len() {
            self.stack.pop();
            return Ok(());
        }

        let op = self.stack[top].plan.ops[self.stack[top].op_index].clone();
        let base = self.stack[top].base;

        match op {
            PlanOp::Scalar { offset, size } => {
                let native = read_scalar(&mut self.stream, size)?;
                self.write_at(base, offset, &native[..size as usize]);
                self.stack[top].op_index += 1;
            }
            PlanOp::Enum { offset } => {
                let value = self.stream.read_i32::<LittleEndian>()?;
                self.write_at(base, offset, &value.to_ne_bytes());
                self.stack[top].op_index += 1;
            }
            PlanOp::InternedString { offset } => {
                let name = read_flagged_name(&mut self.stream, self.string_registry.as_deref())?;
                self.write_at(base, offset, &(name.id() as u64).to_ne_bytes());
                self.stack[top].op_index += 1;
            }
            PlanOp::Struct { offset, type_name } => {
                let plan = self.storage.plan(type_name)?;
                self.stack[top].op_index += 1;
                self.stack.push(Frame {
                    plan,
                    op_index: 0,
                    base: base.rebase(offset),
                    array: None,
                });
            }
            PlanOp::InlineArray {
                offset,
                item,
                item_size,
                item_count,
            } => {
                self.stack[top].array = Some(ArrayProgress {
                    item,
                    item_size,
                    index: 0,
                    count: item_count,
                    dst: base.rebase(offset),
                });
            }
            PlanOp::DynamicArray {
                offset,
                item,
                item_size,
                item_align,
            } => {
                let count = self.stream.read_u32::<LittleEndian>()?;
                let buffer = dynarray::allocate_elements(count as u64, item_size, item_align);

                let mut header_bytes = [0u8; 24];
                dynarray::write_header(
                    &mut header_bytes,
                    DynArrayHeader {
                        data: buffer,
                        len: count as u64,
                        cap: count as u64,
                    },
                );
                self.write_at(base, offset, &header_bytes);

                if count == 0 {
                    self.stack[top].op_index += 1;
                } else {
                    self.stack[top].array = Some(ArrayProgress {
                        item,
                        item_size,
                        index: 0,
                        count,
                        dst: Target::Raw(SendPtr(buffer)),
                    });
                }
            }
        }

        Ok(())
    }

    fn step_array(&mut self, top: usize) -> Result<()> {
        let (item, item_size, index, count, dst) = {
            let array = self.stack[top].array.as_ref().expect("array in progress");
            (
                array.item.clone(),
                array.item_size,
                array.index,
                array.count,
                array.dst,
            )
        };

        if index >= count {
            let frame = &mut self.stack[top];
            frame.array = None;
            frame.op_index += 1;
            return Ok(());
        }

        self.stack[top].array.as_mut().expect("array in progress").index += 1;
        let element_offset = index * item_size;

        match item {
            PlanItem::Scalar => {
                let native = read_scalar(&mut self.stream, item_size)?;
                self.write_at(dst, element_offset, &native[..item_size as usize]);
            }
            PlanItem::Enum => {
                let value = self.stream.read_i32::<LittleEndian>()?;
                self.write_at(dst, element_offset, &value.to_ne_bytes());
            }
            PlanItem::InternedString => {
                let name = read_flagged_name(&mut self.stream, self.string_registry.as_deref())?;
                self.write_at(dst, element_offset, &(name.id() as u64).to_ne_bytes());
            }
            PlanItem::Struct { type_name } => {
                let plan = self.storage.plan(type_name)?;
                self.stack.push(Frame {
                    plan,
                    op_index: 0,
                    base: dst.rebase(element_offset),
                    array: None,
                });
            }
        }

        Ok(())
    }

    fn write_at(&self, target: Target, offset: u32, bytes: &[u8]) {
        match target {
            Target::Container { offset: base } => self.container.with_bytes_mut(|buffer| {
                let begin = (base + offset) as usize;
                buffer[begin..begin + bytes.len()].copy_from_slice(bytes);
            }),
            Target::Raw(ptr) => {
                // SAFETY: the element buffer was allocated for the full array
                // extent; offsets stay inside it by plan construction.
                let slot = unsafe {
                    std::slice::from_raw_parts_mut(ptr.0.add(offset as usize), bytes.len())
                };
                slot.copy_from_slice(bytes);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// One-shot writer
// ---------------------------------------------------------------------------

/// Reflection-driven serializer, the inverse of [`BinaryReader`]
pub struct BinaryWriter {
    storage: Arc<ScriptStorage>,
    string_registry: Option<Arc<StringRegistry>>,
}

impl BinaryWriter {
    pub fn new(storage: Arc<ScriptStorage>, string_registry: Option<Arc<StringRegistry>>) -> Self {
        Self {
            storage,
            string_registry,
        }
    }

    /// Serialize an instance (type header included)
    pub fn write_instance(
        &self,
        stream: &mut dyn Write,
        type_name: Name,
        bytes: &[u8],
    ) -> Result<()> {
        write_type_header(stream, type_name, self.string_registry.as_deref())?;
        self.write_body(stream, type_name, bytes)
    }

    /// Serialize an instance without the type header
    pub fn write_body(&self, stream: &mut dyn Write, type_name: Name, bytes: &[u8]) -> Result<()> {
        let plan = self.storage.plan(type_name)?;
        self.write_with_plan(stream, &plan, bytes)
    }

    fn write_with_plan(&self, stream: &mut dyn Write, plan: &TypePlan, bytes: &[u8]) -> Result<()> {
        for op in &plan.ops {
            match op {
                PlanOp::Scalar { offset, size } => {
                    let begin = *offset as usize;
                    write_scalar(stream, &bytes[begin..begin + *size as usize])?;
                }
                PlanOp::Enum { offset } => {
                    let begin = *offset as usize;
                    write_scalar(stream, &bytes[begin..begin + 4])?;
                }
                PlanOp::InternedString { offset } => {
                    let begin = *offset as usize;
                    let id = u64::from_ne_bytes(bytes[begin..begin + 8].try_into().unwrap());
                    let name = Name::try_from_id(id as u32).ok_or_else(|| {
                        ResourceError::serialization("interned string slot holds an unknown id")
                    })?;
                    write_flagged_name(stream, name, self.string_registry.as_deref())?;
                }
                PlanOp::Struct { offset, type_name } => {
                    let inner = self.storage.plan(*type_name)?;
                    let begin = *offset as usize;
                    let end = begin + inner.struct_type.size as usize;
                    self.write_with_plan(stream, &inner, &bytes[begin..end])?;
                }
                PlanOp::InlineArray {
                    offset,
                    item,
                    item_size,
                    item_count,
                } => {
                    for index in 0..*item_count {
                        let begin = (*offset + index * item_size) as usize;
                        self.write_item(stream, item, &bytes[begin..begin + *item_size as usize])?;
                    }
                }
                PlanOp::DynamicArray {
                    offset,
                    item,
                    item_size,
                    ..
                } => {
                    let header = dynarray::read_header(&bytes[*offset as usize..]);
                    stream.write_u32::<LittleEndian>(header.len as u32)?;

                    for index in 0..header.len {
                        // SAFETY: the header describes a live element buffer
                        // of at least len * item_size bytes.
                        let element = unsafe {
                            std::slice::from_raw_parts(
                                header.data.add((index * *item_size as u64) as usize),
                                *item_size as usize,
                            )
                        };
                        self.write_item(stream, item, element)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn write_item(&self, stream: &mut dyn Write, item: &PlanItem, bytes: &[u8]) -> Result<()> {
        match item {
            PlanItem::Scalar => write_scalar(stream, bytes),
            PlanItem::Enum => write_scalar(stream, &bytes[..4]),
            PlanItem::InternedString => {
                let id = u64::from_ne_bytes(bytes[..8].try_into().unwrap());
                let name = Name::try_from_id(id as u32).ok_or_else(|| {
                    ResourceError::serialization("interned string slot holds an unknown id")
                })?;
                write_flagged_name(stream, name, self.string_registry.as_deref())
            }
            PlanItem::Struct { type_name } => {
                let inner = self.storage.plan(*type_name)?;
                self.write_with_plan(stream, &inner, bytes)
            }
        }
    }
}
