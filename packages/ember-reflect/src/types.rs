//! Type descriptors
//!
//! Typed descriptions of enums, structs and functions as registered in the
//! [`crate::registry::Registry`]. Struct layouts describe raw byte buffers:
//! every field carries an explicit offset, size and archetype.

use crate::interner::Name;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// In-memory size of an enum field (`i32`/`u32` storage)
pub const ENUM_VALUE_SIZE: u32 = 4;

/// In-memory size of a pointer-like slot (interned string, string pointer,
/// external pointer, struct pointer, patch handle)
pub const HANDLE_SIZE: u32 = 8;

/// In-memory size of a dynamic array header (`data`, `len`, `cap`)
pub const DYN_ARRAY_HEADER_SIZE: u32 = 24;

/// Discriminator of a field's runtime representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Archetype {
    SignedInt,
    UnsignedInt,
    Floating,
    StringPointer,
    InternedString,
    Enum,
    ExternalPointer,
    Struct,
    StructPointer,
    Patch,
    InlineArray,
    DynamicArray,
}

/// Element layout of an inline or dynamic array
///
/// Arrays may not nest: this is the field layout minus the array variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemLayout {
    SignedInt,
    UnsignedInt,
    Floating,
    StringPointer,
    InternedString,
    Enum { type_name: Name },
    ExternalPointer,
    Struct { type_name: Name },
    StructPointer { type_name: Name },
    Patch,
}

impl ItemLayout {
    pub fn archetype(&self) -> Archetype {
        match self {
            ItemLayout::SignedInt => Archetype::SignedInt,
            ItemLayout::UnsignedInt => Archetype::UnsignedInt,
            ItemLayout::Floating => Archetype::Floating,
            ItemLayout::StringPointer => Archetype::StringPointer,
            ItemLayout::InternedString => Archetype::InternedString,
            ItemLayout::Enum { .. } => Archetype::Enum,
            ItemLayout::ExternalPointer => Archetype::ExternalPointer,
            ItemLayout::Struct { .. } => Archetype::Struct,
            ItemLayout::StructPointer { .. } => Archetype::StructPointer,
            ItemLayout::Patch => Archetype::Patch,
        }
    }
}

/// Field layout: archetype plus its archetype-specific payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLayout {
    SignedInt,
    UnsignedInt,
    Floating,
    StringPointer,
    InternedString,
    Enum {
        type_name: Name,
    },
    ExternalPointer,
    Struct {
        type_name: Name,
    },
    StructPointer {
        type_name: Name,
    },
    Patch,
    InlineArray {
        item: ItemLayout,
        item_size: u32,
        item_count: u32,
    },
    DynamicArray {
        item: ItemLayout,
        item_size: u32,
    },
}

impl FieldLayout {
    pub fn archetype(&self) -> Archetype {
        match self {
            FieldLayout::SignedInt => Archetype::SignedInt,
            FieldLayout::UnsignedInt => Archetype::UnsignedInt,
            FieldLayout::Floating => Archetype::Floating,
            FieldLayout::StringPointer => Archetype::StringPointer,
            FieldLayout::InternedString => Archetype::InternedString,
            FieldLayout::Enum { .. } => Archetype::Enum,
            FieldLayout::ExternalPointer => Archetype::ExternalPointer,
            FieldLayout::Struct { .. } => Archetype::Struct,
            FieldLayout::StructPointer { .. } => Archetype::StructPointer,
            FieldLayout::Patch => Archetype::Patch,
            FieldLayout::InlineArray { .. } => Archetype::InlineArray,
            FieldLayout::DynamicArray { .. } => Archetype::DynamicArray,
        }
    }
}

/// Visibility condition attached to a field
///
/// Names another field of the same struct whose current value must be one of
/// `values` for this field to be active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCondition {
    pub field: Name,
    pub values: Vec<i64>,
}

/// Field descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: Name,
    pub offset: u32,
    pub size: u32,
    pub layout: FieldLayout,
    pub visibility: Option<FieldCondition>,
}

impl Field {
    /// Plain field without a visibility condition
    pub fn new(name: impl Into<Name>, offset: u32, size: u32, layout: FieldLayout) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            layout,
            visibility: None,
        }
    }

    pub fn with_visibility(mut self, field: impl Into<Name>, values: Vec<i64>) -> Self {
        self.visibility = Some(FieldCondition {
            field: field.into(),
            values,
        });
        self
    }
}

/// Instance lifecycle hook (container init/shutdown forwarding)
pub type InstanceHook = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// Struct descriptor
///
/// Fields must be sorted by offset; fields sharing one offset are union
/// members. `size` must be a multiple of `alignment`.
#[derive(Clone)]
pub struct StructType {
    pub name: Name,
    pub size: u32,
    pub alignment: u32,
    pub fields: Vec<Field>,
    pub init: Option<InstanceHook>,
    pub shutdown: Option<InstanceHook>,
    pub user_data: u64,
}

impl StructType {
    pub fn new(name: impl Into<Name>, size: u32, alignment: u32, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            size,
            alignment,
            fields,
            init: None,
            shutdown: None,
            user_data: 0,
        }
    }

    /// Find a field by name together with its declaration index
    pub fn field(&self, name: Name) -> Option<(usize, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, field)| field.name == name)
    }
}

impl fmt::Debug for StructType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructType")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("fields", &self.fields)
            .field("user_data", &self.user_data)
            .finish()
    }
}

/// Enum value descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub name: Name,
    pub value: i64,
}

/// Enum descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumType {
    pub name: Name,
    pub is_flags: bool,
    pub values: Vec<EnumValue>,
}

impl EnumType {
    pub fn new(name: impl Into<Name>, is_flags: bool, values: Vec<(&str, i64)>) -> Self {
        Self {
            name: name.into(),
            is_flags,
            values: values
                .into_iter()
                .map(|(value_name, value)| EnumValue {
                    name: Name::intern(value_name),
                    value,
                })
                .collect(),
        }
    }

    pub fn value_by_name(&self, name: Name) -> Option<(usize, &EnumValue)> {
        self.values
            .iter()
            .enumerate()
            .find(|(_, value)| value.name == name)
    }

    pub fn value_index_by_int(&self, value: i64) -> Option<usize> {
        self.values.iter().position(|entry| entry.value == value)
    }
}

/// Function argument descriptor
///
/// Arrays are not allowed as arguments or return values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: Name,
    pub archetype: Archetype,
    pub size: u32,
    pub type_name: Option<Name>,
}

/// Invocation thunk: `(return_slot, packed_arguments)`
pub type FunctionCall = Arc<dyn Fn(&mut [u8], &[u8]) + Send + Sync>;

/// Function descriptor
#[derive(Clone)]
pub struct FunctionType {
    pub name: Name,
    pub return_type: Option<Argument>,
    pub arguments: Vec<Argument>,
    pub call: FunctionCall,
}

impl fmt::Debug for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionType")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .field("arguments", &self.arguments)
            .finish()
    }
}

/// Evaluate a field visibility condition against live bytes
///
/// `value_bytes` must point at the condition field's value inside an instance.
/// The value is widened to `i64` according to the condition field's archetype
/// and checked against the value set. An empty value set always passes.
pub fn check_visibility(field: &Field, values: &[i64], value_bytes: &[u8]) -> bool {
    if values.is_empty() {
        return true;
    }

    let current = match field.layout.archetype() {
        Archetype::SignedInt => read_signed(&value_bytes[..field.size as usize]),
        Archetype::UnsignedInt => read_unsigned(&value_bytes[..field.size as usize]) as i64,
        Archetype::Enum => {
            i32::from_ne_bytes(value_bytes[..4].try_into().expect("enum value slot")) as i64
        }
        other => {
            error!(
                archetype = ?other,
                field = %field.name,
                "visibility condition field has non-scalar archetype"
            );
            return false;
        }
    };

    values.contains(&current)
}

pub(crate) fn read_signed(bytes: &[u8]) -> i64 {
    match bytes.len() {
        1 => bytes[0] as i8 as i64,
        2 => i16::from_ne_bytes(bytes.try_into().expect("2-byte slot")) as i64,
        4 => i32::from_ne_bytes(bytes.try_into().expect("4-byte slot")) as i64,
        8 => i64::from_ne_bytes(bytes.try_into().expect("8-byte slot")),
        other => {
            error!(size = other, "unsupported signed integer width");
            0
        }
    }
}

pub(crate) fn read_unsigned(bytes: &[u8]) -> u64 {
    match bytes.len() {
        1 => bytes[0] as u64,
        2 => u16::from_ne_bytes(bytes.try_into().expect("2-byte slot")) as u64,
        4 => u32::from_ne_bytes(bytes.try_into().expect("4-byte slot")) as u64,
        8 => u64::from_ne_bytes(bytes.try_into().expect("8-byte slot")),
        other => {
            error!(size = other, "unsupported unsigned integer width");
            0
        }
    }
}
