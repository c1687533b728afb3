//! Value adaptation routines
//!
//! Scalar conversions executed by migrator commands: numeric width changes
//! across the full {1,2,4,8}-byte signed/unsigned cross product plus
//! `f32`/`f64`, and enum value remapping across the four
//! `(is_flags, is_flags)` sub-cases.

use crate::interner::Name;
use crate::seed::MigrationSeed;
use crate::types::{read_signed, read_unsigned, Archetype};
use tracing::error;

/// Convert one numeric value between widths using integer/float cast
/// semantics (truncating as needed). `src` and `dst` are the exact value
/// slots.
pub(crate) fn adapt_numeric(archetype: Archetype, src: &[u8], dst: &mut [u8]) {
    match archetype {
        Archetype::SignedInt => {
            let value = read_signed(src);
            write_signed(dst, value);
        }
        Archetype::UnsignedInt => {
            let value = read_unsigned(src);
            write_unsigned(dst, value);
        }
        Archetype::Floating => {
            let value = match src.len() {
                4 => f32::from_ne_bytes(src.try_into().expect("4-byte float")) as f64,
                8 => f64::from_ne_bytes(src.try_into().expect("8-byte float")),
                other => {
                    error!(size = other, "unsupported float width");
                    0.0
                }
            };
            match dst.len() {
                4 => dst.copy_from_slice(&(value as f32).to_ne_bytes()),
                8 => dst.copy_from_slice(&value.to_ne_bytes()),
                other => error!(size = other, "unsupported float width"),
            }
        }
        other => {
            debug_assert!(false, "numeric adaptation dispatched for {other:?}");
            error!(archetype = ?other, "numeric adaptation dispatched for non-numeric archetype");
        }
    }
}

fn write_signed(dst: &mut [u8], value: i64) {
    match dst.len() {
        1 => dst[0] = value as i8 as u8,
        2 => dst.copy_from_slice(&(value as i16).to_ne_bytes()),
        4 => dst.copy_from_slice(&(value as i32).to_ne_bytes()),
        8 => dst.copy_from_slice(&value.to_ne_bytes()),
        other => error!(size = other, "unsupported signed integer width"),
    }
}

fn write_unsigned(dst: &mut [u8], value: u64) {
    match dst.len() {
        1 => dst[0] = value as u8,
        2 => dst.copy_from_slice(&(value as u16).to_ne_bytes()),
        4 => dst.copy_from_slice(&(value as u32).to_ne_bytes()),
        8 => dst.copy_from_slice(&value.to_ne_bytes()),
        other => error!(size = other, "unsupported unsigned integer width"),
    }
}

/// Remap one 4-byte enum slot from the source registry's value space into the
/// target registry's.
///
/// - single -> single / single -> flags: find the source value by integer and
///   write its remap; unknown integers log and fall back to the target's
///   first value.
/// - flags -> flags: OR the remap of every listed active bit.
/// - flags -> single: take the first active bit's remap; an empty source falls
///   back to the target's first value.
pub(crate) fn adapt_enum(seed: &MigrationSeed, type_name: Name, src: &[u8], dst: &mut [u8]) {
    let (Some(node), Some(source_enum), Some(target_enum)) = (
        seed.enum_seed(type_name),
        seed.source_registry().query_enum(type_name),
        seed.target_registry().query_enum(type_name),
    ) else {
        error!(name = %type_name, "enum adaptation dispatched without a seed node");
        return;
    };

    let remapped = |source_index: usize| target_enum.values[node.value_remap[source_index]].value;

    match (source_enum.is_flags, target_enum.is_flags) {
        (false, is_flags_target) => {
            let value = i32::from_ne_bytes(src[..4].try_into().expect("enum slot")) as i64;
            match source_enum.value_index_by_int(value) {
                Some(source_index) => {
                    let target_value = remapped(source_index);
                    if is_flags_target {
                        dst[..4].copy_from_slice(&(target_value as u32).to_ne_bytes());
                    } else {
                        dst[..4].copy_from_slice(&(target_value as i32).to_ne_bytes());
                    }
                }
                None => {
                    error!(
                        value,
                        name = %type_name,
                        fallback = %target_enum.values[0].name,
                        "encountered unknown enum value, resetting to first correct value"
                    );
                    dst[..4].copy_from_slice(&(target_enum.values[0].value as i32).to_ne_bytes());
                }
            }
        }
        (true, true) => {
            let value = u32::from_ne_bytes(src[..4].try_into().expect("enum slot"));
            let mut output = 0u32;
            for (source_index, source_value) in source_enum.values.iter().enumerate() {
                if value & source_value.value as u32 != 0 {
                    output |= remapped(source_index) as u32;
                }
            }
            dst[..4].copy_from_slice(&output.to_ne_bytes());
        }
        (true, false) => {
            let value = u32::from_ne_bytes(src[..4].try_into().expect("enum slot"));
            for (source_index, source_value) in source_enum.values.iter().enumerate() {
                if value & source_value.value as u32 != 0 {
                    dst[..4].copy_from_slice(&(remapped(source_index) as i32).to_ne_bytes());
                    return;
                }
            }

            error!(
                name = %type_name,
                fallback = %target_enum.values[0].name,
                "empty flags value converted to single value enum, resetting to first correct value"
            );
            dst[..4].copy_from_slice(&(target_enum.values[0].value as i32).to_ne_bytes());
        }
    }
}
