//! Binary resource serialization
//!
//! Every resource file begins with a type header identifying the stored
//! struct; the rest of the stream is the reflection-driven binary encoding of
//! that struct. Strings are encoded inline or as indexes into a bound
//! interned-string registry shared by an entire resource index.
//!
//! All integers are little-endian on the wire and native-endian in memory.

pub mod binary;
pub mod index;
pub mod script;
pub mod string_registry;

pub use binary::{read_type_header, write_type_header, BinaryReader, BinaryWriter, ReadState};
pub use index::{IndexContainer, IndexItem, ResourceIndex};
pub use script::{ScriptStorage, TypePlan};
pub use string_registry::StringRegistry;

/// Magic prefix of every binary resource stream
pub const RESOURCE_MAGIC: u32 = u32::from_le_bytes(*b"ENBR");

/// Format version carried next to the magic
pub const RESOURCE_VERSION: u8 = 1;

/// Well-known file names inside a resource directory
pub const RESOURCE_INDEX_FILE: &str = "resource_index.bin";
pub const RESOURCE_INDEX_STRING_REGISTRY_FILE: &str = "resource_index_strings.bin";

/// Extension of binary resource files (without the dot)
pub const RESOURCE_EXTENSION: &str = "bin";
