//! Bound interned-string registry
//!
//! A table of frequently used strings shared by a resource index and every
//! entry that declares it. Streams referencing the registry encode strings as
//! 4-byte indexes instead of inline bytes.

use crate::error::{ResourceError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ember_reflect::Name;
use rustc_hash::FxHashMap;
use std::io::{Read, Write};

/// Immutable interned-string table loaded from a companion file
pub struct StringRegistry {
    names: Vec<Name>,
    index: FxHashMap<Name, u32>,
}

impl StringRegistry {
    pub fn from_names(names: Vec<Name>) -> Self {
        let index = names
            .iter()
            .enumerate()
            .map(|(slot, &name)| (name, slot as u32))
            .collect();
        Self { names, index }
    }

    /// Decode `u32 count` then `u16 length + utf8` per string
    pub fn read<R: Read + ?Sized>(stream: &mut R) -> Result<Self> {
        let count = stream.read_u32::<LittleEndian>()?;
        let mut names = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let length = stream.read_u16::<LittleEndian>()? as usize;
            let mut bytes = vec![0u8; length];
            stream.read_exact(&mut bytes)?;
            let text = String::from_utf8(bytes)
                .map_err(|_| ResourceError::serialization("string registry entry is not UTF-8"))?;
            names.push(Name::intern(&text));
        }

        Ok(Self::from_names(names))
    }

    pub fn write(&self, stream: &mut dyn Write) -> Result<()> {
        stream.write_u32::<LittleEndian>(self.names.len() as u32)?;
        for name in &self.names {
            let text = name.as_str();
            stream.write_u16::<LittleEndian>(text.len() as u16)?;
            stream.write_all(text.as_bytes())?;
        }
        Ok(())
    }

    pub fn get(&self, slot: u32) -> Option<Name> {
        self.names.get(slot as usize).copied()
    }

    pub fn find(&self, name: Name) -> Option<u32> {
        self.index.get(&name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_round_trip() {
        let registry = StringRegistry::from_names(vec![
            Name::intern("mesh_t"),
            Name::intern("crate_props"),
        ]);

        let mut encoded = Vec::new();
        registry.write(&mut encoded).unwrap();

        let decoded = StringRegistry::read(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get(0), Some(Name::intern("mesh_t")));
        assert_eq!(decoded.find(Name::intern("crate_props")), Some(1));
        assert_eq!(decoded.get(7), None);
    }
}
