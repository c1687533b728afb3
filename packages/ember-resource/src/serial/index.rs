//! Resource index file
//!
//! A directory may describe its contents with a `resource_index.bin` instead
//! of relying on per-file type headers: per resource type one container
//! listing `(name, relative_path)` items. Names may reference the companion
//! string registry when one is present.

use crate::error::Result;
use crate::serial::binary::{read_flagged_name, write_flagged_name};
use crate::serial::string_registry::StringRegistry;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ember_reflect::Name;
use std::io::{Read, Write};

/// One `(name, relative_path)` resource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexItem {
    pub name: Name,
    pub path: String,
}

/// All records of one resource type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexContainer {
    pub type_name: Name,
    pub items: Vec<IndexItem>,
}

/// Directory-level listing of `(type, name, relative_path)` tuples
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceIndex {
    pub containers: Vec<IndexContainer>,
}

impl ResourceIndex {
    pub fn read<R: Read + ?Sized>(
        stream: &mut R,
        registry: Option<&StringRegistry>,
    ) -> Result<Self> {
        let container_count = stream.read_u32::<LittleEndian>()?;
        let mut containers = Vec::with_capacity(container_count as usize);

        for _ in 0..container_count {
            let type_name = read_flagged_name(stream, registry)?;
            let item_count = stream.read_u32::<LittleEndian>()?;
            let mut items = Vec::with_capacity(item_count as usize);

            for _ in 0..item_count {
                let name = read_flagged_name(stream, registry)?;
                let path_length = stream.read_u16::<LittleEndian>()? as usize;
                let mut path_bytes = vec![0u8; path_length];
                stream.read_exact(&mut path_bytes)?;
                let path = String::from_utf8(path_bytes).map_err(|_| {
                    crate::error::ResourceError::serialization("index path is not UTF-8")
                })?;
                items.push(IndexItem { name, path });
            }

            containers.push(IndexContainer { type_name, items });
        }

        Ok(Self { containers })
    }

    pub fn write(&self, stream: &mut dyn Write, registry: Option<&StringRegistry>) -> Result<()> {
        stream.write_u32::<LittleEndian>(self.containers.len() as u32)?;

        for container in &self.containers {
            write_flagged_name(stream, container.type_name, registry)?;
            stream.write_u32::<LittleEndian>(container.items.len() as u32)?;

            for item in &container.items {
                write_flagged_name(stream, item.name, registry)?;
                stream.write_u16::<LittleEndian>(item.path.len() as u16)?;
                stream.write_all(item.path.as_bytes())?;
            }
        }

        Ok(())
    }
}
