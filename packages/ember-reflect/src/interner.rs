//! Global string intern pool
//!
//! All type, field, function and argument names are interned. [`Name`] is a
//! 4-byte copyable handle; equality and hashing work on the handle id, never
//! on string content. Interned storage is never freed - the pool lives for the
//! whole process, which keeps `as_str` borrow-free.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;

struct Pool {
    strings: Vec<&'static str>,
    index: FxHashMap<&'static str, u32>,
}

static POOL: Lazy<RwLock<Pool>> = Lazy::new(|| {
    RwLock::new(Pool {
        strings: Vec::with_capacity(1024),
        index: FxHashMap::default(),
    })
});

/// Interned string handle
///
/// Obtained through [`Name::intern`]. Two handles are equal iff they were
/// interned from equal strings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(u32);

impl Name {
    /// Intern a string, returning its stable handle
    pub fn intern(text: &str) -> Self {
        {
            let pool = POOL.read();
            if let Some(&id) = pool.index.get(text) {
                return Name(id);
            }
        }

        let mut pool = POOL.write();
        // Another thread may have interned it between the locks.
        if let Some(&id) = pool.index.get(text) {
            return Name(id);
        }

        let leaked: &'static str = Box::leak(text.to_owned().into_boxed_str());
        let id = pool.strings.len() as u32;
        pool.strings.push(leaked);
        pool.index.insert(leaked, id);
        Name(id)
    }

    /// Resolve the handle back to its string content
    pub fn as_str(self) -> &'static str {
        POOL.read().strings[self.0 as usize]
    }

    /// Raw handle id, usable as a hash seed
    pub fn id(self) -> u32 {
        self.0
    }

    /// Recover a handle from a raw id previously produced by [`Name::id`]
    pub fn try_from_id(id: u32) -> Option<Self> {
        let pool = POOL.read();
        if (id as usize) < pool.strings.len() {
            Some(Name(id))
        } else {
            None
        }
    }
}

impl From<&str> for Name {
    fn from(text: &str) -> Self {
        Name::intern(text)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({:?})", self.as_str())
    }
}
