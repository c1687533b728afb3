//! Provider event records
//!
//! Usage insert/delete copies drive refcounting; updated/registered/loaded
//! events surface lifecycle transitions to consumers. Per-type event queues
//! live on the generated type interfaces, the global updated queue on the
//! provider itself.

use crate::entry::EntryId;
use ember_reflect::Name;

/// Copy of a usage insert or delete, processed during `execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageEvent {
    pub kind: UsageEventKind,
    pub type_name: Name,
    pub name: Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageEventKind {
    Insert,
    Delete,
}

/// A watched resource file changed on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUpdatedEvent {
    pub entry_id: EntryId,
    pub type_name: Name,
    pub name: Name,
}

/// A new entry of the interface's type was registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRegisteredEvent {
    pub entry_id: EntryId,
    pub name: Name,
}

/// An entry of the interface's type finished loading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLoadedEvent {
    pub entry_id: EntryId,
    pub name: Name,
}
