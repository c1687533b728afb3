//! Error types for ember-reflect
//!
//! Registration conflicts and patch-build failures return errors; everything
//! that happens on the migration hot path logs and degrades instead of
//! unwinding (see the adaptation fallbacks in [`crate::adapt`]).

use std::fmt;
use thiserror::Error;

/// Reflection error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Duplicate name registration
    Registration,
    /// Descriptor violates archetype/size/offset constraints
    Validation,
    /// Patch build rejected (overlap, unknown type, chunk out of range)
    PatchBuild,
    /// Migration seed references an unreachable type
    Seed,
    /// Migration dispatch failure
    Migration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Registration => "registration",
            ErrorKind::Validation => "validation",
            ErrorKind::PatchBuild => "patch_build",
            ErrorKind::Seed => "seed",
            ErrorKind::Migration => "migration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reflection error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct ReflectError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ReflectError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    // Convenience constructors
    pub fn registration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Registration, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn patch_build(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PatchBuild, message)
    }

    pub fn seed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Seed, message)
    }

    pub fn migration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Migration, message)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ReflectError>;
