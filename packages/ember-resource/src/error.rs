//! Error types for ember-resource
//!
//! I/O and serialization failures are logged and the failing operation is
//! dropped; scanning and serving continue. Errors surface through `Result`
//! only at API boundaries.

use std::fmt;
use thiserror::Error;

/// Resource pipeline error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// VFS and stream failures
    IO,
    /// Binary format violations (bad magic, truncated stream)
    Serialization,
    /// Type header does not match the expected resource type
    TypeMismatch,
    /// Referenced type is not a known resource type
    UnknownResourceType,
    /// Duplicate `(type, name)` registration
    DuplicateEntry,
    /// Container layout rejected (non-power-of-two alignment, oversized type)
    Layout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IO => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::UnknownResourceType => "unknown_resource_type",
            ErrorKind::DuplicateEntry => "duplicate_entry",
            ErrorKind::Layout => "layout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resource pipeline error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct ResourceError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ResourceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IO, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, message)
    }

    pub fn unknown_resource_type(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownResourceType, message)
    }

    pub fn duplicate_entry(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DuplicateEntry, message)
    }

    pub fn layout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Layout, message)
    }
}

impl From<std::io::Error> for ResourceError {
    fn from(err: std::io::Error) -> Self {
        ResourceError::io(format!("I/O error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ResourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ResourceError::type_mismatch("expected mesh_t, found audio_t");
        let msg = format!("{}", err);
        assert_eq!(msg, "[type_mismatch] expected mesh_t, found audio_t");
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.bin");
        let err: ResourceError = io_err.into();
        assert_eq!(err.kind, ErrorKind::IO);
        assert!(err.source().is_some());
    }
}
