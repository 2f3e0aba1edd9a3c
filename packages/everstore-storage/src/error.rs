//! Error types for everstore-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Uuid or key absent from the adapter
    NotFound,
    /// Uniqueness violation (entity uuid, edge composite key, task per entity)
    Duplicate,
    /// Persisted data fails to deserialize or violates an invariant
    Corrupt,
    /// Vector length differs from the configured dimension
    DimensionMismatch,
    /// Operation unavailable on this backend
    NotSupported,
    /// An external service exceeded its deadline
    Timeout,
    /// Reconstruction requested before the earliest retained snapshot
    NotAvailable,
    /// Backend-level database errors
    Database,
    /// Serialization/deserialization errors on the way in
    Serialization,
    /// I/O errors
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::DimensionMismatch => "dimension_mismatch",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotAvailable => "not_available",
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
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
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, format!("not found: {}", what.into()))
    }

    pub fn duplicate(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Duplicate, format!("duplicate: {}", what.into()))
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corrupt, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAvailable, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::Io, format!("I/O error: {}", err)).with_source(err)
    }
}

impl From<everstore_index::IndexError> for StorageError {
    fn from(err: everstore_index::IndexError) -> Self {
        use everstore_index::IndexError;
        let kind = match &err {
            IndexError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            IndexError::DuplicateId(_) => ErrorKind::Duplicate,
            IndexError::Corrupt(_) => ErrorKind::Corrupt,
        };
        StorageError::new(kind, format!("index error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
