//! Backend implementations of the key/value persistence contract.

pub mod indexed;
pub mod sqlite;

pub use indexed::IndexedBackend;
pub use sqlite::SqliteBackend;
