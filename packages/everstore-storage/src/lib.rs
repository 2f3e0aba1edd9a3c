//! everstore-storage — local-first persistence for domain entities.
//!
//! The crate owns everything that touches disk:
//!
//! - the **domain model**: entity lifecycle core, capability traits, edges,
//!   version records, embedding tasks and events
//! - the **backend contract** and its two implementations — the embedded
//!   SQLite store (synchronous transactions, secondary indices) and the
//!   browser-style indexed object store (async-only, no transactions)
//! - the **typed entity adapter** with an attached HNSW index for
//!   embeddable kinds
//! - the **version store** (snapshots + RFC-6902 deltas), **edge store**,
//!   **task store**, **event repository** and the streamed **blob store**
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use everstore_storage::{
//!     EntityStore, KvEntityStore, SqliteBackend, VectorIndexConfig,
//! };
//!
//! let backend = Arc::new(SqliteBackend::open("everstore.db")?);
//! let notes = KvEntityStore::<Note>::open_semantic(
//!     backend.clone(),
//!     VectorIndexConfig::default(),
//! ).await?;
//!
//! let note = notes.save(Note::new("title", "body"), true).await?;
//! let hits = notes.semantic_search(&query_vector, 10, 0.6).await?;
//! ```

pub mod adapter;
pub mod backend;
pub mod blob;
pub mod diff;
pub mod domain;
pub mod edges;
pub mod embedding;
pub mod error;
pub mod events;
pub mod infrastructure;
pub mod tasks;
pub mod versions;

pub use error::{ErrorKind, Result, StorageError};

pub use adapter::{
    EntityStore, EntityTx, EntityTxBody, KvEntityStore, SemanticStore, VectorIndexConfig,
};
pub use backend::{KvBackend, KvTransaction, TxBody};
pub use blob::{BlobStore, BlobStream, FsBlobStore};
pub use domain::{
    BirthCertificate, ChunkPreset, Edge, EdgeDirection, Embeddable, EmbeddingTask, Entity,
    EntityCore, EntityVersion, Event, Invocable, InvocationStatus, Ownable, SnapshotCadence,
    SyncStatus, TaskStatus, Temporal, Edgeable, Chunkable, Versionable, VersionKind, Visibility,
};
pub use edges::KvEdgeStore;
pub use embedding::EmbeddingService;
pub use events::{EventRepository, KvEventRepository};
pub use infrastructure::{IndexedBackend, SqliteBackend};
pub use tasks::KvTaskStore;
pub use versions::KvVersionStore;
