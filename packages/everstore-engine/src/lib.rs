//! everstore-engine — the retrieval and lifecycle layer over
//! everstore-storage.
//!
//! Components:
//!
//! - [`EntityRepository`]: typed CRUD per entity kind, composed from a
//!   storage adapter and an ordered chain of lifecycle handlers
//!   (touch → versioning → chunk-enqueue → persist → embedding-enqueue)
//! - [`SemanticChunker`]: embedding-guided text segmentation with the
//!   `parent`/`child` presets
//! - [`EmbeddingQueue`]: durable background worker that batches embedding
//!   generation with retry, backoff and crash recovery
//! - [`EventBus`]: write-through pub/sub with correlation-id threading
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use everstore_engine::{EmbeddingQueue, EntityRepository, QueueConfig, RepositoryConfig};
//! use everstore_storage::{KvEntityStore, KvTaskStore, KvVersionStore, SqliteBackend};
//!
//! let backend = Arc::new(SqliteBackend::open("everstore.db")?);
//! let store = Arc::new(KvEntityStore::<Note>::open_semantic(
//!     backend.clone(),
//!     RepositoryConfig::default().vector_index(),
//! ).await?);
//!
//! let tasks = Arc::new(KvTaskStore::open(backend.clone()).await?);
//! let queue = EmbeddingQueue::new(tasks, store.clone(), embedder.clone(), QueueConfig::default());
//! queue.recover().await?;
//! queue.start();
//!
//! let versions = Arc::new(KvVersionStore::open(backend.clone()).await?);
//! let notes = EntityRepository::new(store, RepositoryConfig::default())?
//!     .with_versioning(versions)
//!     .with_embedding_queue(queue.clone())
//!     .with_embedder(embedder);
//!
//! let note = notes.save(Note::new("title", "body")).await?;
//! let hits = notes.semantic_search("what was that about?", 10, 0.6).await?;
//! ```

pub mod bus;
pub mod chunker;
pub mod config;
pub mod error;
pub mod queue;
pub mod repository;

pub use bus::{EventBus, EventFilter, Subscription};
pub use chunker::{Chunk, ChunkerConfig, SemanticChunker};
pub use config::{ChunkingPreset, RepositoryConfig};
pub use error::{EngineError, FanOutError, Result, SubscriberFailure};
pub use queue::{EmbeddingQueue, QueueConfig};
pub use repository::{
    ChunkingHandler, ChunkingSink, DeleteOptions, EmbeddingEnqueueHandler, EntityRepository,
    SaveContext, SaveHandler, TouchHandler, VersioningHandler,
};

// The storage-level contracts engine callers hold alongside these types.
pub use everstore_storage::{
    BlobStore, EmbeddingService, EntityStore, EventRepository, SemanticStore,
};
