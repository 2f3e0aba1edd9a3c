//! Typed entity repository: CRUD composed with lifecycle handlers.
//!
//! One repository per entity kind, built from a storage adapter plus an
//! ordered chain of pluggable [`SaveHandler`]s. The default chain runs
//! touch → versioning → chunk-enqueue → persist → embedding-enqueue, with
//! the capability handlers registered only for entity kinds that opt in
//! through the matching builder method.
//!
//! Background side-effect writes (the embedding queue applying vectors) do
//! not pass through here at all; they use the semantic store's
//! `apply_embedding` path, which neither touches `updatedAt` nor records
//! history.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use everstore_storage::{
    adapter::EmbedFuture, ChunkPreset, Chunkable, Embeddable, EmbeddingService, Entity,
    EntityStore, KvEdgeStore, KvVersionStore, SemanticStore, SnapshotCadence, StorageError,
    Versionable,
};

use crate::config::RepositoryConfig;
use crate::error::{EngineError, Result};
use crate::queue::EmbeddingQueue;

/// Ambient information for one save.
#[derive(Debug, Clone, Default)]
pub struct SaveContext {
    /// Background side-effects preserve `updatedAt` and skip versioning
    /// and re-enqueueing.
    pub background: bool,
    pub correlation_id: Option<String>,
}

impl SaveContext {
    pub fn foreground() -> Self {
        Self::default()
    }

    pub fn background() -> Self {
        Self {
            background: true,
            correlation_id: None,
        }
    }
}

/// A pluggable lifecycle step in the repository save chain.
#[async_trait]
pub trait SaveHandler<T: Entity>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before_persist(
        &self,
        _entity: &mut T,
        _previous: Option<&T>,
        _ctx: &SaveContext,
    ) -> Result<()> {
        Ok(())
    }

    async fn after_persist(
        &self,
        _entity: &T,
        _previous: Option<&T>,
        _ctx: &SaveContext,
    ) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Built-in handlers
// ═══════════════════════════════════════════════════════════════════════════

/// Sets `updatedAt` on every foreground save.
pub struct TouchHandler;

#[async_trait]
impl<T: Entity> SaveHandler<T> for TouchHandler {
    fn name(&self) -> &'static str {
        "touch"
    }

    async fn before_persist(
        &self,
        entity: &mut T,
        _previous: Option<&T>,
        ctx: &SaveContext,
    ) -> Result<()> {
        if !ctx.background {
            entity.core_mut().touch();
        }
        Ok(())
    }
}

/// The serialized state the version store diffs: the entity document minus
/// the bookkeeping keys the save machinery itself rewrites.
pub(crate) fn versioned_state<T: Entity>(entity: &T) -> Result<Value> {
    let mut value = serde_json::to_value(entity)
        .map_err(|e| StorageError::serialization(format!("entity encode failed: {}", e)))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("updatedAt");
        map.remove("version");
    }
    Ok(value)
}

/// Records history and bumps the entity version on every foreground save.
pub struct VersioningHandler {
    versions: Arc<KvVersionStore>,
    cadence: SnapshotCadence,
}

impl VersioningHandler {
    pub fn new(versions: Arc<KvVersionStore>, cadence: SnapshotCadence) -> Self {
        Self { versions, cadence }
    }
}

#[async_trait]
impl<T: Versionable> SaveHandler<T> for VersioningHandler {
    fn name(&self) -> &'static str {
        "versioning"
    }

    async fn before_persist(
        &self,
        entity: &mut T,
        _previous: Option<&T>,
        ctx: &SaveContext,
    ) -> Result<()> {
        if ctx.background {
            return Ok(());
        }
        let state = versioned_state(entity)?;
        let uuid = entity.uuid().to_string();
        // Stamp the record with the save's own updatedAt so point-in-time
        // reconstruction lands exactly on persisted states.
        let at = entity.core().updated_at;
        if let Some(version) = self
            .versions
            .record_change(&uuid, &state, self.cadence, at)
            .await?
        {
            entity.set_version(version);
        }
        Ok(())
    }
}

/// Receiver for chunking jobs emitted on save of chunkable entities.
#[async_trait]
pub trait ChunkingSink: Send + Sync {
    async fn enqueue_chunking(
        &self,
        entity_uuid: &str,
        entity_kind: &str,
        text: String,
        preset: ChunkPreset,
    ) -> Result<()>;
}

/// Hands the entity's chunk text to the chunking sink.
pub struct ChunkingHandler {
    sink: Arc<dyn ChunkingSink>,
}

impl ChunkingHandler {
    pub fn new(sink: Arc<dyn ChunkingSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<T: Chunkable> SaveHandler<T> for ChunkingHandler {
    fn name(&self) -> &'static str {
        "chunking"
    }

    async fn before_persist(
        &self,
        entity: &mut T,
        _previous: Option<&T>,
        ctx: &SaveContext,
    ) -> Result<()> {
        if ctx.background {
            return Ok(());
        }
        let text = entity.chunk_text();
        if text.trim().is_empty() {
            return Ok(());
        }
        self.sink
            .enqueue_chunking(entity.uuid(), T::kind(), text, entity.chunk_preset())
            .await
    }
}

/// Queues embedding work after persist whenever the embedding projection
/// changed.
pub struct EmbeddingEnqueueHandler<T, S>
where
    T: Embeddable,
    S: SemanticStore<T> + 'static,
{
    queue: Arc<EmbeddingQueue<T, S>>,
}

impl<T, S> EmbeddingEnqueueHandler<T, S>
where
    T: Embeddable,
    S: SemanticStore<T> + 'static,
{
    pub fn new(queue: Arc<EmbeddingQueue<T, S>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl<T, S> SaveHandler<T> for EmbeddingEnqueueHandler<T, S>
where
    T: Embeddable,
    S: SemanticStore<T> + 'static,
{
    fn name(&self) -> &'static str {
        "embedding"
    }

    async fn after_persist(
        &self,
        entity: &T,
        previous: Option<&T>,
        ctx: &SaveContext,
    ) -> Result<()> {
        if ctx.background {
            return Ok(());
        }
        let text = entity.embedding_text();
        let changed = previous
            .map(|p| p.embedding_text() != text)
            .unwrap_or(true);
        if changed {
            self.queue.enqueue(entity.uuid(), T::kind(), &text).await?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Repository
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Also remove edges touching the deleted entity. Off by default: edges
    /// are first-class and deleting an endpoint does not cascade.
    pub prune_edges: bool,
}

/// Typed repository for one entity kind.
pub struct EntityRepository<T, S>
where
    T: Entity,
    S: EntityStore<T>,
{
    store: Arc<S>,
    handlers: Vec<Arc<dyn SaveHandler<T>>>,
    edges: Option<Arc<KvEdgeStore>>,
    embedder: Option<Arc<dyn EmbeddingService>>,
    config: RepositoryConfig,
}

impl<T, S> EntityRepository<T, S>
where
    T: Entity,
    S: EntityStore<T>,
{
    pub fn new(store: Arc<S>, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            handlers: vec![Arc::new(TouchHandler)],
            edges: None,
            embedder: None,
            config,
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Append a handler; handlers run in registration order around the
    /// persist step.
    pub fn with_handler(mut self, handler: Arc<dyn SaveHandler<T>>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_edges(mut self, edges: Arc<KvEdgeStore>) -> Self {
        self.edges = Some(edges);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingService>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn find_by_uuid(&self, uuid: &str) -> Result<Option<T>> {
        Ok(self.store.find_by_uuid(uuid).await?)
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> Result<T> {
        Ok(self.store.get_by_uuid(uuid).await?)
    }

    pub async fn find_all(&self) -> Result<Vec<T>> {
        Ok(self.store.find_all().await?)
    }

    pub async fn find_unsynced(&self) -> Result<Vec<T>> {
        Ok(self.store.find_unsynced().await?)
    }

    pub async fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<T>> {
        Ok(self.store.find_by_field(field, value).await?)
    }

    pub async fn count(&self) -> Result<u64> {
        Ok(self.store.count().await?)
    }

    pub async fn save(&self, entity: T) -> Result<T> {
        self.save_with(entity, SaveContext::foreground()).await
    }

    pub async fn save_with(&self, mut entity: T, ctx: SaveContext) -> Result<T> {
        let previous = self.store.find_by_uuid(entity.uuid()).await?;
        for handler in &self.handlers {
            handler
                .before_persist(&mut entity, previous.as_ref(), &ctx)
                .await?;
        }
        // Touch already ran in the handler chain.
        let entity = self.store.save(entity, false).await?;
        for handler in &self.handlers {
            handler.after_persist(&entity, previous.as_ref(), &ctx).await?;
        }
        Ok(entity)
    }

    pub async fn save_all(&self, entities: Vec<T>) -> Result<Vec<T>> {
        let mut saved = Vec::with_capacity(entities.len());
        for entity in entities {
            saved.push(self.save(entity).await?);
        }
        Ok(saved)
    }

    pub async fn delete_by_uuid(&self, uuid: &str) -> Result<bool> {
        self.delete_with(uuid, DeleteOptions::default()).await
    }

    pub async fn delete_with(&self, uuid: &str, options: DeleteOptions) -> Result<bool> {
        if self.store.find_by_uuid(uuid).await?.is_none() {
            return Ok(false);
        }
        let deleted = self.store.delete_by_uuid(uuid).await?;
        if deleted && options.prune_edges {
            if let Some(edges) = &self.edges {
                let removed = edges.delete_for_entity(uuid).await?;
                debug!(uuid, removed, "pruned orphan edges");
            }
        }
        Ok(deleted)
    }
}

impl<T, S> EntityRepository<T, S>
where
    T: Versionable,
    S: EntityStore<T>,
{
    /// Record per-save history through the version store. The cadence comes
    /// from the repository configuration, falling back to the entity's
    /// declared default.
    pub fn with_versioning(self, versions: Arc<KvVersionStore>) -> Self {
        let cadence = self
            .config
            .snapshot_cadence
            .unwrap_or_else(T::snapshot_cadence);
        self.with_handler(Arc::new(VersioningHandler::new(versions, cadence)))
    }
}

impl<T, S> EntityRepository<T, S>
where
    T: Chunkable,
    S: EntityStore<T>,
{
    pub fn with_chunking(self, sink: Arc<dyn ChunkingSink>) -> Self {
        self.with_handler(Arc::new(ChunkingHandler::new(sink)))
    }
}

impl<T, S> EntityRepository<T, S>
where
    T: Embeddable,
    S: SemanticStore<T> + 'static,
{
    pub fn with_embedding_queue(self, queue: Arc<EmbeddingQueue<T, S>>) -> Self {
        self.with_handler(Arc::new(EmbeddingEnqueueHandler::new(queue)))
    }

    /// Embed `query_text` and search the vector index, returning entities
    /// with their similarity, filtered by `min_similarity`.
    pub async fn semantic_search(
        &self,
        query_text: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(T, f32)>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| EngineError::config("repository has no embedding service"))?;
        let vector = embedder.generate(query_text).await?;
        Ok(self
            .store
            .semantic_search(&vector, limit, min_similarity)
            .await?)
    }

    /// Re-embed every entity through the configured embedding service and
    /// rebuild the vector index.
    pub async fn rebuild_index(&self) -> Result<()> {
        let embedder = self
            .embedder
            .clone()
            .ok_or_else(|| EngineError::config("repository has no embedding service"))?;
        let generate = move |text: String| -> EmbedFuture {
            let embedder = embedder.clone();
            Box::pin(async move { embedder.generate(&text).await })
        };
        Ok(self.store.rebuild_index(&generate).await?)
    }
}
