//! Typed entity adapters over the key/value backends.
//!
//! `KvEntityStore<T>` implements the repository-facing storage contract for
//! one entity kind on top of any [`KvBackend`]. Entities serialize to JSON
//! documents keyed by uuid inside the store named after `T::kind()`.
//!
//! Embeddable kinds open through [`KvEntityStore::open_semantic`], which
//! attaches an in-process HNSW index. The index maps uuids to adapter-local
//! integer handles that never cross the adapter boundary, and persists
//! together with the handle map as a single opaque blob per entity kind.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use everstore_index::{HnswConfig, HnswIndex, Metric};

use crate::backend::{KvBackend, KvTransaction};
use crate::domain::{Embeddable, Entity, SyncStatus};
use crate::error::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Contracts
// ═══════════════════════════════════════════════════════════════════════════

/// Transaction context typed over one entity kind.
pub trait EntityTx<T: Entity> {
    fn find_by_uuid(&mut self, uuid: &str) -> Result<Option<T>>;
    fn save(&mut self, entity: T, touch: bool) -> Result<T>;
    fn delete_by_uuid(&mut self, uuid: &str) -> Result<bool>;
}

pub type EntityTxBody<'a, T> = Box<dyn FnOnce(&mut dyn EntityTx<T>) -> Result<()> + Send + 'a>;

/// Storage contract for one entity kind.
#[async_trait]
pub trait EntityStore<T: Entity>: Send + Sync {
    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<T>>;

    /// Like [`find_by_uuid`](Self::find_by_uuid) but fails with `NotFound`.
    async fn get_by_uuid(&self, uuid: &str) -> Result<T>;

    async fn find_all(&self) -> Result<Vec<T>>;

    /// Persist `entity`. When `touch` is true, `updatedAt` is set to now;
    /// background side-effects pass false to leave it undisturbed.
    async fn save(&self, entity: T, touch: bool) -> Result<T>;

    /// Batched save; atomic on backends with synchronous transactions,
    /// sequential otherwise.
    async fn save_all(&self, entities: Vec<T>) -> Result<Vec<T>>;

    async fn delete_by_uuid(&self, uuid: &str) -> Result<bool>;

    async fn delete_all(&self, uuids: &[String]) -> Result<()>;

    /// Entities still in `local` sync state.
    async fn find_unsynced(&self) -> Result<Vec<T>>;

    /// Exact match on a declared top-level field.
    async fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<T>>;

    async fn count(&self) -> Result<u64>;

    fn supports_transactions(&self) -> bool;

    /// Run `body` inside a synchronous transaction; `NotSupported` on
    /// backends without one. The transactional surface covers document
    /// state only — vector-index maintenance happens on the regular save
    /// path.
    fn transaction(&self, body: EntityTxBody<'_, T>) -> Result<()>;
}

pub type EmbedFuture = BoxFuture<'static, Result<Vec<f32>>>;

/// Semantic search surface available on embeddable entity kinds.
#[async_trait]
pub trait SemanticStore<T: Embeddable>: EntityStore<T> {
    fn metric(&self) -> Metric;
    fn dimension(&self) -> usize;

    /// K-nearest entities by embedding distance, filtered by similarity.
    /// Similarity is `1 − distance` under cosine and `1 / (1 + distance)`
    /// under euclidean.
    async fn semantic_search(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(T, f32)>>;

    /// Re-embed every entity through `generate` and rebuild the index from
    /// scratch. Entities with a blank embedding text lose their vector.
    async fn rebuild_index(
        &self,
        generate: &(dyn Fn(String) -> EmbedFuture + Send + Sync),
    ) -> Result<()>;

    /// Background write: store `vector` on the entity without touching
    /// `updatedAt`, then refresh the index. `NotFound` when the entity no
    /// longer exists.
    async fn apply_embedding(&self, uuid: &str, vector: Vec<f32>) -> Result<T>;

    /// Drop an entity's vector from the index (the document keeps its
    /// embedding field untouched).
    async fn remove_from_index(&self, uuid: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Vector index state
// ═══════════════════════════════════════════════════════════════════════════

/// HNSW settings for one semantic entity kind.
#[derive(Debug, Clone, Copy)]
pub struct VectorIndexConfig {
    pub dimension: usize,
    pub metric: Metric,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            metric: Metric::Cosine,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

impl VectorIndexConfig {
    fn hnsw(&self) -> HnswConfig {
        HnswConfig::new(self.dimension, self.metric)
            .with_m(self.m)
            .with_ef(self.ef_construction, self.ef_search)
    }
}

/// uuid ↔ node-handle map serialized next to the index bytes.
#[derive(Serialize, Deserialize)]
struct IndexEnvelope {
    next_node: u64,
    nodes: HashMap<String, u64>,
}

struct VectorState {
    index: HnswIndex,
    uuid_to_node: HashMap<String, u64>,
    node_to_uuid: HashMap<u64, String>,
    next_node: u64,
}

impl VectorState {
    fn fresh(config: &VectorIndexConfig) -> Self {
        Self {
            index: HnswIndex::new(config.hnsw()),
            uuid_to_node: HashMap::new(),
            node_to_uuid: HashMap::new(),
            next_node: 0,
        }
    }

    /// Bring the indexed vector for `uuid` in line with `vector`; returns
    /// whether the index changed.
    fn sync(&mut self, uuid: &str, vector: Option<Vec<f32>>) -> Result<bool> {
        match vector {
            Some(v) => {
                if let Some(&node) = self.uuid_to_node.get(uuid) {
                    if self.index.get_vector(node) == Some(v.as_slice()) {
                        return Ok(false);
                    }
                    self.index.delete(node);
                    self.uuid_to_node.remove(uuid);
                    self.node_to_uuid.remove(&node);
                }
                let node = self.next_node;
                self.next_node += 1;
                self.index.insert(node, &v)?;
                self.uuid_to_node.insert(uuid.to_string(), node);
                self.node_to_uuid.insert(node, uuid.to_string());
                Ok(true)
            }
            None => {
                if let Some(node) = self.uuid_to_node.remove(uuid) {
                    self.index.delete(node);
                    self.node_to_uuid.remove(&node);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let envelope = IndexEnvelope {
            next_node: self.next_node,
            nodes: self.uuid_to_node.clone(),
        };
        let header = serde_json::to_vec(&envelope)?;
        let index_bytes = self.index.serialize();
        let mut blob = Vec::with_capacity(4 + header.len() + index_bytes.len());
        blob.extend_from_slice(&(header.len() as u32).to_le_bytes());
        blob.extend_from_slice(&header);
        blob.extend_from_slice(&index_bytes);
        Ok(blob)
    }

    fn deserialize(blob: &[u8], config: &VectorIndexConfig) -> Result<Self> {
        if blob.len() < 4 {
            return Err(StorageError::corrupt("vector index blob truncated"));
        }
        let header_len = u32::from_le_bytes(blob[..4].try_into().expect("4 bytes")) as usize;
        if blob.len() < 4 + header_len {
            return Err(StorageError::corrupt("vector index blob truncated"));
        }
        let envelope: IndexEnvelope = serde_json::from_slice(&blob[4..4 + header_len])
            .map_err(|e| StorageError::corrupt(format!("vector index map unreadable: {}", e)))?;
        let index = HnswIndex::deserialize(
            &blob[4 + header_len..],
            config.ef_construction,
            config.ef_search,
        )?;
        let node_to_uuid: HashMap<u64, String> = envelope
            .nodes
            .iter()
            .map(|(uuid, &node)| (node, uuid.clone()))
            .collect();
        if node_to_uuid.len() != envelope.nodes.len() {
            return Err(StorageError::corrupt("vector index map has duplicate nodes"));
        }
        Ok(Self {
            index,
            uuid_to_node: envelope.nodes,
            node_to_uuid,
            next_node: envelope.next_node,
        })
    }
}

struct VectorHandle<T> {
    config: VectorIndexConfig,
    state: RwLock<VectorState>,
    /// Pulls the stored vector out of an entity; captured as a plain fn so
    /// the `Entity`-bounded save path can use it without an `Embeddable`
    /// bound.
    extract: fn(&T) -> Option<Vec<f32>>,
}

// ═══════════════════════════════════════════════════════════════════════════
// KvEntityStore
// ═══════════════════════════════════════════════════════════════════════════

pub struct KvEntityStore<T: Entity> {
    backend: Arc<dyn KvBackend>,
    store_name: &'static str,
    vectors: Option<VectorHandle<T>>,
}

impl<T: Entity> KvEntityStore<T> {
    /// Open the store for a plain entity kind.
    pub async fn open(backend: Arc<dyn KvBackend>) -> Result<Self> {
        Self::declare(&backend).await?;
        Ok(Self {
            backend,
            store_name: T::kind(),
            vectors: None,
        })
    }

    async fn declare(backend: &Arc<dyn KvBackend>) -> Result<()> {
        let mut fields: Vec<&str> = vec!["syncStatus"];
        fields.extend_from_slice(T::indexed_fields());
        backend.declare_store(T::kind(), &fields).await
    }

    fn blob_key(&self) -> String {
        format!("vector_index:{}", self.store_name)
    }

    fn to_doc(entity: &T) -> Result<Value> {
        serde_json::to_value(entity)
            .map_err(|e| StorageError::serialization(format!("entity encode failed: {}", e)))
    }

    fn from_doc(doc: Value) -> Result<T> {
        serde_json::from_value(doc).map_err(|e| {
            StorageError::corrupt(format!("stored {} failed to decode: {}", T::kind(), e))
        })
    }

    /// Reconcile the vector index with an entity's current embedding.
    fn sync_vector(&self, uuid: &str, vector: Option<Vec<f32>>) -> Result<bool> {
        let Some(handle) = &self.vectors else {
            return Ok(false);
        };
        let mut state = handle.state.write().unwrap();
        state.sync(uuid, vector)
    }

    async fn persist_index(&self) -> Result<()> {
        let Some(handle) = &self.vectors else {
            return Ok(());
        };
        let blob = {
            let state = handle.state.read().unwrap();
            state.serialize()?
        };
        self.backend.put_blob(&self.blob_key(), &blob).await
    }
}

impl<T: Embeddable> KvEntityStore<T> {
    /// Open the store with an attached vector index, restoring the index
    /// blob persisted alongside the entities when one exists.
    pub async fn open_semantic(
        backend: Arc<dyn KvBackend>,
        config: VectorIndexConfig,
    ) -> Result<Self> {
        Self::declare(&backend).await?;
        let blob_key = format!("vector_index:{}", T::kind());
        let state = match backend.get_blob(&blob_key).await? {
            Some(blob) => match VectorState::deserialize(&blob, &config) {
                Ok(state)
                    if state.index.config().dimensions == config.dimension
                        && state.index.config().metric == config.metric =>
                {
                    debug!(
                        kind = T::kind(),
                        nodes = state.index.len(),
                        "restored vector index"
                    );
                    state
                }
                Ok(_) => {
                    warn!(
                        kind = T::kind(),
                        "vector index blob does not match configuration, starting empty"
                    );
                    VectorState::fresh(&config)
                }
                Err(e) => {
                    warn!(
                        kind = T::kind(),
                        error = %e,
                        "vector index blob unreadable, starting empty"
                    );
                    VectorState::fresh(&config)
                }
            },
            None => VectorState::fresh(&config),
        };
        Ok(Self {
            backend,
            store_name: T::kind(),
            vectors: Some(VectorHandle {
                config,
                state: RwLock::new(state),
                extract: |entity| entity.embedding().map(|v| v.to_vec()),
            }),
        })
    }
}

#[async_trait]
impl<T: Entity> EntityStore<T> for KvEntityStore<T> {
    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<T>> {
        self.backend
            .get(self.store_name, uuid)
            .await?
            .map(Self::from_doc)
            .transpose()
    }

    async fn get_by_uuid(&self, uuid: &str) -> Result<T> {
        self.find_by_uuid(uuid)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("{} {}", self.store_name, uuid)))
    }

    async fn find_all(&self) -> Result<Vec<T>> {
        self.backend
            .scan(self.store_name)
            .await?
            .into_iter()
            .map(Self::from_doc)
            .collect()
    }

    async fn save(&self, mut entity: T, touch: bool) -> Result<T> {
        if touch {
            entity.core_mut().touch();
        }
        let doc = Self::to_doc(&entity)?;
        self.backend
            .put(self.store_name, entity.uuid(), &doc)
            .await?;

        if let Some(handle) = &self.vectors {
            let vector = (handle.extract)(&entity);
            if self.sync_vector(entity.uuid(), vector)? {
                self.persist_index().await?;
            }
        }
        Ok(entity)
    }

    async fn save_all(&self, mut entities: Vec<T>) -> Result<Vec<T>> {
        for entity in &mut entities {
            entity.core_mut().touch();
        }
        if self.backend.supports_transactions() {
            let mut batch = Vec::with_capacity(entities.len());
            for entity in &entities {
                batch.push((entity.uuid().to_string(), Self::to_doc(entity)?));
            }
            self.backend.put_many(self.store_name, &batch).await?;
        } else {
            for entity in &entities {
                let doc = Self::to_doc(entity)?;
                self.backend.put(self.store_name, entity.uuid(), &doc).await?;
            }
        }

        if let Some(handle) = &self.vectors {
            let mut mutated = false;
            for entity in &entities {
                mutated |= self.sync_vector(entity.uuid(), (handle.extract)(entity))?;
            }
            if mutated {
                self.persist_index().await?;
            }
        }
        Ok(entities)
    }

    async fn delete_by_uuid(&self, uuid: &str) -> Result<bool> {
        let deleted = self.backend.delete(self.store_name, uuid).await?;
        if deleted && self.sync_vector(uuid, None)? {
            self.persist_index().await?;
        }
        Ok(deleted)
    }

    async fn delete_all(&self, uuids: &[String]) -> Result<()> {
        self.backend.delete_many(self.store_name, uuids).await?;
        if self.vectors.is_some() {
            let mut mutated = false;
            for uuid in uuids {
                mutated |= self.sync_vector(uuid, None)?;
            }
            if mutated {
                self.persist_index().await?;
            }
        }
        Ok(())
    }

    async fn find_unsynced(&self) -> Result<Vec<T>> {
        self.find_by_field(
            "syncStatus",
            &Value::String(SyncStatus::Local.as_str().to_string()),
        )
        .await
    }

    async fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<T>> {
        self.backend
            .find_by_field(self.store_name, field, value)
            .await?
            .into_iter()
            .map(Self::from_doc)
            .collect()
    }

    async fn count(&self) -> Result<u64> {
        self.backend.count(self.store_name).await
    }

    fn supports_transactions(&self) -> bool {
        self.backend.supports_transactions()
    }

    fn transaction(&self, body: EntityTxBody<'_, T>) -> Result<()> {
        let store_name = self.store_name;
        self.backend.transaction(Box::new(move |kv| {
            let mut typed = TypedTx {
                kv,
                store_name,
                _marker: PhantomData::<T>,
            };
            body(&mut typed)
        }))
    }
}

struct TypedTx<'a, T> {
    kv: &'a mut dyn KvTransaction,
    store_name: &'static str,
    _marker: PhantomData<T>,
}

impl<T: Entity> EntityTx<T> for TypedTx<'_, T> {
    fn find_by_uuid(&mut self, uuid: &str) -> Result<Option<T>> {
        self.kv
            .get(self.store_name, uuid)?
            .map(KvEntityStore::<T>::from_doc)
            .transpose()
    }

    fn save(&mut self, mut entity: T, touch: bool) -> Result<T> {
        if touch {
            entity.core_mut().touch();
        }
        let doc = KvEntityStore::<T>::to_doc(&entity)?;
        self.kv.put(self.store_name, entity.uuid(), &doc)?;
        Ok(entity)
    }

    fn delete_by_uuid(&mut self, uuid: &str) -> Result<bool> {
        self.kv.delete(self.store_name, uuid)
    }
}

#[async_trait]
impl<T: Embeddable> SemanticStore<T> for KvEntityStore<T> {
    fn metric(&self) -> Metric {
        self.vectors
            .as_ref()
            .map(|h| h.config.metric)
            .unwrap_or(Metric::Cosine)
    }

    fn dimension(&self) -> usize {
        self.vectors
            .as_ref()
            .map(|h| h.config.dimension)
            .unwrap_or(0)
    }

    async fn semantic_search(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(T, f32)>> {
        let handle = self
            .vectors
            .as_ref()
            .ok_or_else(|| StorageError::not_supported("store opened without a vector index"))?;

        let hits: Vec<(String, f64)> = {
            let state = handle.state.read().unwrap();
            state
                .index
                .search(query, limit, None)
                .map_err(StorageError::from)?
                .into_iter()
                .filter_map(|n| {
                    state
                        .node_to_uuid
                        .get(&n.id)
                        .map(|uuid| (uuid.clone(), n.distance))
                })
                .collect()
        };

        let metric = handle.config.metric;
        let mut results = Vec::with_capacity(hits.len());
        for (uuid, distance) in hits {
            let similarity = match metric {
                Metric::Cosine => (1.0 - distance) as f32,
                Metric::Euclidean => (1.0 / (1.0 + distance)) as f32,
            };
            if similarity < min_similarity {
                continue;
            }
            // An index hit whose document vanished is skipped, not an error.
            if let Some(entity) = self.find_by_uuid(&uuid).await? {
                results.push((entity, similarity));
            }
        }
        Ok(results)
    }

    async fn rebuild_index(
        &self,
        generate: &(dyn Fn(String) -> EmbedFuture + Send + Sync),
    ) -> Result<()> {
        let handle = self
            .vectors
            .as_ref()
            .ok_or_else(|| StorageError::not_supported("store opened without a vector index"))?;

        let entities = self.find_all().await?;
        let mut embedded = Vec::with_capacity(entities.len());
        for mut entity in entities {
            let text = entity.embedding_text();
            if text.trim().is_empty() {
                entity.set_embedding(None);
            } else {
                let vector = generate(text).await?;
                entity.set_embedding(Some(vector));
            }
            let doc = Self::to_doc(&entity)?;
            self.backend.put(self.store_name, entity.uuid(), &doc).await?;
            embedded.push(entity);
        }

        {
            let mut state = handle.state.write().unwrap();
            *state = VectorState::fresh(&handle.config);
            for entity in &embedded {
                if let Some(vector) = entity.embedding() {
                    state.sync(entity.uuid(), Some(vector.to_vec()))?;
                }
            }
        }
        self.persist_index().await?;
        debug!(kind = self.store_name, count = embedded.len(), "rebuilt vector index");
        Ok(())
    }

    async fn apply_embedding(&self, uuid: &str, vector: Vec<f32>) -> Result<T> {
        let mut entity = self.get_by_uuid(uuid).await?;
        entity.set_embedding(Some(vector.clone()));
        let doc = Self::to_doc(&entity)?;
        // Background side-effect: no touch, no history.
        self.backend.put(self.store_name, uuid, &doc).await?;
        if self.sync_vector(uuid, Some(vector))? {
            self.persist_index().await?;
        }
        Ok(entity)
    }

    async fn remove_from_index(&self, uuid: &str) -> Result<()> {
        if self.sync_vector(uuid, None)? {
            self.persist_index().await?;
        }
        Ok(())
    }
}
