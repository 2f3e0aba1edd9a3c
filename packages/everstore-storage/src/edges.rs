//! Directed, typed graph layer over arbitrary entities.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::backend::KvBackend;
use crate::domain::{Edge, EdgeDirection, SyncStatus};
use crate::error::{Result, StorageError};

const STORE: &str = "edges";

/// Edge store over a key/value backend.
///
/// Edges are keyed by their composite identity tuple, which makes the
/// uniqueness constraint structural: a second save of the same tuple fails
/// with `Duplicate` unless the caller asks for a replace.
pub struct KvEdgeStore {
    backend: Arc<dyn KvBackend>,
}

impl KvEdgeStore {
    pub async fn open(backend: Arc<dyn KvBackend>) -> Result<Self> {
        backend
            .declare_store(
                STORE,
                &["sourceUuid", "targetUuid", "edgeType", "syncStatus"],
            )
            .await?;
        Ok(Self { backend })
    }

    fn from_doc(doc: Value) -> Result<Edge> {
        serde_json::from_value(doc)
            .map_err(|e| StorageError::corrupt(format!("stored edge failed to decode: {}", e)))
    }

    fn collect(docs: Vec<Value>) -> Result<Vec<Edge>> {
        docs.into_iter().map(Self::from_doc).collect()
    }

    /// Upsert on the composite key. A second save of the same tuple fails
    /// with `Duplicate` unless `replace` is set.
    pub async fn save(&self, edge: Edge, replace: bool) -> Result<Edge> {
        let key = edge.composite_key();
        if !replace && self.backend.get(STORE, &key).await?.is_some() {
            return Err(StorageError::duplicate(format!("edge {}", key)));
        }
        self.backend
            .put(STORE, &key, &serde_json::to_value(&edge)?)
            .await?;
        Ok(edge)
    }

    /// Delete every edge matching `(source_uuid, target_uuid, edge_type)`
    /// regardless of the endpoint entity kinds. Returns whether anything
    /// was removed.
    pub async fn delete_edge(
        &self,
        source_uuid: &str,
        target_uuid: &str,
        edge_type: &str,
    ) -> Result<bool> {
        let doomed: Vec<String> = self
            .find_by_source(source_uuid)
            .await?
            .into_iter()
            .filter(|e| e.target_uuid == target_uuid && e.edge_type == edge_type)
            .map(|e| e.composite_key())
            .collect();
        if doomed.is_empty() {
            return Ok(false);
        }
        self.backend.delete_many(STORE, &doomed).await?;
        Ok(true)
    }

    pub async fn find_by_source(&self, source_uuid: &str) -> Result<Vec<Edge>> {
        Self::collect(
            self.backend
                .find_by_field(STORE, "sourceUuid", &Value::String(source_uuid.to_string()))
                .await?,
        )
    }

    pub async fn find_by_target(&self, target_uuid: &str) -> Result<Vec<Edge>> {
        Self::collect(
            self.backend
                .find_by_field(STORE, "targetUuid", &Value::String(target_uuid.to_string()))
                .await?,
        )
    }

    pub async fn find_between(&self, source_uuid: &str, target_uuid: &str) -> Result<Vec<Edge>> {
        Ok(self
            .find_by_source(source_uuid)
            .await?
            .into_iter()
            .filter(|e| e.target_uuid == target_uuid)
            .collect())
    }

    pub async fn find_by_type(&self, edge_type: &str) -> Result<Vec<Edge>> {
        Self::collect(
            self.backend
                .find_by_field(STORE, "edgeType", &Value::String(edge_type.to_string()))
                .await?,
        )
    }

    /// Edges still in `local` sync state. Edges whose endpoints are in
    /// conflict are treated like any other edge.
    pub async fn find_unsynced(&self) -> Result<Vec<Edge>> {
        Self::collect(
            self.backend
                .find_by_field(
                    STORE,
                    "syncStatus",
                    &Value::String(SyncStatus::Local.as_str().to_string()),
                )
                .await?,
        )
    }

    pub async fn count(&self) -> Result<u64> {
        self.backend.count(STORE).await
    }

    /// Remove every edge touching `uuid` as source or target. Used by the
    /// repository's opt-in orphan cleanup after an entity delete.
    pub async fn delete_for_entity(&self, uuid: &str) -> Result<usize> {
        let mut doomed: Vec<String> = self
            .find_by_source(uuid)
            .await?
            .iter()
            .map(Edge::composite_key)
            .collect();
        doomed.extend(
            self.find_by_target(uuid)
                .await?
                .iter()
                .map(Edge::composite_key),
        );
        doomed.sort();
        doomed.dedup();
        if !doomed.is_empty() {
            self.backend.delete_many(STORE, &doomed).await?;
        }
        Ok(doomed.len())
    }

    /// Breadth-first traversal from `start`, mapping each reachable uuid to
    /// its hop distance (1..=depth). The start node is excluded; a visited
    /// set keyed by uuid guards against cycles, so a node reached along
    /// several paths keeps its smallest distance.
    pub async fn traverse(
        &self,
        start: &str,
        depth: u32,
        direction: EdgeDirection,
    ) -> Result<HashMap<String, u32>> {
        let mut result = HashMap::new();
        if depth == 0 {
            return Ok(result);
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.to_string());
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((start.to_string(), 0));

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            for neighbor in self.neighbors(&current, direction).await? {
                if visited.insert(neighbor.clone()) {
                    result.insert(neighbor.clone(), hops + 1);
                    queue.push_back((neighbor, hops + 1));
                }
            }
        }
        Ok(result)
    }

    async fn neighbors(&self, uuid: &str, direction: EdgeDirection) -> Result<Vec<String>> {
        let mut neighbors = Vec::new();
        if matches!(direction, EdgeDirection::Outgoing | EdgeDirection::Both) {
            neighbors.extend(
                self.find_by_source(uuid)
                    .await?
                    .into_iter()
                    .map(|e| e.target_uuid),
            );
        }
        if matches!(direction, EdgeDirection::Incoming | EdgeDirection::Both) {
            neighbors.extend(
                self.find_by_target(uuid)
                    .await?
                    .into_iter()
                    .map(|e| e.source_uuid),
            );
        }
        Ok(neighbors)
    }
}
