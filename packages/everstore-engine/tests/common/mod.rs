//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use everstore_storage::{
    ChunkPreset, Chunkable, Embeddable, EmbeddingService, Entity, EntityCore, Result, Edgeable,
    SnapshotCadence, StorageError, Versionable,
};

/// A user-authored note exercising the full capability stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(flatten)]
    pub core: EntityCore,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Note {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            core: EntityCore::new(),
            title: title.to_string(),
            body: body.to_string(),
            version: 0,
            embedding: None,
        }
    }
}

impl Entity for Note {
    fn kind() -> &'static str {
        "notes"
    }
    fn core(&self) -> &EntityCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }
    fn indexed_fields() -> &'static [&'static str] {
        &["title"]
    }
}

impl Versionable for Note {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
    fn snapshot_cadence() -> SnapshotCadence {
        SnapshotCadence::Every(10)
    }
}

impl Embeddable for Note {
    fn embedding_text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }
    fn set_embedding(&mut self, vector: Option<Vec<f32>>) {
        self.embedding = vector;
    }
}

impl Chunkable for Note {
    fn chunk_text(&self) -> String {
        self.body.clone()
    }
    fn chunk_preset(&self) -> ChunkPreset {
        ChunkPreset::Parent
    }
}

impl Edgeable for Note {}

/// Deterministic 3-d embedder: known topics map to orthogonal axes.
pub struct TopicEmbedder;

#[async_trait]
impl EmbeddingService for TopicEmbedder {
    fn dimension(&self) -> usize {
        3
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains("alpha") {
            Ok(vec![1.0, 0.0, 0.0])
        } else if text.contains("beta") {
            Ok(vec![0.0, 1.0, 0.0])
        } else {
            Ok(vec![0.0, 0.0, 1.0])
        }
    }
}

/// Fails the first `failures` single-embedding calls, then returns a vector
/// tagged with the attempt number. The batch endpoint is always down,
/// forcing the queue onto its per-task fallback path.
pub struct FlakyEmbedder {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyEmbedder {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingService for FlakyEmbedder {
    fn dimension(&self) -> usize {
        3
    }

    async fn generate(&self, _text: &str) -> Result<Vec<f32>> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            Err(StorageError::database(format!(
                "embedding backend unavailable (attempt {})",
                attempt
            )))
        } else {
            Ok(vec![attempt as f32, 0.0, 0.0])
        }
    }

    async fn generate_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(StorageError::database("batch endpoint down"))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// The entity document minus the keys the save machinery rewrites; what
/// the version store records.
pub fn versioned_projection(note: &Note) -> serde_json::Value {
    let mut value = serde_json::to_value(note).unwrap();
    let map = value.as_object_mut().unwrap();
    map.remove("updatedAt");
    map.remove("version");
    value
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
