//! Durable store for embedding-queue tasks.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::backend::KvBackend;
use crate::domain::{EmbeddingTask, TaskStatus};
use crate::error::{Result, StorageError};

const STORE: &str = "embedding_tasks";

/// Task store over a key/value backend.
///
/// Tasks live in the same persistence substrate as the entities they
/// embed, so queue state survives a crash. Terminal tasks are retained for
/// diagnostics and ignored by scheduling.
pub struct KvTaskStore {
    backend: Arc<dyn KvBackend>,
}

impl KvTaskStore {
    pub async fn open(backend: Arc<dyn KvBackend>) -> Result<Self> {
        backend
            .declare_store(STORE, &["status", "entityUuid"])
            .await?;
        Ok(Self { backend })
    }

    fn from_doc(doc: Value) -> Result<EmbeddingTask> {
        serde_json::from_value(doc)
            .map_err(|e| StorageError::corrupt(format!("stored task failed to decode: {}", e)))
    }

    pub async fn put(&self, task: &EmbeddingTask) -> Result<()> {
        self.backend
            .put(STORE, &task.id, &serde_json::to_value(task)?)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<EmbeddingTask>> {
        self.backend
            .get(STORE, id)
            .await?
            .map(Self::from_doc)
            .transpose()
    }

    /// Tasks in `status`, oldest first.
    pub async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<EmbeddingTask>> {
        let mut tasks: Vec<EmbeddingTask> = self
            .backend
            .find_by_field(STORE, "status", &Value::String(status.as_str().to_string()))
            .await?
            .into_iter()
            .map(Self::from_doc)
            .collect::<Result<_>>()?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// The non-terminal task for an entity, if one exists. The queue keeps
    /// at most one.
    pub async fn find_active(&self, entity_uuid: &str) -> Result<Option<EmbeddingTask>> {
        let tasks: Vec<EmbeddingTask> = self
            .backend
            .find_by_field(
                STORE,
                "entityUuid",
                &Value::String(entity_uuid.to_string()),
            )
            .await?
            .into_iter()
            .map(Self::from_doc)
            .collect::<Result<_>>()?;
        Ok(tasks.into_iter().find(|t| !t.status.is_terminal()))
    }

    pub async fn count_by_status(&self, status: TaskStatus) -> Result<usize> {
        Ok(self.find_by_status(status).await?.len())
    }

    pub async fn all(&self) -> Result<Vec<EmbeddingTask>> {
        self.backend
            .scan(STORE)
            .await?
            .into_iter()
            .map(Self::from_doc)
            .collect()
    }

    /// Crash recovery: re-interpret in-flight tasks as pending so the next
    /// worker picks them up again (at-least-once delivery).
    pub async fn recover(&self) -> Result<usize> {
        let stuck = self.find_by_status(TaskStatus::Processing).await?;
        let recovered = stuck.len();
        for mut task in stuck {
            task.status = TaskStatus::Pending;
            self.put(&task).await?;
        }
        if recovered > 0 {
            info!(recovered, "requeued in-flight embedding tasks after restart");
        }
        Ok(recovered)
    }
}
