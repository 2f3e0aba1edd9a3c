//! Durable background queue for batched embedding generation.
//!
//! Entity writes enqueue work here instead of embedding inline; a periodic
//! tick drains the queue in batches. Task state lives in the same
//! persistence substrate as the entities, so the queue survives a crash:
//! on restart, in-flight tasks are re-interpreted as pending
//! (at-least-once delivery — the latest entity write wins, so re-embedding
//! is idempotent).
//!
//! Vectors are written back through the semantic store's background path,
//! which leaves `updatedAt` untouched and records no history. That break
//! is what keeps save → embed → save from cycling through the versioning
//! handler forever.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use everstore_storage::{
    Embeddable, EmbeddingService, EmbeddingTask, ErrorKind, KvTaskStore, SemanticStore,
    StorageError, TaskStatus,
};

use crate::error::{EngineError, Result};

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub processing_interval: Duration,
    pub max_retries: u32,
    /// Deadline for one `generate_batch` call.
    pub batch_deadline: Duration,
    /// Deadline for one per-task `generate` fallback call.
    pub task_deadline: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            processing_interval: Duration::from_secs(2),
            max_retries: 3,
            batch_deadline: Duration::from_secs(30),
            task_deadline: Duration::from_secs(15),
        }
    }
}

/// Background embedding worker over one semantic entity store.
pub struct EmbeddingQueue<T, S>
where
    T: Embeddable,
    S: SemanticStore<T> + 'static,
{
    tasks: Arc<KvTaskStore>,
    store: Arc<S>,
    embedder: Arc<dyn EmbeddingService>,
    config: QueueConfig,
    /// Single-worker discipline: at most one batch runs at a time.
    processing: AtomicBool,
    /// Transient retry gates (task id → earliest next attempt). Not
    /// persisted; a restart retries immediately, which at-least-once
    /// delivery already allows.
    backoff: Mutex<HashMap<String, tokio::time::Instant>>,
    cancel: CancellationToken,
    tick: std::sync::Mutex<Option<JoinHandle<()>>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, S> EmbeddingQueue<T, S>
where
    T: Embeddable,
    S: SemanticStore<T> + 'static,
{
    pub fn new(
        tasks: Arc<KvTaskStore>,
        store: Arc<S>,
        embedder: Arc<dyn EmbeddingService>,
        config: QueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks,
            store,
            embedder,
            config,
            processing: AtomicBool::new(false),
            backoff: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tick: std::sync::Mutex::new(None),
            _entity: PhantomData,
        })
    }

    /// Requeue tasks left in `processing` by a previous process.
    pub async fn recover(&self) -> Result<usize> {
        Ok(self.tasks.recover().await?)
    }

    /// Spawn the periodic tick. Idempotent; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.tick.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let queue = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(queue.config.processing_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = queue.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue.try_run_batch().await {
                            error!(error = %e, "embedding batch failed");
                        }
                    }
                }
            }
        }));
    }

    /// Cancel the periodic tick, optionally draining the queue first.
    pub async fn stop(&self, flush_pending: bool) -> Result<()> {
        if flush_pending {
            self.flush().await?;
        }
        self.cancel.cancel();
        let handle = self.tick.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Queue embedding work for an entity. Blank text and entities that
    /// already have a live task are no-ops. Filling a whole batch triggers
    /// processing immediately instead of waiting for the tick.
    pub async fn enqueue(
        &self,
        entity_uuid: &str,
        entity_type: &str,
        text: &str,
    ) -> Result<Option<EmbeddingTask>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        if self.tasks.find_active(entity_uuid).await?.is_some() {
            debug!(entity_uuid, "embedding task already queued");
            return Ok(None);
        }
        let task = EmbeddingTask::new(entity_uuid, entity_type, text);
        self.tasks.put(&task).await?;
        debug!(entity_uuid, task_id = %task.id, "queued embedding task");

        if self.tasks.count_by_status(TaskStatus::Pending).await? >= self.config.batch_size {
            self.try_run_batch().await?;
        }
        Ok(Some(task))
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.tasks.count_by_status(TaskStatus::Pending).await?)
    }

    /// Run one batch unless another is already running. Returns whether a
    /// batch executed.
    pub async fn try_run_batch(&self) -> Result<bool> {
        if self.processing.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = self.run_one_batch().await;
        self.processing.store(false, Ordering::SeqCst);
        result
    }

    async fn run_one_batch(&self) -> Result<bool> {
        let now = tokio::time::Instant::now();
        let gates = self.backoff.lock().await;
        let ready: Vec<EmbeddingTask> = self
            .tasks
            .find_by_status(TaskStatus::Pending)
            .await?
            .into_iter()
            .filter(|t| gates.get(&t.id).map(|&at| at <= now).unwrap_or(true))
            .take(self.config.batch_size)
            .collect();
        drop(gates);

        if ready.is_empty() {
            return Ok(false);
        }

        let mut claimed = Vec::with_capacity(ready.len());
        for mut task in ready {
            task.mark_processing();
            self.tasks.put(&task).await?;
            claimed.push(task);
        }

        let texts: Vec<String> = claimed.iter().map(|t| t.text.clone()).collect();
        let batch = tokio::time::timeout(
            self.config.batch_deadline,
            self.embedder.generate_batch(&texts),
        )
        .await;

        match batch {
            Ok(Ok(vectors)) if vectors.len() == claimed.len() => {
                for (task, vector) in claimed.into_iter().zip(vectors) {
                    self.apply_vector(task, vector).await?;
                }
            }
            outcome => {
                match &outcome {
                    Ok(Ok(vectors)) => warn!(
                        expected = texts.len(),
                        got = vectors.len(),
                        "batch embedding returned wrong arity, falling back to single calls"
                    ),
                    Ok(Err(e)) => warn!(error = %e, "batch embedding failed, falling back to single calls"),
                    Err(_) => warn!("batch embedding timed out, falling back to single calls"),
                }
                for task in claimed {
                    self.embed_single(task).await?;
                }
            }
        }
        Ok(true)
    }

    async fn embed_single(&self, task: EmbeddingTask) -> Result<()> {
        let attempt = tokio::time::timeout(
            self.config.task_deadline,
            self.embedder.generate(&task.text),
        )
        .await;
        match attempt {
            Ok(Ok(vector)) => self.apply_vector(task, vector).await,
            Ok(Err(e)) => self.fail_attempt(task, e.to_string()).await,
            Err(_) => {
                let deadline = self.config.task_deadline;
                self.fail_attempt(task, format!("embedding timed out after {:?}", deadline))
                    .await
            }
        }
    }

    async fn apply_vector(&self, mut task: EmbeddingTask, vector: Vec<f32>) -> Result<()> {
        match self.store.apply_embedding(&task.entity_uuid, vector).await {
            Ok(_) => {
                task.mark_completed();
                self.backoff.lock().await.remove(&task.id);
                self.tasks.put(&task).await?;
                debug!(entity_uuid = %task.entity_uuid, "embedding applied");
                Ok(())
            }
            Err(StorageError {
                kind: ErrorKind::NotFound,
                ..
            }) => {
                // Entity deleted while the task was in flight; the result
                // is discarded, not an error.
                task.mark_completed();
                self.backoff.lock().await.remove(&task.id);
                self.tasks.put(&task).await?;
                debug!(entity_uuid = %task.entity_uuid, "entity gone, embedding discarded");
                Ok(())
            }
            Err(e) => self.fail_attempt(task, e.to_string()).await,
        }
    }

    async fn fail_attempt(&self, mut task: EmbeddingTask, error: String) -> Result<()> {
        task.mark_attempt_failed(error.clone(), self.config.max_retries);
        if task.status == TaskStatus::Failed {
            warn!(
                entity_uuid = %task.entity_uuid,
                retries = task.retry_count,
                error = %error,
                "embedding task exhausted its retries"
            );
            self.backoff.lock().await.remove(&task.id);
        } else {
            let delay = Duration::from_secs(2 * task.retry_count as u64);
            self.backoff
                .lock()
                .await
                .insert(task.id.clone(), tokio::time::Instant::now() + delay);
            debug!(
                entity_uuid = %task.entity_uuid,
                retry = task.retry_count,
                delay_secs = delay.as_secs(),
                "embedding attempt failed, retrying"
            );
        }
        self.tasks.put(&task).await?;
        Ok(())
    }

    /// Run batches until no pending work remains. A watchdog fails the
    /// flush after 100 consecutive iterations without progress.
    pub async fn flush(&self) -> Result<()> {
        let mut idle_iterations = 0u32;
        loop {
            let pending = self.tasks.count_by_status(TaskStatus::Pending).await?;
            if pending == 0 {
                return Ok(());
            }
            let ran = self.try_run_batch().await?;
            let after = self.tasks.count_by_status(TaskStatus::Pending).await?;
            if ran && after < pending {
                idle_iterations = 0;
            } else {
                idle_iterations += 1;
                if idle_iterations >= 100 {
                    return Err(EngineError::Timeout(
                        "flush made no progress for 100 iterations".to_string(),
                    ));
                }
                // Give retry backoffs a chance to expire.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

impl<T, S> Drop for EmbeddingQueue<T, S>
where
    T: Embeddable,
    S: SemanticStore<T> + 'static,
{
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut guard) = self.tick.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl<T, S> std::fmt::Debug for EmbeddingQueue<T, S>
where
    T: Embeddable,
    S: SemanticStore<T> + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingQueue")
            .field("batch_size", &self.config.batch_size)
            .field("max_retries", &self.config.max_retries)
            .finish()
    }
}
