//! Ordered, append-only event sink with correlation-id queries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::KvBackend;
use crate::domain::Event;
use crate::error::{Result, StorageError};

const STORE: &str = "events";

/// Append-only event repository consumed by the bus.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Persist an event, assigning its sequence number. Returns the stored
    /// form.
    async fn append(&self, event: Event) -> Result<Event>;

    /// All events in append order.
    async fn get_all(&self) -> Result<Vec<Event>>;

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<Event>>;
}

/// Event repository over a key/value backend.
pub struct KvEventRepository {
    backend: Arc<dyn KvBackend>,
    next_seq: AtomicU64,
}

impl KvEventRepository {
    pub async fn open(backend: Arc<dyn KvBackend>) -> Result<Self> {
        backend.declare_store(STORE, &["correlationId"]).await?;
        // Resume the sequence after a restart.
        let max_seq = backend
            .scan(STORE)
            .await?
            .iter()
            .filter_map(|doc| doc.get("seq").and_then(Value::as_u64))
            .max()
            .unwrap_or(0);
        Ok(Self {
            backend,
            next_seq: AtomicU64::new(max_seq + 1),
        })
    }

    fn from_doc(doc: Value) -> Result<Event> {
        serde_json::from_value(doc)
            .map_err(|e| StorageError::corrupt(format!("stored event failed to decode: {}", e)))
    }

    fn sorted(mut events: Vec<Event>) -> Vec<Event> {
        events.sort_by_key(|e| e.seq);
        events
    }
}

#[async_trait]
impl EventRepository for KvEventRepository {
    async fn append(&self, mut event: Event) -> Result<Event> {
        event.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let doc = serde_json::to_value(&event)?;
        self.backend.put(STORE, &event.id, &doc).await?;
        Ok(event)
    }

    async fn get_all(&self) -> Result<Vec<Event>> {
        let events = self
            .backend
            .scan(STORE)
            .await?
            .into_iter()
            .map(Self::from_doc)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::sorted(events))
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<Event>> {
        let events = self
            .backend
            .find_by_field(
                STORE,
                "correlationId",
                &Value::String(correlation_id.to_string()),
            )
            .await?
            .into_iter()
            .map(Self::from_doc)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::sorted(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::IndexedBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_assigns_monotonic_seq() {
        let repo = KvEventRepository::open(Arc::new(IndexedBackend::new()))
            .await
            .unwrap();
        let a = repo.append(Event::new("a", json!({}))).await.unwrap();
        let b = repo.append(Event::new("b", json!({}))).await.unwrap();
        assert!(b.seq > a.seq);

        let all = repo.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, "a");
        assert_eq!(all[1].kind, "b");
    }

    #[tokio::test]
    async fn test_find_by_correlation_id() {
        let repo = KvEventRepository::open(Arc::new(IndexedBackend::new()))
            .await
            .unwrap();
        repo.append(Event::new("a", json!({})).with_correlation_id("corr-1"))
            .await
            .unwrap();
        repo.append(Event::new("b", json!({})).with_correlation_id("corr-2"))
            .await
            .unwrap();
        repo.append(Event::new("c", json!({})).with_correlation_id("corr-1"))
            .await
            .unwrap();

        let found = repo.find_by_correlation_id("corr-1").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].kind, "a");
        assert_eq!(found[1].kind, "c");
    }

    #[tokio::test]
    async fn test_sequence_resumes_after_reopen() {
        let backend: Arc<dyn KvBackend> = Arc::new(IndexedBackend::new());
        let first_seq;
        {
            let repo = KvEventRepository::open(backend.clone()).await.unwrap();
            first_seq = repo.append(Event::new("a", json!({}))).await.unwrap().seq;
        }
        let repo = KvEventRepository::open(backend).await.unwrap();
        let next = repo.append(Event::new("b", json!({}))).await.unwrap();
        assert!(next.seq > first_seq);
    }
}
