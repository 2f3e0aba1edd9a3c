//! Process-wide publish/subscribe with write-through persistence.
//!
//! `publish` persists the event through the event repository before any
//! subscriber sees it, so an observed event always survives a crash.
//! Delivery walks subscribers in subscription order; one subscriber
//! failing never starves the rest — failures are collected and handed back
//! to the publisher as a [`FanOutError`], while the persisted event stays
//! in the repository.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use uuid::Uuid;

use everstore_storage::{Event, EventRepository};

use crate::error::{EngineError, FanOutError, Result, SubscriberFailure};

/// Matches events by kind and/or correlation id; empty filter matches all.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<String>,
    pub correlation_id: Option<String>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn for_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = &self.kind {
            if event.kind != *kind {
                return false;
            }
        }
        if let Some(correlation_id) = &self.correlation_id {
            if event.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                return false;
            }
        }
        true
    }
}

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    id: u64,
    filter: EventFilter,
    handler: Handler,
}

/// Cancelable subscription handle.
pub struct Subscription {
    id: u64,
    registry: Arc<Mutex<Vec<Registration>>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the subscriber; events published afterwards are not
    /// delivered to it.
    pub fn cancel(self) {
        self.registry.lock().unwrap().retain(|r| r.id != self.id);
    }
}

pub struct EventBus {
    repository: Arc<dyn EventRepository>,
    registry: Arc<Mutex<Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(repository: Arc<dyn EventRepository>) -> Self {
        Self {
            repository,
            registry: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry.lock().unwrap().push(Registration {
            id,
            filter,
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            registry: self.registry.clone(),
        }
    }

    /// Persist `event`, then deliver it to every matching subscriber in
    /// subscription order. Assigns a correlation id when the producer left
    /// it unset.
    pub async fn publish(&self, mut event: Event) -> Result<Event> {
        if event.correlation_id.is_none() {
            event.correlation_id = Some(Uuid::new_v4().to_string());
        }

        // Persistence precedes delivery.
        let stored = self.repository.append(event).await?;
        debug!(event_id = %stored.id, kind = %stored.kind, seq = stored.seq, "event persisted");

        let targets: Vec<(u64, Handler)> = {
            let registry = self.registry.lock().unwrap();
            registry
                .iter()
                .filter(|r| r.filter.matches(&stored))
                .map(|r| (r.id, r.handler.clone()))
                .collect()
        };

        let mut failures = Vec::new();
        for (subscription_id, handler) in targets {
            if let Err(e) = handler(&stored) {
                warn!(
                    subscription_id,
                    event_id = %stored.id,
                    error = %e,
                    "event subscriber failed"
                );
                failures.push(SubscriberFailure {
                    subscription_id,
                    error: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            Ok(stored)
        } else {
            Err(EngineError::FanOut(FanOutError {
                event_id: stored.id,
                failures,
            }))
        }
    }

    pub async fn get_all(&self) -> Result<Vec<Event>> {
        Ok(self.repository.get_all().await?)
    }

    pub async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<Event>> {
        Ok(self.repository.find_by_correlation_id(correlation_id).await?)
    }
}
