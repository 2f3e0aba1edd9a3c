//! Domain layer: the persisted entity model and its capability traits.
//!
//! Every record the engine stores derives from the same lifecycle core
//! (uuid, timestamps, sync state). Capabilities are attached by trait
//! composition, not inheritance: an entity opts into embedding, chunking,
//! versioning, ownership, temporal fields, graph participation, or a tool
//! birth certificate by implementing the matching trait. Domain entities
//! carry no backend-specific markers; backend bindings live in the adapter
//! layer so the same entity compiles against every storage backend.

mod edge;
mod event;
mod task;
mod version;

pub use edge::{Edge, EdgeDirection};
pub use event::Event;
pub use task::{EmbeddingTask, TaskStatus};
pub use version::{EntityVersion, VersionKind};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Sync lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Remote synchronization state of a record.
///
/// Legal transitions: `local → syncing → {synced, conflict}` and
/// `conflict → synced` once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Local,
    Syncing,
    Synced,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (SyncStatus::Local, SyncStatus::Syncing)
                | (SyncStatus::Syncing, SyncStatus::Synced)
                | (SyncStatus::Syncing, SyncStatus::Conflict)
                | (SyncStatus::Conflict, SyncStatus::Synced)
        )
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Entity core
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle fields shared by every persisted entity.
///
/// Embedded into concrete entities via `#[serde(flatten)]` so the stored
/// JSON document keeps `uuid`, `createdAt`, `updatedAt`, `syncStatus` and
/// `syncId` as top-level keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCore {
    pub uuid: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<String>,
}

impl EntityCore {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Local,
            sync_id: None,
        }
    }

    pub fn with_uuid(uuid: impl Into<String>) -> Self {
        let mut core = Self::new();
        core.uuid = uuid.into();
        core
    }

    /// Refresh `updated_at`; suppressed by callers for background writes.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move to `next`, enforcing the sync state machine.
    pub fn transition_sync(&mut self, next: SyncStatus) -> Result<()> {
        if !self.sync_status.can_transition_to(next) {
            return Err(StorageError::not_supported(format!(
                "invalid sync transition: {} -> {}",
                self.sync_status, next
            )));
        }
        self.sync_status = next;
        Ok(())
    }

    /// Mark the record as synced under a remote identifier.
    pub fn mark_synced(&mut self, sync_id: impl Into<String>) -> Result<()> {
        self.transition_sync(SyncStatus::Synced)?;
        self.sync_id = Some(sync_id.into());
        Ok(())
    }
}

impl Default for EntityCore {
    fn default() -> Self {
        Self::new()
    }
}

/// A persisted record with a uuid and the standard lifecycle fields.
///
/// `kind()` names the object store the entity lives in; `indexed_fields()`
/// declares the top-level JSON keys the backend should index for
/// exact-match queries (`syncStatus` is always indexed by the adapter).
pub trait Entity:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn kind() -> &'static str;
    fn core(&self) -> &EntityCore;
    fn core_mut(&mut self) -> &mut EntityCore;

    fn indexed_fields() -> &'static [&'static str] {
        &[]
    }

    fn uuid(&self) -> &str {
        &self.core().uuid
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Capability traits
// ═══════════════════════════════════════════════════════════════════════════

/// The entity projects a text for embedding and stores the resulting
/// vector. The vector may be absent, present, or stale relative to the
/// current text; the embedding queue reconciles it asynchronously.
pub trait Embeddable: Entity {
    fn embedding_text(&self) -> String;
    fn embedding(&self) -> Option<&[f32]>;
    fn set_embedding(&mut self, vector: Option<Vec<f32>>);
}

/// Named chunker preset an entity selects for its chunk text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkPreset {
    Parent,
    Child,
}

/// The entity projects a text for semantic chunking, independent of
/// [`Embeddable`].
pub trait Chunkable: Entity {
    fn chunk_text(&self) -> String;
    fn chunk_preset(&self) -> ChunkPreset;
}

/// How often the version store writes a full snapshot instead of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotCadence {
    /// A snapshot every `n` versions (the first write is always one).
    Every(u32),
    /// Only the creation snapshot; every later change is a delta.
    OnCreateOnly,
}

/// The entity records per-save history in the version store.
pub trait Versionable: Entity {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);

    fn snapshot_cadence() -> SnapshotCadence {
        SnapshotCadence::Every(10)
    }

    fn last_modified_by(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Shared,
    Public,
}

/// The entity has an owner, an optional sharee set, and a visibility.
pub trait Ownable: Entity {
    fn owner_id(&self) -> &str;
    fn sharees(&self) -> &BTreeSet<String>;
    fn visibility(&self) -> Visibility;

    /// private ⇒ no sharees; shared ⇒ at least one sharee.
    fn ownership_is_consistent(&self) -> bool {
        match self.visibility() {
            Visibility::Private => self.sharees().is_empty(),
            Visibility::Shared => !self.sharees().is_empty(),
            Visibility::Public => true,
        }
    }
}

/// Scheduling fields for entities that live on a timeline.
pub trait Temporal: Entity {
    fn due_at(&self) -> Option<DateTime<Utc>> {
        None
    }
    fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        None
    }
    fn completed_at(&self) -> Option<DateTime<Utc>> {
        None
    }
    fn recurrence_rule(&self) -> Option<&str> {
        None
    }
}

/// Marker: the entity may participate in the edge graph.
pub trait Edgeable: Entity {}

/// Outcome state of the tool invocation that created an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// Provenance recorded when an entity is created as the side-effect of a
/// tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BirthCertificate {
    pub correlation_id: String,
    pub tool_name: String,
    pub parameters: serde_json::Value,
    pub confidence: f64,
    pub status: InvocationStatus,
}

/// The entity carries a tool-call birth certificate.
pub trait Invocable: Entity {
    fn birth_certificate(&self) -> Option<&BirthCertificate>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_transitions() {
        assert!(SyncStatus::Local.can_transition_to(SyncStatus::Syncing));
        assert!(SyncStatus::Syncing.can_transition_to(SyncStatus::Synced));
        assert!(SyncStatus::Syncing.can_transition_to(SyncStatus::Conflict));
        assert!(SyncStatus::Conflict.can_transition_to(SyncStatus::Synced));

        assert!(!SyncStatus::Local.can_transition_to(SyncStatus::Synced));
        assert!(!SyncStatus::Synced.can_transition_to(SyncStatus::Local));
        assert!(!SyncStatus::Conflict.can_transition_to(SyncStatus::Syncing));
    }

    #[test]
    fn test_entity_core_new() {
        let core = EntityCore::new();
        assert!(!core.uuid.is_empty());
        assert_eq!(core.sync_status, SyncStatus::Local);
        assert_eq!(core.sync_id, None);
        assert!(core.created_at <= core.updated_at);
    }

    #[test]
    fn test_entity_core_touch() {
        let mut core = EntityCore::new();
        let before = core.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        core.touch();
        assert!(core.updated_at > before);
        assert!(core.created_at <= core.updated_at);
    }

    #[test]
    fn test_entity_core_mark_synced() {
        let mut core = EntityCore::new();
        core.transition_sync(SyncStatus::Syncing).unwrap();
        core.mark_synced("remote-42").unwrap();
        assert_eq!(core.sync_status, SyncStatus::Synced);
        assert_eq!(core.sync_id.as_deref(), Some("remote-42"));
    }

    #[test]
    fn test_entity_core_invalid_transition() {
        let mut core = EntityCore::new();
        let err = core.transition_sync(SyncStatus::Synced).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotSupported);
        assert_eq!(core.sync_status, SyncStatus::Local);
    }

    #[test]
    fn test_entity_core_serde_camel_case() {
        let core = EntityCore::new();
        let json = serde_json::to_value(&core).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
        assert_eq!(json["syncStatus"], "local");
        // Absent syncId is omitted entirely.
        assert!(json.get("syncId").is_none());
    }

    #[derive(Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct SharedTask {
        #[serde(flatten)]
        core: EntityCore,
        owner_id: String,
        sharees: BTreeSet<String>,
        visibility: Visibility,
        due_at: Option<DateTime<Utc>>,
        birth: Option<BirthCertificate>,
    }

    impl Entity for SharedTask {
        fn kind() -> &'static str {
            "shared_tasks"
        }
        fn core(&self) -> &EntityCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut EntityCore {
            &mut self.core
        }
    }

    impl Ownable for SharedTask {
        fn owner_id(&self) -> &str {
            &self.owner_id
        }
        fn sharees(&self) -> &BTreeSet<String> {
            &self.sharees
        }
        fn visibility(&self) -> Visibility {
            self.visibility
        }
    }

    impl Temporal for SharedTask {
        fn due_at(&self) -> Option<DateTime<Utc>> {
            self.due_at
        }
    }

    impl Invocable for SharedTask {
        fn birth_certificate(&self) -> Option<&BirthCertificate> {
            self.birth.as_ref()
        }
    }

    fn shared_task(visibility: Visibility, sharees: &[&str]) -> SharedTask {
        SharedTask {
            core: EntityCore::new(),
            owner_id: "user-1".to_string(),
            sharees: sharees.iter().map(|s| s.to_string()).collect(),
            visibility,
            due_at: None,
            birth: None,
        }
    }

    #[test]
    fn test_ownership_consistency_predicate() {
        assert!(shared_task(Visibility::Private, &[]).ownership_is_consistent());
        assert!(!shared_task(Visibility::Private, &["user-2"]).ownership_is_consistent());
        assert!(shared_task(Visibility::Shared, &["user-2"]).ownership_is_consistent());
        assert!(!shared_task(Visibility::Shared, &[]).ownership_is_consistent());
        assert!(shared_task(Visibility::Public, &[]).ownership_is_consistent());
        assert!(shared_task(Visibility::Public, &["user-2"]).ownership_is_consistent());
    }

    #[test]
    fn test_temporal_defaults() {
        let task = shared_task(Visibility::Private, &[]);
        assert!(task.due_at().is_none());
        assert!(task.scheduled_at().is_none());
        assert!(task.completed_at().is_none());
        assert!(task.recurrence_rule().is_none());
    }

    #[test]
    fn test_birth_certificate_roundtrip() {
        let mut task = shared_task(Visibility::Private, &[]);
        task.birth = Some(BirthCertificate {
            correlation_id: "corr-7".to_string(),
            tool_name: "create_task".to_string(),
            parameters: serde_json::json!({"title": "buy milk"}),
            confidence: 0.92,
            status: InvocationStatus::Confirmed,
        });

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["birth"]["correlationId"], "corr-7");
        assert_eq!(json["birth"]["status"], "confirmed");

        let back: SharedTask = serde_json::from_value(json).unwrap();
        let birth = back.birth_certificate().unwrap();
        assert_eq!(birth.tool_name, "create_task");
        assert_eq!(birth.status, InvocationStatus::Confirmed);
    }
}
