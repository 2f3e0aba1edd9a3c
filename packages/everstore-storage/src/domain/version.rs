//! Per-entity change history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a version record carries a full state or a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionKind {
    Snapshot,
    Delta,
}

/// One record in an entity's mutation history.
///
/// Version numbers are contiguous and monotonic per entity, starting at 1.
/// The first record is always a snapshot; a delta is only valid with a
/// preceding snapshot in the same history. For deltas, `changed_fields`
/// holds exactly the top-level keys the patch touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVersion {
    pub entity_uuid: String,
    pub version_number: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: VersionKind,
    /// Full serialized entity state for snapshots; an RFC-6902 patch array
    /// for deltas.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<Vec<String>>,
}

impl EntityVersion {
    pub fn snapshot(
        entity_uuid: impl Into<String>,
        version_number: u64,
        state: serde_json::Value,
    ) -> Self {
        Self {
            entity_uuid: entity_uuid.into(),
            version_number,
            timestamp: Utc::now(),
            kind: VersionKind::Snapshot,
            payload: state,
            changed_fields: None,
        }
    }

    pub fn delta(
        entity_uuid: impl Into<String>,
        version_number: u64,
        patch: serde_json::Value,
        changed_fields: Vec<String>,
    ) -> Self {
        Self {
            entity_uuid: entity_uuid.into(),
            version_number,
            timestamp: Utc::now(),
            kind: VersionKind::Delta,
            payload: patch,
            changed_fields: Some(changed_fields),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.kind == VersionKind::Snapshot
    }
}
