//! Directed, typed edges between entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SyncStatus;

/// Which adjacency a traversal explores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Outgoing,
    Incoming,
    Both,
}

/// A directed, typed association between two entities.
///
/// Edges are first-class records, not owned by either endpoint: deleting an
/// endpoint entity does not cascade. The identity of an edge is the tuple
/// `(sourceType, sourceUuid, targetType, targetUuid, edgeType)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source_type: String,
    pub source_uuid: String,
    pub target_type: String,
    pub target_uuid: String,
    pub edge_type: String,
    pub created_at: DateTime<Utc>,
    /// User id, or `"system"` for engine-created edges.
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<String>,
}

impl Edge {
    pub fn new(
        source_type: impl Into<String>,
        source_uuid: impl Into<String>,
        target_type: impl Into<String>,
        target_uuid: impl Into<String>,
        edge_type: impl Into<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            source_uuid: source_uuid.into(),
            target_type: target_type.into(),
            target_uuid: target_uuid.into(),
            edge_type: edge_type.into(),
            created_at: Utc::now(),
            created_by: "system".to_string(),
            metadata: None,
            sync_status: SyncStatus::Local,
            sync_id: None,
        }
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Deterministic store key over the identity tuple.
    pub fn composite_key(&self) -> String {
        Self::key_of(
            &self.source_type,
            &self.source_uuid,
            &self.target_type,
            &self.target_uuid,
            &self.edge_type,
        )
    }

    pub fn key_of(
        source_type: &str,
        source_uuid: &str,
        target_type: &str,
        target_uuid: &str,
        edge_type: &str,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            source_type, source_uuid, target_type, target_uuid, edge_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_new_defaults() {
        let edge = Edge::new("note", "a", "note", "b", "references");
        assert_eq!(edge.created_by, "system");
        assert_eq!(edge.sync_status, SyncStatus::Local);
        assert_eq!(edge.metadata, None);
    }

    #[test]
    fn test_composite_key_is_identity() {
        let a = Edge::new("note", "a", "task", "b", "references");
        let b = Edge::new("note", "a", "task", "b", "references");
        let c = Edge::new("note", "a", "task", "b", "blocks");
        assert_eq!(a.composite_key(), b.composite_key());
        assert_ne!(a.composite_key(), c.composite_key());
    }

    #[test]
    fn test_edge_serde_camel_case() {
        let edge = Edge::new("note", "a", "note", "b", "references");
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["sourceUuid"], "a");
        assert_eq!(json["targetUuid"], "b");
        assert_eq!(json["edgeType"], "references");
        assert_eq!(json["syncStatus"], "local");
    }
}
