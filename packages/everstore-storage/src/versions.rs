//! Append-only per-entity change history (snapshots + deltas).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::backend::KvBackend;
use crate::diff::{apply, changed_fields, diff, PatchOp};
use crate::domain::{EntityVersion, SnapshotCadence};
use crate::error::{Result, StorageError};

const STORE: &str = "versions";

/// Version store over a key/value backend.
///
/// History per entity is a contiguous run of version records starting at a
/// snapshot. A snapshot is written on the first save and then once per
/// cadence period; everything in between is an RFC-6902 delta against the
/// previous state. History is append-only between prunes.
pub struct KvVersionStore {
    backend: Arc<dyn KvBackend>,
}

impl KvVersionStore {
    pub async fn open(backend: Arc<dyn KvBackend>) -> Result<Self> {
        backend.declare_store(STORE, &["entityUuid"]).await?;
        Ok(Self { backend })
    }

    fn key(entity_uuid: &str, version_number: u64) -> String {
        // Zero-padded so key order equals version order.
        format!("{}:{:010}", entity_uuid, version_number)
    }

    fn from_doc(doc: Value) -> Result<EntityVersion> {
        serde_json::from_value(doc)
            .map_err(|e| StorageError::corrupt(format!("stored version failed to decode: {}", e)))
    }

    /// All versions of an entity, ascending by version number.
    pub async fn get_history(&self, entity_uuid: &str) -> Result<Vec<EntityVersion>> {
        let mut history: Vec<EntityVersion> = self
            .backend
            .find_by_field(STORE, "entityUuid", &Value::String(entity_uuid.to_string()))
            .await?
            .into_iter()
            .map(Self::from_doc)
            .collect::<Result<_>>()?;
        history.sort_by_key(|v| v.version_number);
        Ok(history)
    }

    /// Materialize the state at `history[upto]` by replaying deltas from
    /// the nearest preceding snapshot.
    fn materialize(history: &[EntityVersion], upto: usize) -> Result<Value> {
        let snapshot_idx = match history[..=upto].iter().rposition(|v| v.is_snapshot()) {
            Some(idx) => idx,
            None => {
                // Either the history head was pruned away, or a delta was
                // written without its snapshot.
                return if history.first().map(|v| v.version_number).unwrap_or(1) > 1 {
                    Err(StorageError::not_available(
                        "requested state precedes the earliest retained snapshot",
                    ))
                } else {
                    Err(StorageError::corrupt("delta without a preceding snapshot"))
                };
            }
        };

        let mut state = history[snapshot_idx].payload.clone();
        for version in &history[snapshot_idx + 1..=upto] {
            let patch: Vec<PatchOp> = serde_json::from_value(version.payload.clone())
                .map_err(|e| {
                    StorageError::corrupt(format!(
                        "malformed patch at version {}: {}",
                        version.version_number, e
                    ))
                })?;
            state = apply(&state, &patch)?;
        }
        Ok(state)
    }

    /// Record a save of `current` stamped `at`, returning the new version
    /// number, or `None` when nothing changed.
    ///
    /// `at` is the save's `updatedAt`, so reconstruction at any persisted
    /// `updatedAt` lands exactly on the state that save produced.
    pub async fn record_change(
        &self,
        entity_uuid: &str,
        current: &Value,
        cadence: SnapshotCadence,
        at: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        let history = self.get_history(entity_uuid).await?;

        if history.is_empty() {
            let mut record = EntityVersion::snapshot(entity_uuid, 1, current.clone());
            record.timestamp = at;
            self.backend
                .put(STORE, &Self::key(entity_uuid, 1), &serde_json::to_value(&record)?)
                .await?;
            return Ok(Some(1));
        }

        let latest = history.last().expect("non-empty history");
        let previous = Self::materialize(&history, history.len() - 1)?;
        let patch = diff(&previous, current);
        if patch.is_empty() {
            return Ok(None);
        }

        let next = latest.version_number + 1;
        let write_snapshot = match cadence {
            // First write is version 1, so snapshots land every `s`
            // versions after it: 1, 1+s, 1+2s, ...
            SnapshotCadence::Every(s) => (next - 1) % (s.max(1) as u64) == 0,
            SnapshotCadence::OnCreateOnly => false,
        };

        let mut record = if write_snapshot {
            EntityVersion::snapshot(entity_uuid, next, current.clone())
        } else {
            EntityVersion::delta(
                entity_uuid,
                next,
                serde_json::to_value(&patch)?,
                changed_fields(&previous, current),
            )
        };
        record.timestamp = at;
        self.backend
            .put(
                STORE,
                &Self::key(entity_uuid, next),
                &serde_json::to_value(&record)?,
            )
            .await?;
        Ok(Some(next))
    }

    /// Rebuild the entity state as of `at`.
    ///
    /// Walks the history newest → oldest to the latest version stamped at
    /// or before `at`, then replays from the nearest preceding snapshot.
    /// The result is the serialized JSON object, not a typed entity.
    pub async fn reconstruct(&self, entity_uuid: &str, at: DateTime<Utc>) -> Result<Value> {
        let history = self.get_history(entity_uuid).await?;
        if history.is_empty() {
            return Err(StorageError::not_available(format!(
                "no history recorded for {}",
                entity_uuid
            )));
        }
        let cover = history
            .iter()
            .rposition(|v| v.timestamp <= at)
            .ok_or_else(|| {
                StorageError::not_available("requested timestamp precedes recorded history")
            })?;
        Self::materialize(&history, cover)
    }

    /// Drop old history, keeping the most recent `keep_snapshots` snapshots
    /// and every record from the earliest retained snapshot on.
    /// `keep_snapshots = 0` deletes the entity's entire history.
    pub async fn prune(&self, entity_uuid: &str, keep_snapshots: usize) -> Result<()> {
        let history = self.get_history(entity_uuid).await?;
        if history.is_empty() {
            return Ok(());
        }

        let doomed: Vec<String> = if keep_snapshots == 0 {
            history
                .iter()
                .map(|v| Self::key(entity_uuid, v.version_number))
                .collect()
        } else {
            let snapshots: Vec<usize> = history
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_snapshot())
                .map(|(i, _)| i)
                .collect();
            if snapshots.len() <= keep_snapshots {
                return Ok(());
            }
            let earliest_kept = snapshots[snapshots.len() - keep_snapshots];
            let floor = history[earliest_kept].version_number;
            history
                .iter()
                .filter(|v| v.version_number < floor)
                .map(|v| Self::key(entity_uuid, v.version_number))
                .collect()
        };

        self.backend.delete_many(STORE, &doomed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VersionKind;
    use crate::infrastructure::IndexedBackend;
    use serde_json::json;

    async fn store() -> KvVersionStore {
        KvVersionStore::open(Arc::new(IndexedBackend::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_write_is_snapshot_v1() {
        let versions = store().await;
        let n = versions
            .record_change("e1", &json!({"title": "A"}), SnapshotCadence::Every(3), Utc::now())
            .await
            .unwrap();
        assert_eq!(n, Some(1));

        let history = versions.get_history("e1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, VersionKind::Snapshot);
        assert_eq!(history[0].payload, json!({"title": "A"}));
    }

    #[tokio::test]
    async fn test_unchanged_save_writes_nothing() {
        let versions = store().await;
        let state = json!({"title": "A"});
        versions
            .record_change("e1", &state, SnapshotCadence::Every(3), Utc::now())
            .await
            .unwrap();
        let n = versions
            .record_change("e1", &state, SnapshotCadence::Every(3), Utc::now())
            .await
            .unwrap();
        assert_eq!(n, None);
        assert_eq!(versions.get_history("e1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deltas_carry_changed_fields() {
        let versions = store().await;
        versions
            .record_change("e1", &json!({"title": "A", "body": "x"}), SnapshotCadence::Every(10), Utc::now())
            .await
            .unwrap();
        versions
            .record_change("e1", &json!({"title": "B", "body": "x"}), SnapshotCadence::Every(10), Utc::now())
            .await
            .unwrap();

        let history = versions.get_history("e1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].kind, VersionKind::Delta);
        assert_eq!(
            history[1].changed_fields,
            Some(vec!["title".to_string()])
        );
    }

    #[tokio::test]
    async fn test_snapshot_cadence_every_three() {
        let versions = store().await;
        for i in 0..7 {
            versions
                .record_change("e1", &json!({"counter": i}), SnapshotCadence::Every(3), Utc::now())
                .await
                .unwrap();
        }

        let history = versions.get_history("e1").await.unwrap();
        assert_eq!(history.len(), 7);
        let snapshot_versions: Vec<u64> = history
            .iter()
            .filter(|v| v.is_snapshot())
            .map(|v| v.version_number)
            .collect();
        let delta_versions: Vec<u64> = history
            .iter()
            .filter(|v| !v.is_snapshot())
            .map(|v| v.version_number)
            .collect();
        assert_eq!(snapshot_versions, vec![1, 4, 7]);
        assert_eq!(delta_versions, vec![2, 3, 5, 6]);
    }

    #[tokio::test]
    async fn test_snapshot_only_on_create() {
        let versions = store().await;
        for i in 0..5 {
            versions
                .record_change("e1", &json!({"counter": i}), SnapshotCadence::OnCreateOnly, Utc::now())
                .await
                .unwrap();
        }
        let history = versions.get_history("e1").await.unwrap();
        assert!(history[0].is_snapshot());
        assert!(history[1..].iter().all(|v| !v.is_snapshot()));
    }

    #[tokio::test]
    async fn test_reconstruct_each_recorded_state() {
        let versions = store().await;
        let states = [
            json!({"title": "A", "body": "x"}),
            json!({"title": "B", "body": "x"}),
            json!({"title": "B", "body": "y"}),
            json!({"title": "C", "body": "y"}),
            json!({"title": "C", "body": "z"}),
        ];
        for state in &states {
            versions
                .record_change("e1", state, SnapshotCadence::Every(3), Utc::now())
                .await
                .unwrap();
        }

        let history = versions.get_history("e1").await.unwrap();
        assert_eq!(history.len(), 5);
        for (i, state) in states.iter().enumerate() {
            let at = history[i].timestamp;
            assert_eq!(versions.reconstruct("e1", at).await.unwrap(), *state);
        }
    }

    #[tokio::test]
    async fn test_reconstruct_before_history_is_not_available() {
        let versions = store().await;
        versions
            .record_change("e1", &json!({"title": "A"}), SnapshotCadence::Every(3), Utc::now())
            .await
            .unwrap();
        let history = versions.get_history("e1").await.unwrap();
        let before = history[0].timestamp - chrono::Duration::seconds(10);

        let err = versions.reconstruct("e1", before).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotAvailable);
    }

    #[tokio::test]
    async fn test_prune_keep_one_snapshot() {
        let versions = store().await;
        for i in 0..7 {
            versions
                .record_change("e1", &json!({"counter": i}), SnapshotCadence::Every(3), Utc::now())
                .await
                .unwrap();
        }
        let full = versions.get_history("e1").await.unwrap();
        let last_snapshot_at = full[6].timestamp;

        versions.prune("e1", 1).await.unwrap();

        let history = versions.get_history("e1").await.unwrap();
        let numbers: Vec<u64> = history.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![7]);

        // States at or after the retained snapshot stay reconstructible.
        assert_eq!(
            versions.reconstruct("e1", last_snapshot_at).await.unwrap(),
            json!({"counter": 6})
        );

        // Anything earlier is gone.
        let earlier = full[4].timestamp;
        let err = versions.reconstruct("e1", earlier).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotAvailable);
    }

    #[tokio::test]
    async fn test_prune_zero_deletes_everything() {
        let versions = store().await;
        versions
            .record_change("e1", &json!({"title": "A"}), SnapshotCadence::Every(3), Utc::now())
            .await
            .unwrap();
        versions.prune("e1", 0).await.unwrap();
        assert!(versions.get_history("e1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_histories_are_isolated_per_entity() {
        let versions = store().await;
        versions
            .record_change("e1", &json!({"n": 1}), SnapshotCadence::Every(3), Utc::now())
            .await
            .unwrap();
        versions
            .record_change("e2", &json!({"n": 2}), SnapshotCadence::Every(3), Utc::now())
            .await
            .unwrap();

        assert_eq!(versions.get_history("e1").await.unwrap().len(), 1);
        assert_eq!(versions.get_history("e2").await.unwrap().len(), 1);
    }
}
