//! Version history through the repository: per-save deltas, snapshot
//! cadence, point-in-time reconstruction and pruning.

mod common;

use std::sync::Arc;

use everstore_engine::{EntityRepository, RepositoryConfig};
use everstore_storage::{
    Entity, EntityStore, IndexedBackend, KvBackend, KvEntityStore, KvVersionStore, SnapshotCadence,
    SqliteBackend, VersionKind,
};

use common::{versioned_projection, Note};

async fn repo_with_cadence(
    backend: Arc<dyn KvBackend>,
    cadence: SnapshotCadence,
) -> (
    EntityRepository<Note, KvEntityStore<Note>>,
    Arc<KvVersionStore>,
) {
    let store = Arc::new(KvEntityStore::<Note>::open(backend.clone()).await.unwrap());
    let versions = Arc::new(KvVersionStore::open(backend).await.unwrap());
    let config = RepositoryConfig {
        snapshot_cadence: Some(cadence),
        ..RepositoryConfig::default()
    };
    let repo = EntityRepository::new(store, config)
        .unwrap()
        .with_versioning(versions.clone());
    (repo, versions)
}

#[tokio::test]
async fn test_alternating_field_updates_record_minimal_deltas() {
    common::init_tracing();
    let (repo, versions) =
        repo_with_cadence(Arc::new(IndexedBackend::new()), SnapshotCadence::Every(10)).await;

    // Save, then four updates alternating title and body.
    let mut note = repo.save(Note::new("A", "x")).await.unwrap();
    let mut persisted = vec![note.clone()];
    let steps: [(&str, &str); 4] = [("title", "B"), ("body", "y"), ("title", "C"), ("body", "z")];
    for (field, value) in steps {
        // Distinct updatedAt per save keeps the timeline unambiguous.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        match field {
            "title" => note.title = value.to_string(),
            _ => note.body = value.to_string(),
        }
        note = repo.save(note).await.unwrap();
        persisted.push(note.clone());
    }

    // Version counts up with each save.
    for (i, state) in persisted.iter().enumerate() {
        assert_eq!(state.version, (i + 1) as u64);
    }

    let history = versions.get_history(note.uuid()).await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].kind, VersionKind::Snapshot);
    for record in &history[1..] {
        assert_eq!(record.kind, VersionKind::Delta);
    }

    // Each delta names exactly the field that changed.
    let expected_fields = ["title", "body", "title", "body"];
    for (record, field) in history[1..].iter().zip(expected_fields) {
        assert_eq!(record.changed_fields.as_deref(), Some(&[field.to_string()][..]));
    }

    // Reconstruction at the third update's updatedAt equals what was
    // persisted there.
    let third = &persisted[3];
    let reconstructed = versions
        .reconstruct(note.uuid(), third.core.updated_at)
        .await
        .unwrap();
    assert_eq!(reconstructed, versioned_projection(third));
}

#[tokio::test]
async fn test_snapshot_cadence_and_prune() {
    let (repo, versions) =
        repo_with_cadence(Arc::new(IndexedBackend::new()), SnapshotCadence::Every(3)).await;

    let mut note = repo.save(Note::new("v0", "body")).await.unwrap();
    let mut persisted = vec![note.clone()];
    for i in 1..7 {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        note.title = format!("v{}", i);
        note = repo.save(note).await.unwrap();
        persisted.push(note.clone());
    }

    let history = versions.get_history(note.uuid()).await.unwrap();
    assert_eq!(history.len(), 7);
    let snapshots: Vec<u64> = history
        .iter()
        .filter(|v| v.kind == VersionKind::Snapshot)
        .map(|v| v.version_number)
        .collect();
    let deltas: Vec<u64> = history
        .iter()
        .filter(|v| v.kind == VersionKind::Delta)
        .map(|v| v.version_number)
        .collect();
    assert_eq!(snapshots, vec![1, 4, 7]);
    assert_eq!(deltas, vec![2, 3, 5, 6]);

    // Every persisted state reconstructs at its own updatedAt.
    for state in &persisted {
        let reconstructed = versions
            .reconstruct(note.uuid(), state.core.updated_at)
            .await
            .unwrap();
        assert_eq!(reconstructed, versioned_projection(state));
    }

    versions.prune(note.uuid(), 1).await.unwrap();
    let remaining = versions.get_history(note.uuid()).await.unwrap();
    let numbers: Vec<u64> = remaining.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![7]);

    // The latest state is still reconstructible; anything earlier fails.
    let last = persisted.last().unwrap();
    assert_eq!(
        versions
            .reconstruct(note.uuid(), last.core.updated_at)
            .await
            .unwrap(),
        versioned_projection(last)
    );
    let err = versions
        .reconstruct(note.uuid(), persisted[4].core.updated_at)
        .await
        .unwrap_err();
    assert_eq!(err.kind, everstore_storage::ErrorKind::NotAvailable);
}

#[tokio::test]
async fn test_unchanged_save_bumps_nothing() {
    let (repo, versions) =
        repo_with_cadence(Arc::new(IndexedBackend::new()), SnapshotCadence::Every(10)).await;

    let note = repo.save(Note::new("A", "x")).await.unwrap();
    assert_eq!(note.version, 1);

    // Re-saving without changes touches updatedAt but records no version.
    let again = repo.save(note.clone()).await.unwrap();
    assert_eq!(again.version, 1);
    assert_eq!(versions.get_history(note.uuid()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_version_flow_on_sqlite_backend() {
    let (repo, versions) = repo_with_cadence(
        Arc::new(SqliteBackend::in_memory().unwrap()),
        SnapshotCadence::Every(3),
    )
    .await;

    let mut note = repo.save(Note::new("first", "body")).await.unwrap();
    note.title = "second".to_string();
    let note = repo.save(note).await.unwrap();

    assert_eq!(note.version, 2);
    let history = versions.get_history(note.uuid()).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].kind, VersionKind::Delta);

    // The persisted document carries the bumped version.
    let reloaded = repo.store().get_by_uuid(note.uuid()).await.unwrap();
    assert_eq!(reloaded.version, 2);
}
