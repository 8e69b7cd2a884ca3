//! JSON document metadata store tests

mod common;

use common::{event, jpeg, FlakyBlobStore};
use galleria::config::UploadConfig;
use galleria::metadata::json_file::JsonFileStore;
use galleria::metadata::{EventRecord, MetadataStore, UpdateOutcome};
use galleria::upload::{UploadRequest, UploadTransaction};
use galleria::GalleryError;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_reopen_sees_committed_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.json");

    {
        let store = JsonFileStore::open(&path, 8).await.unwrap();
        store.insert(event("e1", "Wedding")).await.unwrap();
        store
            .atomic_update("e1", &|mut e: EventRecord| {
                e.description = Some("June".into());
                e
            })
            .await
            .unwrap();
    }

    let reopened = JsonFileStore::open(&path, 8).await.unwrap();
    let stored = reopened.get("e1").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.record.name, "Wedding");
    assert_eq!(stored.record.description.as_deref(), Some("June"));

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["events"]["e1"]["version"], 2);
    assert_eq!(raw["events"]["e1"]["record"]["name"], "Wedding");
}

#[tokio::test]
async fn test_failed_write_leaves_state_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("meta");
    let store = JsonFileStore::open(folder.join("events.json"), 8)
        .await
        .unwrap();
    store.insert(event("e1", "Wedding")).await.unwrap();

    std::fs::remove_dir_all(&folder).unwrap();

    let mut renamed = event("e1", "Renamed");
    renamed.created_at = store.get("e1").await.unwrap().unwrap().record.created_at;
    assert!(store.compare_and_swap("e1", 1, renamed).await.is_err());
    assert!(store.insert(event("e2", "Party")).await.is_err());

    let current = store.get("e1").await.unwrap().unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.record.name, "Wedding");
    assert!(store.get("e2").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        JsonFileStore::open(dir.path().join("events.json"), 2)
            .await
            .unwrap(),
    );
    store.insert(event("e1", "Wedding")).await.unwrap();

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .atomic_update("e1", &move |mut e: EventRecord| {
                        let line = format!("note {i}");
                        e.description = Some(match e.description {
                            Some(d) => format!("{d}\n{line}"),
                            None => line,
                        });
                        e
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    for writer in writers {
        assert!(matches!(writer.await.unwrap(), UpdateOutcome::Updated(_)));
    }

    let stored = store.get("e1").await.unwrap().unwrap();
    assert_eq!(stored.version, 9);
    assert_eq!(stored.record.description.unwrap().lines().count(), 8);
}

#[tokio::test]
async fn test_upload_rolls_back_when_document_cannot_be_written() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("meta");
    let metadata = Arc::new(
        JsonFileStore::open(folder.join("events.json"), 8)
            .await
            .unwrap(),
    );
    metadata.insert(event("e1", "Wedding")).await.unwrap();
    std::fs::remove_dir_all(&folder).unwrap();

    let blobs = Arc::new(FlakyBlobStore::new());
    let tx = UploadTransaction::new(
        blobs.clone(),
        metadata.clone(),
        &UploadConfig::default(),
        Duration::from_secs(5),
    );

    let err = tx
        .execute(UploadRequest {
            event_id: "e1".into(),
            guest_name: "Ana".into(),
            message: None,
            files: vec![jpeg("a.jpg", b"a"), jpeg("b.jpg", b"b")],
        })
        .await
        .unwrap_err();

    assert!(matches!(err, GalleryError::Persistence(_)), "got {err:?}");
    assert_eq!(blobs.put_count(), 2);
    assert!(blobs.inner.is_empty());
    assert!(metadata
        .get("e1")
        .await
        .unwrap()
        .unwrap()
        .record
        .uploads
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contended_uploads_all_commit() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(
        JsonFileStore::open(dir.path().join("events.json"), 8)
            .await
            .unwrap(),
    );
    metadata.insert(event("e1", "Wedding")).await.unwrap();
    let blobs = Arc::new(FlakyBlobStore::new());
    let tx = Arc::new(UploadTransaction::new(
        blobs.clone(),
        metadata.clone(),
        &UploadConfig::default(),
        Duration::from_secs(30),
    ));

    let guests: Vec<_> = (0..24)
        .map(|i| {
            let tx = tx.clone();
            tokio::spawn(async move {
                tx.execute(UploadRequest {
                    event_id: "e1".into(),
                    guest_name: format!("Guest {i}"),
                    message: None,
                    files: vec![jpeg(&format!("{i}.jpg"), b"jpeg")],
                })
                .await
            })
        })
        .collect();

    for guest in guests {
        assert_eq!(guest.await.unwrap().unwrap().len(), 1);
    }

    let stored = metadata.get("e1").await.unwrap().unwrap();
    assert_eq!(stored.record.uploads.len(), 24);
    assert_eq!(stored.version, 25);
    assert_eq!(blobs.inner.len(), 24);
}
