//! JSON document metadata store
//!
//! All events live in one JSON file. The store keeps the parsed document in
//! memory behind a mutex; every mutation builds the next document, writes it
//! to a temp file, renames it over the old one, and only then publishes it in
//! memory. A failed write therefore leaves both disk and memory unchanged.

use super::{CasResult, EventRecord, MetadataError, MetadataStore, UpdateOutcome, Versioned};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

type Events = BTreeMap<String, Versioned<EventRecord>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    events: Events,
}

/// File-backed [`MetadataStore`]
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    events: Mutex<Events>,
    max_update_attempts: u32,
}

impl JsonFileStore {
    /// Open the document at `path`, starting empty if it does not exist yet.
    pub async fn open(
        path: impl Into<PathBuf>,
        max_update_attempts: u32,
    ) -> Result<Self, MetadataError> {
        let path = path.into();
        let events = match fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Events::new(),
            Ok(bytes) => serde_json::from_slice::<Document>(&bytes)?.events,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent).await?;
                    }
                }
                Events::new()
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            path = %path.display(),
            events = events.len(),
            "Opened metadata document"
        );

        Ok(Self {
            path,
            events: Mutex::new(events),
            max_update_attempts: max_update_attempts.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, events: &Events) -> Result<(), MetadataError> {
        let document = serde_json::to_vec_pretty(&DocumentRef { events })?;
        let staging = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));

        let result = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(&document).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&staging, &self.path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&staging).await;
            tracing::error!(path = %self.path.display(), error = %e, "Failed to persist metadata");
            return Err(e.into());
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    events: &'a Events,
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn list(&self) -> Result<Vec<EventRecord>, MetadataError> {
        let events = self.events.lock().await;
        Ok(events.values().map(|v| v.record.clone()).collect())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Versioned<EventRecord>>, MetadataError> {
        Ok(self.events.lock().await.get(event_id).cloned())
    }

    async fn insert(&self, record: EventRecord) -> Result<(), MetadataError> {
        let mut events = self.events.lock().await;
        if events.contains_key(&record.id) {
            return Err(MetadataError::AlreadyExists(record.id));
        }
        let mut next = events.clone();
        next.insert(record.id.clone(), Versioned { version: 1, record });
        self.persist(&next).await?;
        *events = next;
        Ok(())
    }

    #[tracing::instrument(name = "metadata.json.cas", skip(self, record), err)]
    async fn compare_and_swap(
        &self,
        event_id: &str,
        expected_version: u64,
        record: EventRecord,
    ) -> Result<CasResult, MetadataError> {
        let mut events = self.events.lock().await;
        let current_version = match events.get(event_id) {
            None => return Ok(CasResult::Absent),
            Some(current) => current.version,
        };
        if current_version != expected_version {
            return Ok(CasResult::Conflict { current_version });
        }

        let new_version = current_version + 1;
        let mut next = events.clone();
        next.insert(
            event_id.to_string(),
            Versioned {
                version: new_version,
                record,
            },
        );
        self.persist(&next).await?;
        *events = next;
        Ok(CasResult::Ok { new_version })
    }

    fn max_update_attempts(&self) -> u32 {
        self.max_update_attempts
    }

    /// Read, apply `update`, persist and publish under one lock acquisition.
    /// Writers queue on the lock instead of racing, so this never conflicts
    /// and `update` runs exactly once.
    #[tracing::instrument(name = "metadata.json.update", skip(self, update), err)]
    async fn atomic_update(
        &self,
        event_id: &str,
        update: &(dyn Fn(EventRecord) -> EventRecord + Send + Sync),
    ) -> Result<UpdateOutcome, MetadataError> {
        let mut events = self.events.lock().await;
        let Some(current) = events.get(event_id) else {
            return Ok(UpdateOutcome::Absent);
        };

        let updated = update(current.record.clone());
        let new_version = current.version + 1;
        let mut next = events.clone();
        next.insert(
            event_id.to_string(),
            Versioned {
                version: new_version,
                record: updated.clone(),
            },
        );
        self.persist(&next).await?;
        *events = next;
        Ok(UpdateOutcome::Updated(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("nested/events.json"), 8)
            .await
            .unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("events.json"), 8)
            .await
            .unwrap();
        store
            .insert(EventRecord::new("e1", "Wedding", None))
            .await
            .unwrap();
        let result = store.insert(EventRecord::new("e1", "Other", None)).await;
        assert!(matches!(result, Err(MetadataError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_cas_checks_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("events.json"), 8)
            .await
            .unwrap();
        store
            .insert(EventRecord::new("e1", "Wedding", None))
            .await
            .unwrap();

        let current = store.get("e1").await.unwrap().unwrap();
        assert_eq!(current.version, 1);

        let mut renamed = current.record.clone();
        renamed.name = "Reception".into();
        assert_eq!(
            store.compare_and_swap("e1", 1, renamed.clone()).await.unwrap(),
            CasResult::Ok { new_version: 2 }
        );
        assert_eq!(
            store.compare_and_swap("e1", 1, renamed).await.unwrap(),
            CasResult::Conflict { current_version: 2 }
        );
        assert_eq!(
            store
                .compare_and_swap("missing", 1, EventRecord::new("missing", "x", None))
                .await
                .unwrap(),
            CasResult::Absent
        );
    }

    #[tokio::test]
    async fn test_atomic_update_applies_once_under_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("events.json"), 1)
            .await
            .unwrap();
        store
            .insert(EventRecord::new("e1", "Wedding", None))
            .await
            .unwrap();

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let outcome = store
            .atomic_update("e1", &|mut e: EventRecord| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                e.name = "Reception".into();
                e
            })
            .await
            .unwrap();

        assert!(matches!(outcome, UpdateOutcome::Updated(ref e) if e.name == "Reception"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(store.get("e1").await.unwrap().unwrap().version, 2);
        assert!(matches!(
            store.atomic_update("missing", &|e: EventRecord| e).await.unwrap(),
            UpdateOutcome::Absent
        ));
    }
}
