//! Event metadata
//!
//! Durable mapping of event id to [`EventRecord`]. Records carry a version
//! token and the only mutation primitive besides insert is a versioned
//! compare-and-swap, on top of which [`MetadataStore::atomic_update`] provides
//! read-modify-write without lost updates.
//!
//! # Backends
//!
//! - [`json_file::JsonFileStore`] - one JSON document on disk, atomically replaced
//! - [`memory::MemoryMetadataStore`] - process-local, for development and tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod json_file;
pub mod memory;

/// Metadata store errors
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Event already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// One stored file contributed by a guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: String,
    pub guest_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub storage_key: String,
    pub url: String,
    pub media_type: String,
    pub size: u64,
    /// As supplied by the client, including any path
    pub original_filename: String,
    pub created_at: DateTime<Utc>,
}

/// A named gallery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Insertion order, oldest first
    #[serde(default)]
    pub uploads: Vec<UploadRecord>,
}

impl EventRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description,
            created_at: Utc::now(),
            uploads: Vec::new(),
        }
    }

    /// Uploads ordered newest first, for display
    pub fn uploads_newest_first(&self) -> Vec<UploadRecord> {
        let mut uploads = self.uploads.clone();
        // stable sort keeps reverse insertion order for equal timestamps
        uploads.reverse();
        uploads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        uploads
    }
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

/// Result of a compare-and-swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The swap succeeded; the record is now at `new_version`
    Ok { new_version: u64 },
    /// The stored version no longer matches the expected one
    Conflict { current_version: u64 },
    /// The record does not exist
    Absent,
}

/// Outcome of [`MetadataStore::atomic_update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(EventRecord),
    /// Every attempt lost the race against a concurrent writer
    Conflict,
    Absent,
}

/// Durable event metadata.
///
/// Implementations must be safe for concurrent use. `compare_and_swap` must
/// check the version and publish the new record as one indivisible step.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// All events, in no particular order
    async fn list(&self) -> Result<Vec<EventRecord>, MetadataError>;

    /// One event and its current version
    async fn get(&self, event_id: &str) -> Result<Option<Versioned<EventRecord>>, MetadataError>;

    /// Insert a new event. Fails with [`MetadataError::AlreadyExists`] on id reuse.
    async fn insert(&self, record: EventRecord) -> Result<(), MetadataError>;

    /// Replace the event if its version still equals `expected_version`
    async fn compare_and_swap(
        &self,
        event_id: &str,
        expected_version: u64,
        record: EventRecord,
    ) -> Result<CasResult, MetadataError>;

    /// Compare-and-swap attempts made by [`MetadataStore::atomic_update`]
    fn max_update_attempts(&self) -> u32 {
        8
    }

    /// Read the event, apply `update`, and write it back only if nobody else
    /// wrote in between. Retries on conflict up to
    /// [`MetadataStore::max_update_attempts`] times with jittered backoff;
    /// `update` may therefore run more than once and must be pure.
    ///
    /// Stores that can hold an exclusive lock across the read and the write
    /// should override this with a single-step version.
    async fn atomic_update(
        &self,
        event_id: &str,
        update: &(dyn Fn(EventRecord) -> EventRecord + Send + Sync),
    ) -> Result<UpdateOutcome, MetadataError> {
        let max_attempts = self.max_update_attempts();
        for attempt in 1..=max_attempts {
            let Some(current) = self.get(event_id).await? else {
                return Ok(UpdateOutcome::Absent);
            };
            let updated = update(current.record);
            match self
                .compare_and_swap(event_id, current.version, updated.clone())
                .await?
            {
                CasResult::Ok { .. } => return Ok(UpdateOutcome::Updated(updated)),
                CasResult::Absent => return Ok(UpdateOutcome::Absent),
                CasResult::Conflict { current_version } => {
                    crate::metrics::record_metadata_conflict();
                    tracing::debug!(
                        event_id = %event_id,
                        attempt,
                        expected_version = current.version,
                        current_version,
                        "Metadata update conflicted, retrying"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(conflict_backoff(attempt)).await;
                    }
                }
            }
        }
        tracing::warn!(event_id = %event_id, "Metadata update gave up after repeated conflicts");
        Ok(UpdateOutcome::Conflict)
    }
}

const BACKOFF_BASE_MS: u64 = 2;
const BACKOFF_CAP_MS: u64 = 100;

/// Full-jitter exponential delay before retry `attempt` (1-based)
pub(crate) fn conflict_backoff(attempt: u32) -> Duration {
    let ceiling = BACKOFF_BASE_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(rand::rng().random_range(0..=ceiling))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn upload(id: &str, at: DateTime<Utc>) -> UploadRecord {
        UploadRecord {
            id: id.into(),
            guest_name: "Ana".into(),
            message: None,
            storage_key: format!("events/e/{id}.jpg"),
            url: format!("http://localhost/media/events/e/{id}.jpg"),
            media_type: "image/jpeg".into(),
            size: 3,
            original_filename: "a.jpg".into(),
            created_at: at,
        }
    }

    #[test]
    fn test_uploads_newest_first() {
        let now = Utc::now();
        let mut event = EventRecord::new("e", "Wedding", None);
        event.uploads = vec![
            upload("old", now - Duration::minutes(5)),
            upload("mid", now - Duration::minutes(1)),
            upload("new", now),
        ];
        let ids: Vec<_> = event
            .uploads_newest_first()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let mut event = EventRecord::new("e", "Wedding", None);
        event.uploads.push(upload("u1", Utc::now()));
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json["uploads"][0].get("storageKey").is_some());
        assert!(json.get("description").is_none());
    }

    #[test]
    fn test_conflict_backoff_is_bounded() {
        for attempt in 1..=40 {
            let delay = conflict_backoff(attempt);
            assert!(delay <= std::time::Duration::from_millis(BACKOFF_CAP_MS));
        }
        assert!(conflict_backoff(1) <= std::time::Duration::from_millis(4));
    }
}
