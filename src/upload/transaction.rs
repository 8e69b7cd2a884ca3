//! Upload transaction coordinator

use super::compensation::PendingBlobs;
use super::validation::{AcceptedFile, UploadPolicy};
use super::UploadRequest;
use crate::blob::{self, BlobError, BlobStore, PutBlob, StoredBlob};
use crate::config::UploadConfig;
use crate::error::GalleryError;
use crate::metadata::{EventRecord, MetadataStore, UpdateOutcome, UploadRecord};
use crate::metrics;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Blob metadata tag carrying the guest name
pub const GUEST_NAME_TAG: &str = "guest-name";
/// Blob metadata tag carrying the event id
pub const EVENT_ID_TAG: &str = "event-id";

/// Prefix under which all blobs of an event are stored
pub fn event_prefix(event_id: &str) -> String {
    format!("events/{event_id}/")
}

/// Orchestrates "add N files to event E" across both stores.
pub struct UploadTransaction {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    policy: UploadPolicy,
    concurrency: usize,
    write_timeout: Duration,
}

/// A file ready to be written
struct Draft {
    upload_id: String,
    key: String,
    file: AcceptedFile,
    /// Filename exactly as the client sent it
    original_filename: String,
    body: Bytes,
}

impl UploadTransaction {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        config: &UploadConfig,
        write_timeout: Duration,
    ) -> Self {
        Self {
            blobs,
            metadata,
            policy: UploadPolicy::from_config(config),
            concurrency: config.concurrency.max(1),
            write_timeout,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Run the transaction.
    ///
    /// On success every returned record is in the event and its blob is
    /// fetchable. On failure no blob written by this call remains and the
    /// event is unchanged.
    #[tracing::instrument(
        name = "upload.transaction",
        skip(self, request),
        fields(
            event_id = %request.event_id,
            upload.files = request.files.len(),
            upload.bytes = request.total_bytes()
        ),
        err
    )]
    pub async fn execute(&self, request: UploadRequest) -> Result<Vec<UploadRecord>, GalleryError> {
        let started = Instant::now();
        let bytes = request.total_bytes();
        let result = self.run(request).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(records) => {
                metrics::record_upload_success(records.len(), bytes, elapsed);
                tracing::info!(files = records.len(), bytes, "Upload committed");
            }
            Err(e) => {
                metrics::record_upload_failure(elapsed);
                metrics::record_error(e.kind());
            }
        }
        result
    }

    async fn run(&self, request: UploadRequest) -> Result<Vec<UploadRecord>, GalleryError> {
        let accepted = self.policy.validate(&request)?;
        let event_id = request.event_id;

        match self.metadata.get(&event_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(GalleryError::NotFound(format!("event {event_id}"))),
            Err(e) => return Err(GalleryError::Persistence(e.to_string())),
        }

        let drafts: Vec<Draft> = accepted
            .files
            .into_iter()
            .zip(request.files)
            .map(|(file, incoming)| Draft {
                upload_id: Uuid::new_v4().to_string(),
                key: format!(
                    "{}{}.{}",
                    event_prefix(&event_id),
                    Uuid::new_v4(),
                    file.extension
                ),
                file,
                original_filename: incoming.filename,
                body: incoming.bytes,
            })
            .collect();

        let mut pending = PendingBlobs::new(self.blobs.clone(), self.write_timeout);
        let stored = match self
            .write_all(&drafts, &event_id, &accepted.guest_name, &mut pending)
            .await
        {
            Ok(stored) => stored,
            Err(reason) => {
                tracing::warn!(
                    event_id = %event_id,
                    written = pending.len(),
                    reason = %reason,
                    "Blob write failed, rolling back"
                );
                pending.rollback("storage_write").await;
                return Err(GalleryError::StorageWrite(reason));
            }
        };

        let created_at = Utc::now();
        let records: Vec<UploadRecord> = drafts
            .into_iter()
            .zip(stored)
            .map(|(draft, blob)| UploadRecord {
                id: draft.upload_id,
                guest_name: accepted.guest_name.clone(),
                message: accepted.message.clone(),
                storage_key: blob.key,
                url: blob.url,
                media_type: draft.file.media_type,
                size: blob.size,
                original_filename: draft.original_filename,
                created_at,
            })
            .collect();

        let appended = records.clone();
        let append = move |mut event: EventRecord| {
            event.uploads.extend(appended.iter().cloned());
            event
        };

        match self.metadata.atomic_update(&event_id, &append).await {
            Ok(UpdateOutcome::Updated(_)) => {
                pending.commit();
                Ok(records)
            }
            Ok(UpdateOutcome::Absent) => {
                tracing::warn!(event_id = %event_id, "Event vanished before commit, rolling back");
                pending.rollback("event_vanished").await;
                Err(GalleryError::NotFound(format!("event {event_id}")))
            }
            Ok(UpdateOutcome::Conflict) => {
                pending.rollback("metadata_conflict").await;
                Err(GalleryError::Persistence(format!(
                    "event {event_id} kept changing, gave up after {} attempts",
                    self.metadata.max_update_attempts()
                )))
            }
            Err(e) => {
                tracing::error!(event_id = %event_id, error = %e, "Metadata commit failed, rolling back");
                pending.rollback("persistence").await;
                Err(GalleryError::Persistence(e.to_string()))
            }
        }
    }

    /// Fan out one put per draft and wait for all of them.
    ///
    /// Every key whose put succeeded or timed out is registered with
    /// `pending`. After the first failure no further puts are started, but
    /// the ones in flight are still awaited so their keys can be rolled back.
    /// Returns the stored blobs in draft order, or the first failure.
    async fn write_all(
        &self,
        drafts: &[Draft],
        event_id: &str,
        guest_name: &str,
        pending: &mut PendingBlobs,
    ) -> Result<Vec<StoredBlob>, String> {
        let aborted = Arc::new(AtomicBool::new(false));
        let mut tags = BTreeMap::new();
        tags.insert(GUEST_NAME_TAG.to_string(), guest_name.to_string());
        tags.insert(EVENT_ID_TAG.to_string(), event_id.to_string());

        // collected up front so the transaction future stays Send
        let puts: Vec<_> = drafts
            .iter()
            .enumerate()
            .map(|(index, draft)| {
                let blobs = self.blobs.clone();
                let aborted = aborted.clone();
                let limit = self.write_timeout;
                let blob = PutBlob {
                    key: draft.key.clone(),
                    body: draft.body.clone(),
                    content_type: draft.file.media_type.clone(),
                    metadata: tags.clone(),
                };
                async move {
                    if aborted.load(Ordering::Acquire) {
                        return (index, None);
                    }
                    let result = blob::with_timeout(limit, blobs.put(blob)).await;
                    if result.is_err() {
                        aborted.store(true, Ordering::Release);
                    }
                    (index, Some(result))
                }
            })
            .collect();

        let mut results = stream::iter(puts).buffer_unordered(self.concurrency);
        let mut stored: Vec<Option<StoredBlob>> = vec![None; drafts.len()];
        let mut failure: Option<String> = None;

        while let Some((index, outcome)) = results.next().await {
            let key = &drafts[index].key;
            match outcome {
                None => {}
                Some(Ok(blob)) => {
                    pending.register(blob.key.clone());
                    stored[index] = Some(blob);
                }
                Some(Err(e)) => {
                    if matches!(e, BlobError::Timeout(_)) {
                        // the write may still land
                        pending.register(key.clone());
                    }
                    tracing::warn!(key = %key, error = %e, "Blob write failed");
                    if failure.is_none() {
                        failure = Some(format!("{}: {e}", drafts[index].file.filename));
                    }
                }
            }
        }

        if let Some(reason) = failure {
            return Err(reason);
        }
        stored
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| "blob write did not complete".to_string())
    }
}
