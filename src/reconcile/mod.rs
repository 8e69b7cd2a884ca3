//! Store reconciliation
//!
//! Blob keys are the only link between the two stores, so drift can only be
//! found by listing storage and cross-checking it against the records:
//!
//! - an **orphan** is a blob under `events/` that no upload record references
//! - a **dangling record** is an upload record whose blob is not listed
//!
//! Metadata is read before storage is listed. A transaction that commits in
//! between can then only show up as an orphan, never as a dangling record,
//! and orphans younger than the grace period are ignored.

use crate::blob::{BlobError, BlobListing, BlobStore};
use crate::metadata::{EventRecord, MetadataError, MetadataStore};
use crate::upload::transaction::event_prefix;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const ALL_EVENTS_PREFIX: &str = "events/";

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Invalid grace period: {0}")]
    InvalidGrace(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DanglingRecord {
    pub event_id: String,
    pub upload_id: String,
    pub storage_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanBlob {
    pub key: String,
    pub size: u64,
    pub last_modified: chrono::DateTime<Utc>,
}

impl From<BlobListing> for OrphanBlob {
    fn from(listing: BlobListing) -> Self {
        Self {
            key: listing.key,
            size: listing.size,
            last_modified: listing.last_modified,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub events_checked: usize,
    pub blobs_listed: usize,
    pub orphans: Vec<OrphanBlob>,
    pub dangling: Vec<DanglingRecord>,
    pub deleted: usize,
    pub delete_failures: usize,
}

pub struct Reconciler {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    grace: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        grace: Duration,
    ) -> Result<Self, ReconcileError> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| ReconcileError::InvalidGrace(e.to_string()))?;
        Ok(Self {
            blobs,
            metadata,
            grace,
        })
    }

    /// Cross-check one event, or every event when `event_id` is `None`.
    /// Orphans are deleted only when `delete_orphans` is set.
    #[tracing::instrument(name = "reconcile.run", skip(self), err)]
    pub async fn run(
        &self,
        event_id: Option<&str>,
        delete_orphans: bool,
    ) -> Result<ReconcileReport, ReconcileError> {
        let (events, prefix): (Vec<EventRecord>, String) = match event_id {
            Some(id) => {
                let event = self
                    .metadata
                    .get(id)
                    .await?
                    .ok_or_else(|| ReconcileError::EventNotFound(id.to_string()))?;
                (vec![event.record], event_prefix(id))
            }
            None => (self.metadata.list().await?, ALL_EVENTS_PREFIX.to_string()),
        };

        let referenced: HashSet<&str> = events
            .iter()
            .flat_map(|e| e.uploads.iter().map(|u| u.storage_key.as_str()))
            .collect();

        let listed = self.blobs.list(&prefix).await?;
        let present: HashSet<&str> = listed.iter().map(|l| l.key.as_str()).collect();

        let dangling: Vec<DanglingRecord> = events
            .iter()
            .flat_map(|e| {
                e.uploads
                    .iter()
                    .filter(|u| !present.contains(u.storage_key.as_str()))
                    .map(|u| DanglingRecord {
                        event_id: e.id.clone(),
                        upload_id: u.id.clone(),
                        storage_key: u.storage_key.clone(),
                    })
            })
            .collect();

        let cutoff = Utc::now() - self.grace;
        let orphans: Vec<OrphanBlob> = listed
            .iter()
            .filter(|l| !referenced.contains(l.key.as_str()) && l.last_modified < cutoff)
            .cloned()
            .map(OrphanBlob::from)
            .collect();

        let mut report = ReconcileReport {
            events_checked: events.len(),
            blobs_listed: listed.len(),
            orphans,
            dangling,
            ..Default::default()
        };

        for record in &report.dangling {
            tracing::warn!(
                event_id = %record.event_id,
                upload_id = %record.upload_id,
                key = %record.storage_key,
                "Upload record has no blob"
            );
        }

        if delete_orphans {
            for orphan in &report.orphans {
                match self.blobs.delete(&orphan.key).await {
                    Ok(()) => {
                        report.deleted += 1;
                        tracing::info!(key = %orphan.key, "Deleted orphaned blob");
                    }
                    Err(e) => {
                        report.delete_failures += 1;
                        tracing::error!(key = %orphan.key, error = %e, "Failed to delete orphaned blob");
                    }
                }
            }
        }

        tracing::info!(
            events = report.events_checked,
            blobs = report.blobs_listed,
            orphans = report.orphans.len(),
            dangling = report.dangling.len(),
            deleted = report.deleted,
            "Reconciliation finished"
        );
        Ok(report)
    }
}
