//! Event management
//!
//! Creating, listing and reading galleries. Events are created once and
//! afterwards only grow through upload transactions.

use crate::error::GalleryError;
use crate::metadata::{EventRecord, MetadataError, MetadataStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MAX_EVENT_NAME_LEN: usize = 100;
pub const MAX_EVENT_DESCRIPTION_LEN: usize = 500;

/// Body of `POST /api/events`
#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Event without its uploads, for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub upload_count: usize,
}

impl From<&EventRecord> for EventSummary {
    fn from(event: &EventRecord) -> Self {
        Self {
            id: event.id.clone(),
            name: event.name.clone(),
            description: event.description.clone(),
            created_at: event.created_at,
            upload_count: event.uploads.len(),
        }
    }
}

pub struct EventService {
    metadata: Arc<dyn MetadataStore>,
}

impl EventService {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    #[tracing::instrument(name = "events.create", skip(self, new_event), err)]
    pub async fn create_event(&self, new_event: NewEvent) -> Result<EventRecord, GalleryError> {
        let name = new_event.name.trim();
        if name.is_empty() {
            return Err(GalleryError::validation("name", "is required"));
        }
        if name.chars().count() > MAX_EVENT_NAME_LEN {
            return Err(GalleryError::validation(
                "name",
                format!("must be at most {MAX_EVENT_NAME_LEN} characters"),
            ));
        }
        let description = new_event
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());
        if description.is_some_and(|d| d.chars().count() > MAX_EVENT_DESCRIPTION_LEN) {
            return Err(GalleryError::validation(
                "description",
                format!("must be at most {MAX_EVENT_DESCRIPTION_LEN} characters"),
            ));
        }

        let event = EventRecord::new(
            uuid::Uuid::new_v4().to_string(),
            name,
            description.map(str::to_string),
        );
        self.metadata
            .insert(event.clone())
            .await
            .map_err(persistence)?;

        tracing::info!(event_id = %event.id, name = %event.name, "Event created");
        Ok(event)
    }

    /// Summaries of all events, newest first
    pub async fn list_events(&self) -> Result<Vec<EventSummary>, GalleryError> {
        let mut events = self.metadata.list().await.map_err(persistence)?;
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events.iter().map(EventSummary::from).collect())
    }

    /// One event with its uploads newest first
    pub async fn get_event(&self, event_id: &str) -> Result<EventRecord, GalleryError> {
        let mut event = self.load(event_id).await?;
        event.uploads = event.uploads_newest_first();
        Ok(event)
    }

    /// One event with its uploads in insertion order
    pub async fn load(&self, event_id: &str) -> Result<EventRecord, GalleryError> {
        self.metadata
            .get(event_id)
            .await
            .map_err(persistence)?
            .map(|versioned| versioned.record)
            .ok_or_else(|| GalleryError::NotFound(format!("event {event_id}")))
    }
}

fn persistence(e: MetadataError) -> GalleryError {
    GalleryError::Persistence(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::memory::MemoryMetadataStore;

    fn service() -> EventService {
        EventService::new(Arc::new(MemoryMetadataStore::default()))
    }

    fn new_event(name: &str, description: Option<&str>) -> NewEvent {
        NewEvent {
            name: name.into(),
            description: description.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let svc = service();
        let event = svc
            .create_event(new_event("  Wedding  ", Some("June")))
            .await
            .unwrap();
        assert_eq!(event.name, "Wedding");
        let loaded = svc.get_event(&event.id).await.unwrap();
        assert_eq!(loaded.description.as_deref(), Some("June"));
        assert!(loaded.uploads.is_empty());
    }

    #[tokio::test]
    async fn test_create_validates() {
        let svc = service();
        assert!(matches!(
            svc.create_event(new_event(" ", None)).await,
            Err(GalleryError::Validation { .. })
        ));
        let long = "x".repeat(MAX_EVENT_NAME_LEN + 1);
        assert!(svc.create_event(new_event(&long, None)).await.is_err());
        let long = "x".repeat(MAX_EVENT_DESCRIPTION_LEN + 1);
        assert!(svc.create_event(new_event("Party", Some(&long))).await.is_err());
    }

    #[tokio::test]
    async fn test_get_missing_event() {
        assert!(matches!(
            service().get_event("nope").await,
            Err(GalleryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let svc = service();
        let first = svc.create_event(new_event("First", None)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = svc.create_event(new_event("Second", None)).await.unwrap();
        let ids: Vec<_> = svc.list_events().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
