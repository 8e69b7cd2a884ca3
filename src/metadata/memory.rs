//! In-memory metadata store

use super::{CasResult, EventRecord, MetadataError, MetadataStore, Versioned};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Process-local [`MetadataStore`]. The per-key lock of the map makes each
/// compare-and-swap atomic.
#[derive(Debug)]
pub struct MemoryMetadataStore {
    events: DashMap<String, Versioned<EventRecord>>,
    max_update_attempts: u32,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new(8)
    }
}

impl MemoryMetadataStore {
    pub fn new(max_update_attempts: u32) -> Self {
        Self {
            events: DashMap::new(),
            max_update_attempts: max_update_attempts.max(1),
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn list(&self) -> Result<Vec<EventRecord>, MetadataError> {
        Ok(self.events.iter().map(|e| e.record.clone()).collect())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Versioned<EventRecord>>, MetadataError> {
        Ok(self.events.get(event_id).map(|e| e.value().clone()))
    }

    async fn insert(&self, record: EventRecord) -> Result<(), MetadataError> {
        match self.events.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(MetadataError::AlreadyExists(record.id)),
            Entry::Vacant(slot) => {
                slot.insert(Versioned { version: 1, record });
                Ok(())
            }
        }
    }

    async fn compare_and_swap(
        &self,
        event_id: &str,
        expected_version: u64,
        record: EventRecord,
    ) -> Result<CasResult, MetadataError> {
        let Some(mut current) = self.events.get_mut(event_id) else {
            return Ok(CasResult::Absent);
        };
        if current.version != expected_version {
            return Ok(CasResult::Conflict {
                current_version: current.version,
            });
        }
        current.version += 1;
        current.record = record;
        Ok(CasResult::Ok {
            new_version: current.version,
        })
    }

    fn max_update_attempts(&self) -> u32 {
        self.max_update_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::UpdateOutcome;

    #[tokio::test]
    async fn test_atomic_update_appends() {
        let store = MemoryMetadataStore::default();
        store
            .insert(EventRecord::new("e1", "Wedding", None))
            .await
            .unwrap();

        let outcome = store
            .atomic_update("e1", &|mut event: EventRecord| {
                event.description = Some("Summer".into());
                event
            })
            .await
            .unwrap();

        match outcome {
            UpdateOutcome::Updated(event) => assert_eq!(event.description.as_deref(), Some("Summer")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.get("e1").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_atomic_update_absent() {
        let store = MemoryMetadataStore::default();
        let outcome = store.atomic_update("nope", &|e| e).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Absent);
    }
}
