//! In-memory blob store

use super::{BlobError, BlobListing, BlobStore, BlobStream, PublicUrls, PutBlob, StoredBlob};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct MemoryBlob {
    body: Bytes,
    content_type: String,
    metadata: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

/// [`BlobStore`] holding everything in a concurrent map
#[derive(Debug)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, MemoryBlob>,
    urls: PublicUrls,
}

impl MemoryBlobStore {
    pub fn new(public_base_url: &str) -> Self {
        Self {
            blobs: DashMap::new(),
            urls: PublicUrls::new(public_base_url),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.blobs.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Metadata tags stored with `key`
    pub fn metadata(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.blobs.get(key).map(|b| b.metadata.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.blobs.get(key).map(|b| b.content_type.clone())
    }

    /// Override the recorded creation time of `key`
    pub fn set_created_at(&self, key: &str, at: DateTime<Utc>) {
        if let Some(mut blob) = self.blobs.get_mut(key) {
            blob.created_at = at;
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, blob: PutBlob) -> Result<StoredBlob, BlobError> {
        super::validate_key(&blob.key)?;
        let size = blob.body.len() as u64;
        self.blobs.insert(
            blob.key.clone(),
            MemoryBlob {
                body: blob.body,
                content_type: blob.content_type,
                metadata: blob.metadata,
                created_at: Utc::now(),
            },
        );
        Ok(StoredBlob {
            url: self.urls.url_for(&blob.key),
            key: blob.key,
            size,
        })
    }

    async fn get(&self, key: &str) -> Result<BlobStream, BlobError> {
        let body = self
            .blobs
            .get(key)
            .map(|b| b.body.clone())
            .ok_or_else(|| BlobError::NotFound(key.to_string()))?;
        Ok(futures::stream::once(async move { Ok(body) }).boxed())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobListing>, BlobError> {
        let mut listings: Vec<_> = self
            .blobs
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| BlobListing {
                key: e.key().clone(),
                size: e.body.len() as u64,
                last_modified: e.created_at,
            })
            .collect();
        listings.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listings)
    }

    fn url_for(&self, key: &str) -> String {
        self.urls.url_for(key)
    }

    fn key_for_url(&self, url: &str) -> Option<String> {
        self.urls.key_for_url(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryBlobStore::new("http://localhost/media");
        store
            .put(PutBlob {
                key: "events/e/a.png".into(),
                body: Bytes::from_static(b"png"),
                content_type: "image/png".into(),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert!(store.contains("events/e/a.png"));
        assert_eq!(store.content_type("events/e/a.png").as_deref(), Some("image/png"));
        store.delete("events/e/a.png").await.unwrap();
        store.delete("events/e/a.png").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_foreign_url() {
        let store = MemoryBlobStore::new("http://localhost/media");
        let result = store.fetch("https://cdn.example.com/a.png").await;
        assert!(matches!(result, Err(BlobError::ForeignUrl(_))));
    }
}
