//! Blob storage
//!
//! Abstract object storage for guest media. A store keeps byte buffers under
//! caller-chosen keys, hands out a fetchable URL for each, and supports
//! idempotent delete. It knows nothing about events.
//!
//! # Backends
//!
//! | Backend | Type | Notes |
//! |---------|------|-------|
//! | Local filesystem | [`fs::FsBlobStore`] | Atomic temp-file + rename writes |
//! | In-memory | [`memory::MemoryBlobStore`] | Development and tests |
//! | S3-compatible | [`crate::s3::S3BlobStore`] | AWS SDK, path-style optional |

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Component, Path};
use std::time::Duration;
use thiserror::Error;

pub mod fs;
pub mod memory;

/// Stream of blob bytes. Consumed at most once.
pub type BlobStream = BoxStream<'static, Result<Bytes, BlobError>>;

/// Blob store errors
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("URL does not belong to this store: {0}")]
    ForeignUrl(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// A blob to store
#[derive(Debug, Clone)]
pub struct PutBlob {
    pub key: String,
    pub body: Bytes,
    pub content_type: String,
    /// Contextual tags kept next to the object for auditability
    pub metadata: BTreeMap<String, String>,
}

/// Result of a successful put
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub url: String,
    pub size: u64,
}

/// One entry of a prefix listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobListing {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Object storage contract consumed by the upload transaction, the archive
/// streamer and the reconciler.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Store `blob.body` under `blob.key`, replacing nothing: keys are never reused.
    async fn put(&self, blob: PutBlob) -> Result<StoredBlob, BlobError>;

    /// Stream the blob stored under `key`. Missing blobs yield [`BlobError::NotFound`].
    async fn get(&self, key: &str) -> Result<BlobStream, BlobError>;

    /// Delete the blob under `key`. Deleting a missing blob succeeds.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// List blobs whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobListing>, BlobError>;

    /// Public URL for `key`.
    fn url_for(&self, key: &str) -> String;

    /// Inverse of [`BlobStore::url_for`]; `None` for URLs this store did not issue.
    fn key_for_url(&self, url: &str) -> Option<String>;

    /// Fetch a blob by the URL recorded in an upload record.
    async fn fetch(&self, url: &str) -> Result<BlobStream, BlobError> {
        let key = self
            .key_for_url(url)
            .ok_or_else(|| BlobError::ForeignUrl(url.to_string()))?;
        self.get(&key).await
    }
}

/// URL scheme shared by the backends: `<base>/<key>`
#[derive(Debug, Clone)]
pub struct PublicUrls {
    base: String,
}

impl PublicUrls {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base, key)
    }

    pub fn key_for_url(&self, url: &str) -> Option<String> {
        let key = url.strip_prefix(&self.base)?.strip_prefix('/')?;
        if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        }
    }
}

/// Reject keys that are empty, absolute or escape the store root.
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    if key.is_empty() {
        return Err(BlobError::InvalidKey("key may not be empty".into()));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(BlobError::InvalidKey(format!("{key}: must be a relative path")));
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(BlobError::InvalidKey(format!(
                    "{key}: contains invalid path segments"
                )))
            }
        }
    }
    Ok(())
}

/// Run a single store attempt under `limit`.
pub async fn with_timeout<T, F>(limit: Duration, attempt: F) -> Result<T, BlobError>
where
    F: Future<Output = Result<T, BlobError>>,
{
    match tokio::time::timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(BlobError::Timeout(limit)),
    }
}

/// Drain a blob stream into one buffer.
pub async fn read_to_bytes(mut stream: BlobStream) -> Result<Bytes, BlobError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}
