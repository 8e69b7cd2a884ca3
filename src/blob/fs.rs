//! Local filesystem blob store
//!
//! Blobs live under `root/<key>`. Writes go to a uniquely named temp file next
//! to the destination and are renamed into place, so a reader never observes a
//! half-written blob. Put metadata is kept as a JSON sidecar under
//! `root/.meta/<key>.json`.

use super::{
    validate_key, BlobError, BlobListing, BlobStore, BlobStream, PublicUrls, PutBlob, StoredBlob,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

const META_DIR: &str = ".meta";

/// Filesystem-backed [`BlobStore`]
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    urls: PublicUrls,
}

impl FsBlobStore {
    /// Create the store, creating `root` if needed.
    pub async fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        tracing::info!(root = %root.display(), "Filesystem blob store ready");
        Ok(Self {
            root,
            urls: PublicUrls::new(public_base_url),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BlobError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&staging, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_if_present(path: &Path) -> Result<(), BlobError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[tracing::instrument(
        name = "blob.fs.put",
        skip(self, blob),
        fields(blob.key = %blob.key, blob.bytes = blob.body.len()),
        err
    )]
    async fn put(&self, blob: PutBlob) -> Result<StoredBlob, BlobError> {
        let path = self.blob_path(&blob.key)?;
        Self::write_atomic(&path, &blob.body).await?;

        let mut sidecar = blob.metadata.clone();
        sidecar.insert("content-type".into(), blob.content_type.clone());
        let sidecar = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| BlobError::Backend(format!("encoding metadata: {e}")))?;
        if let Err(e) = Self::write_atomic(&self.meta_path(&blob.key), &sidecar).await {
            // sidecar is best effort
            tracing::warn!(key = %blob.key, error = %e, "Failed to write blob metadata sidecar");
        }

        Ok(StoredBlob {
            url: self.urls.url_for(&blob.key),
            size: blob.body.len() as u64,
            key: blob.key,
        })
    }

    async fn get(&self, key: &str) -> Result<BlobStream, BlobError> {
        let path = self.blob_path(key)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BlobError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ReaderStream::new(file)
            .map(|chunk| chunk.map_err(BlobError::from))
            .boxed())
    }

    #[tracing::instrument(name = "blob.fs.delete", skip(self), err)]
    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.blob_path(key)?;
        Self::remove_if_present(&path).await?;
        Self::remove_if_present(&self.meta_path(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobListing>, BlobError> {
        let mut listings = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    // sidecars and in-flight staging files
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(prefix) {
                    continue;
                }
                let metadata = entry.metadata().await?;
                let last_modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                listings.push(BlobListing {
                    key,
                    size: metadata.len(),
                    last_modified,
                });
            }
        }

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
