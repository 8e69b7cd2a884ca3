//! Shared request state and store construction

use super::ServerError;
use crate::archive::ArchiveStreamer;
use crate::blob::fs::FsBlobStore;
use crate::blob::memory::MemoryBlobStore;
use crate::blob::BlobStore;
use crate::config::{
    AllowedType, Config, MetadataBackend, MetadataConfig, StorageBackend, StorageConfig,
};
use crate::events::EventService;
use crate::metadata::json_file::JsonFileStore;
use crate::metadata::memory::MemoryMetadataStore;
use crate::metadata::MetadataStore;
use crate::s3::S3BlobStore;
use crate::upload::UploadTransaction;
use std::sync::Arc;

/// Everything a request handler needs, shared across connections
pub struct AppState {
    pub blobs: Arc<dyn BlobStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub events: EventService,
    pub uploads: UploadTransaction,
    pub archives: ArchiveStreamer,
    pub max_body_bytes: u64,
    pub metrics_enabled: bool,
    allowed_types: Vec<AllowedType>,
}

impl AppState {
    /// Wire services around already-built stores
    pub fn new(config: &Config, blobs: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            events: EventService::new(metadata.clone()),
            uploads: UploadTransaction::new(
                blobs.clone(),
                metadata.clone(),
                &config.upload,
                config.storage.timeout(),
            ),
            archives: ArchiveStreamer::new(blobs.clone(), &config.archive),
            blobs,
            metadata,
            max_body_bytes: config.server.max_body_bytes,
            metrics_enabled: config.metrics.enabled,
            allowed_types: config.upload.allowed_types.clone(),
        }
    }

    /// Build the configured stores, then wire services around them
    pub async fn from_config(config: &Config) -> Result<Self, ServerError> {
        let blobs = build_blob_store(&config.storage).await?;
        let metadata = build_metadata_store(&config.metadata).await?;
        Ok(Self::new(config, blobs, metadata))
    }

    /// Media type served for a stored key, from the upload allow-list
    pub fn media_type_for(&self, key: &str) -> &str {
        let extension = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
        self.allowed_types
            .iter()
            .find(|t| t.extension.eq_ignore_ascii_case(extension))
            .map(|t| t.media_type.as_str())
            .unwrap_or("application/octet-stream")
    }

    pub fn max_files(&self) -> usize {
        self.uploads.policy().max_files()
    }

    pub fn max_file_size(&self) -> usize {
        self.uploads.policy().max_file_size()
    }
}

pub async fn build_blob_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, ServerError> {
    let store: Arc<dyn BlobStore> = match config.backend {
        StorageBackend::Fs => Arc::new(
            FsBlobStore::new(&config.fs.root, &config.public_base_url)
                .await
                .map_err(|e| ServerError::StoreError(format!("filesystem store: {e}")))?,
        ),
        StorageBackend::Memory => Arc::new(MemoryBlobStore::new(&config.public_base_url)),
        StorageBackend::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| ServerError::StoreError("storage.s3 is missing".into()))?;
            Arc::new(
                S3BlobStore::new(s3)
                    .await
                    .map_err(|e| ServerError::StoreError(format!("s3 store: {e}")))?,
            )
        }
    };
    tracing::info!(backend = ?config.backend, "Blob store ready");
    Ok(store)
}

pub async fn build_metadata_store(
    config: &MetadataConfig,
) -> Result<Arc<dyn MetadataStore>, ServerError> {
    let store: Arc<dyn MetadataStore> = match config.backend {
        MetadataBackend::JsonFile => Arc::new(
            JsonFileStore::open(&config.path, config.max_update_attempts)
                .await
                .map_err(|e| ServerError::StoreError(format!("metadata document: {e}")))?,
        ),
        MetadataBackend::Memory => Arc::new(MemoryMetadataStore::new(config.max_update_attempts)),
    };
    tracing::info!(backend = ?config.backend, "Metadata store ready");
    Ok(store)
}
