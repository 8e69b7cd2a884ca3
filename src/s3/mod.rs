//! S3 blob store
//!
//! [`BlobStore`] backed by any S3-compatible service through the AWS SDK.
//!
//! # Example
//!
//! ```no_run
//! use galleria::blob::{BlobStore, PutBlob};
//! use galleria::config::S3Config;
//! use galleria::s3::S3BlobStore;
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = S3Config {
//!     bucket: "wedding-photos".to_string(),
//!     region: "us-east-1".to_string(),
//!     endpoint: Some("http://localhost:9000".to_string()),
//!     access_key: Some("minioadmin".to_string()),
//!     secret_key: Some("minioadmin".to_string()),
//!     force_path_style: true,
//!     public_base_url: None,
//! };
//! let store = S3BlobStore::new(&config).await?;
//! let stored = store
//!     .put(PutBlob {
//!         key: "events/abc/photo.jpg".into(),
//!         body: Bytes::from_static(b"..."),
//!         content_type: "image/jpeg".into(),
//!         metadata: Default::default(),
//!     })
//!     .await?;
//! println!("Stored at {}", stored.url);
//! # Ok(())
//! # }
//! ```
//!
//! # Tracing
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | PutObject | `blob.s3.put` | bucket, key, bytes, etag |
//! | GetObject | `blob.s3.get` | bucket, key |
//! | DeleteObject | `blob.s3.delete` | bucket, key |
//! | ListObjectsV2 | `blob.s3.list` | bucket, prefix, count |

pub mod credentials;

use crate::blob::{BlobError, BlobListing, BlobStore, BlobStream, PublicUrls, PutBlob, StoredBlob};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use credentials::{CredentialsError, CredentialsProvider};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::io::ReaderStream;

/// S3 store construction errors
#[derive(Error, Debug)]
pub enum S3StoreError {
    #[error("Credentials error: {0}")]
    CredentialsError(#[from] CredentialsError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// S3-compatible [`BlobStore`]
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    urls: PublicUrls,
}

impl S3BlobStore {
    /// Build an SDK client from configuration
    pub async fn new(config: &S3Config) -> Result<Self, S3StoreError> {
        if config.bucket.trim().is_empty() {
            return Err(S3StoreError::ConfigError("bucket cannot be empty".into()));
        }

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let Some(credentials) = CredentialsProvider::from_config(config)? {
            loader = loader.credentials_provider(credentials.into_sdk());
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(config.force_path_style)
                .build(),
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            urls: PublicUrls::new(Self::public_base(config)),
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Base URL objects are reachable under
    fn public_base(config: &S3Config) -> String {
        if let Some(base) = &config.public_base_url {
            return base.clone();
        }
        match &config.endpoint {
            Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
            None if config.force_path_style => {
                format!("https://s3.{}.amazonaws.com/{}", config.region, config.bucket)
            }
            None => format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region),
        }
    }

    fn backend_error<E, R>(err: SdkError<E, R>) -> BlobError
    where
        E: std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        BlobError::Backend(DisplayErrorContext(err).to_string())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[tracing::instrument(
        name = "blob.s3.put",
        skip(self, blob),
        fields(
            s3.bucket = %self.bucket,
            s3.key = %blob.key,
            upload.bytes = blob.body.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn put(&self, blob: PutBlob) -> Result<StoredBlob, BlobError> {
        let size = blob.body.len() as u64;
        // S3 user metadata travels as HTTP headers and must be ASCII
        let metadata: HashMap<String, String> = blob
            .metadata
            .into_iter()
            .map(|(k, v)| (k, utf8_percent_encode(&v, NON_ALPHANUMERIC).to_string()))
            .collect();

        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&blob.key)
            .content_type(blob.content_type)
            .set_metadata(Some(metadata))
            .body(ByteStream::from(blob.body))
            .send()
            .await
            .map_err(Self::backend_error)?;

        if let Some(etag) = response.e_tag() {
            tracing::Span::current().record("s3.etag", etag);
        }

        Ok(StoredBlob {
            url: self.urls.url_for(&blob.key),
            key: blob.key,
            size,
        })
    }

    #[tracing::instrument(name = "blob.s3.get", skip(self), fields(s3.bucket = %self.bucket), err)]
    async fn get(&self, key: &str) -> Result<BlobStream, BlobError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(SdkError::ServiceError(e))
                if e.err().is_no_such_key() || e.raw().status().as_u16() == 404 =>
            {
                return Err(BlobError::NotFound(key.to_string()));
            }
            Err(e) => return Err(Self::backend_error(e)),
        };

        let reader = response.body.into_async_read();
        Ok(ReaderStream::new(reader)
            .map(|chunk| chunk.map_err(BlobError::from))
            .boxed())
    }

    #[tracing::instrument(name = "blob.s3.delete", skip(self), fields(s3.bucket = %self.bucket), err)]
    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        // S3 answers 204 for missing keys too
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Self::backend_error)?;
        Ok(())
    }

    #[tracing::instrument(
        name = "blob.s3.list",
        skip(self),
        fields(s3.bucket = %self.bucket, s3.count = tracing::field::Empty),
        err
    )]
    async fn list(&self, prefix: &str) -> Result<Vec<BlobListing>, BlobError> {
        let mut listings = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(Self::backend_error)?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                    .unwrap_or_else(Utc::now);
                listings.push(BlobListing {
                    key: key.to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    last_modified,
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        tracing::Span::current().record("s3.count", listings.len());
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

    fn config(endpoint: Option<&str>, path_style: bool) -> S3Config {
        S3Config {
            bucket: "photos".into(),
            region: "us-west-2".into(),
            endpoint: endpoint.map(String::from),
            access_key: Some("test-key".into()),
            secret_key: Some("test-secret".into()),
            force_path_style: path_style,
            public_base_url: None,
        }
    }

    #[test]
    fn test_public_base_virtual_host() {
        assert_eq!(
            S3BlobStore::public_base(&config(None, false)),
            "https://photos.s3.us-west-2.amazonaws.com"
        );
    }

    #[test]
    fn test_public_base_path_style() {
        assert_eq!(
            S3BlobStore::public_base(&config(None, true)),
            "https://s3.us-west-2.amazonaws.com/photos"
        );
    }

    #[test]
    fn test_public_base_custom_endpoint() {
        assert_eq!(
            S3BlobStore::public_base(&config(Some("http://localhost:9000/"), true)),
            "http://localhost:9000/photos"
        );
    }

    #[test]
    fn test_public_base_override() {
        let mut cfg = config(None, false);
        cfg.public_base_url = Some("https://cdn.example.com".into());
        assert_eq!(S3BlobStore::public_base(&cfg), "https://cdn.example.com");
    }

    #[tokio::test]
    async fn test_store_creation() {
        let store = S3BlobStore::new(&config(Some("http://localhost:9000"), true))
            .await
            .unwrap();
        assert_eq!(store.bucket(), "photos");
        assert_eq!(
            store.url_for("events/e/a.jpg"),
            "http://localhost:9000/photos/events/e/a.jpg"
        );
    }
}
