//! Gallery error taxonomy
//!
//! Errors surfaced by the upload transaction and the archive streamer. Each
//! variant maps to one HTTP status at the request boundary.

use hyper::StatusCode;
use thiserror::Error;

/// Errors produced by gallery operations
#[derive(Error, Debug)]
pub enum GalleryError {
    /// Bad input; nothing was written anywhere
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// A blob write failed; blobs already written by the call were removed
    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    /// The metadata commit failed; blobs written by the call were removed
    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("No content: {0}")]
    NoContent(String),

    /// A single blob could not be fetched while archiving. Logged, never returned
    /// to clients.
    #[error("Failed to fetch {key}: {reason}")]
    PartialFetch { key: String, reason: String },
}

impl GalleryError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::NoContent(_) => StatusCode::NOT_FOUND,
            Self::StorageWrite(_) | Self::Persistence(_) | Self::PartialFetch { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short label used for the error metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound(_) => "not_found",
            Self::StorageWrite(_) => "storage_write",
            Self::Persistence(_) => "persistence",
            Self::NoContent(_) => "no_content",
            Self::PartialFetch { .. } => "partial_fetch",
        }
    }
}
