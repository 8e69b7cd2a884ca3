//! Upload module
//!
//! Adds a batch of guest files to an event. [`UploadTransaction`] validates
//! the batch, writes every file to the blob store concurrently, then appends
//! the resulting records to the event. Any failure after the first blob write
//! rolls the written blobs back, so a call either lands completely in both
//! stores or leaves neither changed.

use bytes::Bytes;

pub mod compensation;
pub mod transaction;
pub mod validation;

pub use compensation::PendingBlobs;
pub use transaction::UploadTransaction;
pub use validation::UploadPolicy;

/// One file as received from the client
#[derive(Debug, Clone)]
pub struct IncomingFile {
    /// Client-supplied filename, possibly with a path
    pub filename: String,
    /// Declared media type
    pub media_type: String,
    pub bytes: Bytes,
}

impl IncomingFile {
    pub fn new(
        filename: impl Into<String>,
        media_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            filename: filename.into(),
            media_type: media_type.into(),
            bytes: bytes.into(),
        }
    }
}

/// "Add these files to event E"
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub event_id: String,
    pub guest_name: String,
    pub message: Option<String>,
    pub files: Vec<IncomingFile>,
}

impl UploadRequest {
    /// Total payload size
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes.len() as u64).sum()
    }
}
