//! Gallery archive streaming
//!
//! Turns an event's upload records into one zip stream. Blobs are fetched one
//! at a time and each is written as a complete entry before the next fetch
//! starts, so memory is bounded by the largest single file rather than the
//! gallery.
//!
//! # Failure policy
//!
//! - A blob that cannot be fetched (missing, backend error, timeout) is
//!   skipped with a warning and the archive continues.
//! - A failure of the output itself (compression error, client gone) ends the
//!   archive. The response has already started at that point, so the error is
//!   logged and the connection closes.

pub mod naming;

use crate::blob::{self, BlobError, BlobStore};
use crate::config::{ArchiveCompression, ArchiveConfig};
use crate::error::GalleryError;
use crate::metadata::{EventRecord, UploadRecord};
use crate::metrics;
use async_zip::base::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

/// Content type of the produced archive
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Errors that end an archive
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Compression error: {0}")]
    Zip(#[from] async_zip::error::ZipError),

    #[error("Output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive cancelled by reader")]
    Cancelled,
}

/// Outcome of a completed archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub written: usize,
    pub skipped: usize,
}

/// Writes event galleries as zip archives
#[derive(Clone)]
pub struct ArchiveStreamer {
    blobs: Arc<dyn BlobStore>,
    fetch_timeout: Duration,
    compression: Compression,
    pipe_buffer_size: usize,
}

impl ArchiveStreamer {
    pub fn new(blobs: Arc<dyn BlobStore>, config: &ArchiveConfig) -> Self {
        Self {
            blobs,
            fetch_timeout: config.fetch_timeout(),
            compression: match config.compression {
                ArchiveCompression::Deflate => Compression::Deflate,
                ArchiveCompression::Stored => Compression::Stored,
            },
            pipe_buffer_size: config.pipe_buffer_size.max(8 * 1024),
        }
    }

    /// Start streaming the gallery of `event`.
    ///
    /// Fails with [`GalleryError::NoContent`] before anything is produced when
    /// the event has no uploads. Otherwise the archive is written by a
    /// background task into the returned body; dropping the body stops the
    /// task before its next fetch.
    pub fn stream(&self, event: &EventRecord) -> Result<GalleryDownload, GalleryError> {
        if event.uploads.is_empty() {
            return Err(GalleryError::NoContent(format!(
                "event {} has no uploads",
                event.id
            )));
        }

        let (writer, reader) = tokio::io::duplex(self.pipe_buffer_size);
        let cancel = CancellationToken::new();
        let streamer = self.clone();
        let uploads = event.uploads.clone();
        let task_cancel = cancel.clone();
        let span = tracing::info_span!(
            "archive.stream",
            event_id = %event.id,
            archive.uploads = uploads.len()
        );

        let task = tokio::spawn(
            async move {
                let started = Instant::now();
                let result = streamer.write_to(&uploads, writer, &task_cancel).await;
                metrics::record_archive_duration(started.elapsed().as_secs_f64());
                match result {
                    Ok(report) => {
                        tracing::info!(
                            written = report.written,
                            skipped = report.skipped,
                            "Archive complete"
                        );
                        Some(report)
                    }
                    Err(ArchiveError::Cancelled) => {
                        tracing::info!("Archive reader went away, stopped fetching");
                        None
                    }
                    Err(e) => {
                        metrics::record_error("archive_stream");
                        tracing::error!(error = %e, "Archive stream aborted");
                        None
                    }
                }
            }
            .instrument(span),
        );

        Ok(GalleryDownload {
            filename: naming::download_filename(event),
            body: ArchiveBody {
                inner: ReaderStream::new(reader),
                _cancel_on_drop: cancel.drop_guard(),
            },
            task,
        })
    }

    /// Write an archive of `uploads` into `output`, in record order.
    ///
    /// Returns once the archive is finished and `output` shut down. Blobs
    /// that cannot be fetched are skipped; errors writing `output` end the
    /// archive.
    pub async fn write_to<W>(
        &self,
        uploads: &[UploadRecord],
        output: W,
        cancel: &CancellationToken,
    ) -> Result<ArchiveReport, ArchiveError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut zip = ZipFileWriter::with_tokio(output);
        let mut report = ArchiveReport::default();

        for upload in uploads {
            let data = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
                data = self.fetch(upload) => data,
            };

            let data = match data {
                Ok(data) => data,
                Err(e) => {
                    let skipped = GalleryError::PartialFetch {
                        key: upload.storage_key.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(upload_id = %upload.id, error = %skipped, "Skipping archive entry");
                    metrics::record_archive_entry(false);
                    report.skipped += 1;
                    continue;
                }
            };

            let entry = ZipEntryBuilder::new(naming::entry_name(upload).into(), self.compression);
            zip.write_entry_whole(entry, &data).await?;
            metrics::record_archive_entry(true);
            report.written += 1;
        }

        let mut output = zip.close().await?.into_inner();
        output.shutdown().await?;
        Ok(report)
    }

    /// Fetch one blob by its URL, falling back to the storage key for URLs
    /// issued under a different public base.
    async fn fetch(&self, upload: &UploadRecord) -> Result<Bytes, BlobError> {
        blob::with_timeout(self.fetch_timeout, async {
            let stream = match self.blobs.fetch(&upload.url).await {
                Err(BlobError::ForeignUrl(_)) => self.blobs.get(&upload.storage_key).await?,
                other => other?,
            };
            blob::read_to_bytes(stream).await
        })
        .await
    }
}

/// A started gallery download
pub struct GalleryDownload {
    /// Value for the `Content-Disposition` filename
    pub filename: String,
    pub body: ArchiveBody,
    /// Resolves to the report, or `None` if the archive did not complete
    pub task: JoinHandle<Option<ArchiveReport>>,
}

/// Archive bytes as produced by the background writer
pub struct ArchiveBody {
    inner: ReaderStream<DuplexStream>,
    _cancel_on_drop: DropGuard,
}

impl Stream for ArchiveBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
