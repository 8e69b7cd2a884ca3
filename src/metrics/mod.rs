//! Metrics module
//!
//! Prometheus metrics for uploads, compensation, archives and metadata
//! contention. Exposed as text at `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "galleria_uploads_total",
        "Total number of upload transactions",
        &["status"]
    ).unwrap();

    pub static ref UPLOAD_FILES_TOTAL: Counter = register_counter!(
        "galleria_upload_files_total",
        "Files committed by successful uploads"
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "galleria_upload_bytes_total",
        "Bytes committed by successful uploads"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "galleria_upload_duration_seconds",
        "Upload transaction duration in seconds",
        &["status"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Compensation metrics
    pub static ref COMPENSATIONS_TOTAL: CounterVec = register_counter_vec!(
        "galleria_compensations_total",
        "Upload rollbacks by cause",
        &["reason"]
    ).unwrap();

    pub static ref COMPENSATION_DELETE_FAILURES: Counter = register_counter!(
        "galleria_compensation_delete_failures_total",
        "Blobs a rollback failed to delete"
    ).unwrap();

    // Archive metrics
    pub static ref ARCHIVE_ENTRIES_TOTAL: CounterVec = register_counter_vec!(
        "galleria_archive_entries_total",
        "Archive entries by outcome",
        &["status"]  // "written" or "skipped"
    ).unwrap();

    pub static ref ARCHIVE_DURATION: Histogram = register_histogram!(
        "galleria_archive_duration_seconds",
        "Time to stream one archive",
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    // Metadata metrics
    pub static ref METADATA_CONFLICTS_TOTAL: Counter = register_counter!(
        "galleria_metadata_conflicts_total",
        "Compare-and-swap attempts that lost a race"
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "galleria_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a committed upload
pub fn record_upload_success(files: usize, bytes: u64, duration_secs: f64) {
    UPLOADS_TOTAL.with_label_values(&["success"]).inc();
    UPLOAD_FILES_TOTAL.inc_by(files as f64);
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
    UPLOAD_DURATION
        .with_label_values(&["success"])
        .observe(duration_secs);
}

/// Record a failed upload
pub fn record_upload_failure(duration_secs: f64) {
    UPLOADS_TOTAL.with_label_values(&["failure"]).inc();
    UPLOAD_DURATION
        .with_label_values(&["failure"])
        .observe(duration_secs);
}

/// Record a rollback and how many of its deletes failed
pub fn record_compensation(reason: &str, failed_deletes: usize) {
    COMPENSATIONS_TOTAL.with_label_values(&[reason]).inc();
    COMPENSATION_DELETE_FAILURES.inc_by(failed_deletes as f64);
}

/// Record one archive entry
pub fn record_archive_entry(written: bool) {
    let status = if written { "written" } else { "skipped" };
    ARCHIVE_ENTRIES_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_archive_duration(duration_secs: f64) {
    ARCHIVE_DURATION.observe(duration_secs);
}

pub fn record_metadata_conflict() {
    METADATA_CONFLICTS_TOTAL.inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Render the default registry in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
