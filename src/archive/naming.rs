//! Archive and entry naming
//!
//! Names are derived from the guest name and the upload id, never from the
//! storage key. Every user-supplied part is reduced to `[A-Za-z0-9_-]` so a
//! name can neither traverse directories nor carry characters that are
//! illegal on common filesystems.

use crate::metadata::{EventRecord, UploadRecord};
use std::path::Path;

const MAX_COMPONENT_LEN: usize = 50;
const SHORT_ID_LEN: usize = 8;

/// Reduce `input` to a safe filename component, or `fallback` if nothing survives.
pub fn sanitize_component(input: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_COMPONENT_LEN));
    let mut last_was_sep = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
        if out.len() >= MAX_COMPONENT_LEN {
            break;
        }
    }
    let trimmed = out.trim_matches(|c| c == '_' || c == '-');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extension of the stored blob, with the leading dot, or empty
fn extension_of(upload: &UploadRecord) -> String {
    let ext = Path::new(&upload.storage_key)
        .extension()
        .or_else(|| Path::new(&upload.original_filename).extension())
        .and_then(|e| e.to_str())
        .map(|e| {
            e.chars()
                .filter(char::is_ascii_alphanumeric)
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .unwrap_or_default();
    if ext.is_empty() {
        ext
    } else {
        format!(".{ext}")
    }
}

/// `<guest>_<upload id><.ext>`
pub fn entry_name(upload: &UploadRecord) -> String {
    format!(
        "{}_{}{}",
        sanitize_component(&upload.guest_name, "guest"),
        sanitize_component(&upload.id, "upload"),
        extension_of(upload)
    )
}

/// `<event name>_<short id>_gallery.zip`
///
/// Not guaranteed unique: two events whose names sanitize alike and whose ids
/// share a prefix produce the same name.
pub fn download_filename(event: &EventRecord) -> String {
    let short_id: String = event
        .id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(SHORT_ID_LEN)
        .collect();
    format!(
        "{}_{}_gallery.zip",
        sanitize_component(&event.name, "event"),
        if short_id.is_empty() { "0" } else { &short_id }
    )
}
