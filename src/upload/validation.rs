//! Upload validation
//!
//! Checks a request against the configured limits and allow-list before
//! anything is written. A file is accepted only when its extension and its
//! declared media type are both allow-listed and belong to the same entry.

use super::{IncomingFile, UploadRequest};
use crate::config::{AllowedType, UploadConfig};
use crate::error::GalleryError;
use std::path::Path;

/// A request that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedUpload {
    /// Trimmed guest name
    pub guest_name: String,
    /// Trimmed message; blank messages become `None`
    pub message: Option<String>,
    /// Per file, in request order
    pub files: Vec<AcceptedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedFile {
    /// Lowercase extension without the dot
    pub extension: String,
    /// Canonical allow-listed media type
    pub media_type: String,
    /// Filename with any client path stripped
    pub filename: String,
}

/// Limits applied to every upload
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    max_files: usize,
    max_file_size: usize,
    max_guest_name_len: usize,
    max_message_len: usize,
    allowed: Vec<AllowedType>,
}

impl UploadPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_files: config.max_files,
            max_file_size: config.max_file_size,
            max_guest_name_len: config.max_guest_name_len,
            max_message_len: config.max_message_len,
            allowed: config
                .allowed_types
                .iter()
                .map(|t| AllowedType {
                    extension: t.extension.to_ascii_lowercase(),
                    media_type: t.media_type.to_ascii_lowercase(),
                })
                .collect(),
        }
    }

    pub fn max_files(&self) -> usize {
        self.max_files
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Validate `request`, failing on the first offending field.
    pub fn validate(&self, request: &UploadRequest) -> Result<AcceptedUpload, GalleryError> {
        let guest_name = request.guest_name.trim();
        if guest_name.is_empty() {
            return Err(GalleryError::validation("guestName", "is required"));
        }
        if guest_name.chars().count() > self.max_guest_name_len {
            return Err(GalleryError::validation(
                "guestName",
                format!("must be at most {} characters", self.max_guest_name_len),
            ));
        }

        let message = request
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty());
        if let Some(message) = message {
            if message.chars().count() > self.max_message_len {
                return Err(GalleryError::validation(
                    "message",
                    format!("must be at most {} characters", self.max_message_len),
                ));
            }
        }

        if request.files.is_empty() {
            return Err(GalleryError::validation("files", "at least one file is required"));
        }
        if request.files.len() > self.max_files {
            return Err(GalleryError::validation(
                "files",
                format!("at most {} files per upload", self.max_files),
            ));
        }

        let files = request
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| self.accept_file(index, file))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AcceptedUpload {
            guest_name: guest_name.to_string(),
            message: message.map(str::to_string),
            files,
        })
    }

    fn accept_file(&self, index: usize, file: &IncomingFile) -> Result<AcceptedFile, GalleryError> {
        let field = format!("files[{index}]");

        if file.bytes.is_empty() {
            return Err(GalleryError::validation(field, "file is empty"));
        }
        if file.bytes.len() > self.max_file_size {
            return Err(GalleryError::validation(
                field,
                format!("file exceeds {} bytes", self.max_file_size),
            ));
        }

        let filename = base_filename(&file.filename);
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| GalleryError::validation(&field, "file has no extension"))?;
        let media_type = essence(&file.media_type);

        if !self.allowed.iter().any(|t| t.extension == extension) {
            return Err(GalleryError::validation(
                field,
                format!("extension .{extension} is not allowed"),
            ));
        }
        if !self.allowed.iter().any(|t| t.media_type == media_type) {
            return Err(GalleryError::validation(
                field,
                format!("media type {media_type} is not allowed"),
            ));
        }
        if !self
            .allowed
            .iter()
            .any(|t| t.extension == extension && t.media_type == media_type)
        {
            return Err(GalleryError::validation(
                field,
                format!("media type {media_type} does not match extension .{extension}"),
            ));
        }

        Ok(AcceptedFile {
            extension,
            media_type,
            filename: filename.to_string(),
        })
    }
}

/// Last path segment of a client filename, for either separator style.
pub fn base_filename(filename: &str) -> &str {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim()
}

/// `image/jpeg; charset=binary` -> `image/jpeg`
fn essence(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> UploadPolicy {
        UploadPolicy::from_config(&UploadConfig {
            max_files: 3,
            max_file_size: 10,
            max_guest_name_len: 8,
            max_message_len: 12,
            ..Default::default()
        })
    }

    fn request(files: Vec<IncomingFile>) -> UploadRequest {
        UploadRequest {
            event_id: "e1".into(),
            guest_name: "  Ana  ".into(),
            message: Some("   ".into()),
            files,
        }
    }

    fn field_of(err: GalleryError) -> String {
        match err {
            GalleryError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_accepts_valid_request() {
        let accepted = policy()
            .validate(&request(vec![IncomingFile::new(
                "C:\\photos\\IMG_1.JPG",
                "image/jpeg",
                &b"jpeg"[..],
            )]))
            .unwrap();
        assert_eq!(accepted.guest_name, "Ana");
        assert_eq!(accepted.message, None);
        assert_eq!(accepted.files[0].extension, "jpg");
        assert_eq!(accepted.files[0].filename, "IMG_1.JPG");
    }

    #[test]
    fn test_rejects_blank_guest_name() {
        let mut req = request(vec![IncomingFile::new("a.jpg", "image/jpeg", &b"x"[..])]);
        req.guest_name = "   ".into();
        assert_eq!(field_of(policy().validate(&req).unwrap_err()), "guestName");
    }

    #[test]
    fn test_rejects_long_guest_name_and_message() {
        let mut req = request(vec![IncomingFile::new("a.jpg", "image/jpeg", &b"x"[..])]);
        req.guest_name = "Bartholomew".into();
        assert_eq!(field_of(policy().validate(&req).unwrap_err()), "guestName");

        req.guest_name = "Bart".into();
        req.message = Some("congratulations!".into());
        assert_eq!(field_of(policy().validate(&req).unwrap_err()), "message");
    }

    #[test]
    fn test_rejects_file_count() {
        assert_eq!(field_of(policy().validate(&request(vec![])).unwrap_err()), "files");
        let files = (0..4)
            .map(|i| IncomingFile::new(format!("{i}.jpg"), "image/jpeg", &b"x"[..]))
            .collect();
        assert_eq!(field_of(policy().validate(&request(files)).unwrap_err()), "files");
    }

    #[test]
    fn test_rejects_oversized_and_empty_files() {
        let req = request(vec![
            IncomingFile::new("a.jpg", "image/jpeg", &b"x"[..]),
            IncomingFile::new("b.jpg", "image/jpeg", vec![0u8; 11]),
        ]);
        assert_eq!(field_of(policy().validate(&req).unwrap_err()), "files[1]");

        let req = request(vec![IncomingFile::new("a.jpg", "image/jpeg", Vec::new())]);
        assert_eq!(field_of(policy().validate(&req).unwrap_err()), "files[0]");
    }

    #[test]
    fn test_rejects_executable() {
        let req = request(vec![IncomingFile::new(
            "setup.exe",
            "application/octet-stream",
            &b"MZ"[..],
        )]);
        let err = policy().validate(&req).unwrap_err();
        assert!(err.to_string().contains(".exe"));
    }

    #[test]
    fn test_rejects_type_extension_mismatch() {
        let req = request(vec![IncomingFile::new("clip.png", "video/mp4", &b"x"[..])]);
        let err = policy().validate(&req).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_media_type_parameters_ignored() {
        let req = request(vec![IncomingFile::new(
            "a.png",
            "Image/PNG; charset=binary",
            &b"x"[..],
        )]);
        let accepted = policy().validate(&req).unwrap();
        assert_eq!(accepted.files[0].media_type, "image/png");
    }
}
