//! Configuration module for Galleria
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let full_match = cap.get(0).unwrap();
        let var_name = cap.get(1).unwrap().as_str();

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid server address '{}'",
                self.server.address
            )));
        }

        match self.storage.backend {
            StorageBackend::S3 => {
                let s3 = self.storage.s3.as_ref().ok_or_else(|| {
                    ConfigError::ValidationError(
                        "storage.backend is 's3' but storage.s3 is missing".into(),
                    )
                })?;
                if s3.bucket.trim().is_empty() {
                    return Err(ConfigError::ValidationError(
                        "storage.s3.bucket cannot be empty".into(),
                    ));
                }
                if let Some(endpoint) = &s3.endpoint {
                    if !is_valid_http_url(endpoint) {
                        return Err(ConfigError::ValidationError(
                            "Invalid S3 endpoint: must start with http:// or https://".into(),
                        ));
                    }
                }
                if s3.access_key.is_some() != s3.secret_key.is_some() {
                    return Err(ConfigError::ValidationError(
                        "storage.s3.access_key and storage.s3.secret_key must be set together"
                            .into(),
                    ));
                }
            }
            StorageBackend::Fs | StorageBackend::Memory => {}
        }

        if !is_valid_http_url(&self.storage.public_base_url) {
            return Err(ConfigError::ValidationError(
                "storage.public_base_url must start with http:// or https://".into(),
            ));
        }

        if self.storage.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "storage.timeout_secs must be greater than zero".into(),
            ));
        }

        if self.metadata.max_update_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "metadata.max_update_attempts must be at least 1".into(),
            ));
        }

        self.upload.validate()?;

        if self.archive.fetch_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "archive.fetch_timeout_secs must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    /// Upper bound for a whole request body, multipart uploads included
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_body_bytes() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

/// Blob storage backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Fs,
    S3,
    Memory,
}

/// Blob storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Base URL blob URLs are built from. For `fs` and `memory` this should
    /// point at this server's `/media` route.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Timeout applied to every individual put/delete/get attempt
    #[serde(default = "default_storage_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub fs: FsConfig,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            public_base_url: default_public_base_url(),
            timeout_secs: default_storage_timeout(),
            fs: FsConfig::default(),
            s3: None,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_public_base_url() -> String {
    "http://localhost:3000/media".to_string()
}

fn default_storage_timeout() -> u64 {
    30
}

/// Local filesystem blob configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    #[serde(default = "default_fs_root")]
    pub root: PathBuf,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            root: default_fs_root(),
        }
    }
}

fn default_fs_root() -> PathBuf {
    PathBuf::from("./data/media")
}

/// S3 backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Required by most S3-compatible servers (MinIO, RustFS)
    #[serde(default)]
    pub force_path_style: bool,
    /// When set, blob URLs point here instead of the storage endpoint
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Metadata store backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataBackend {
    #[default]
    JsonFile,
    Memory,
}

/// Metadata store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub backend: MetadataBackend,
    #[serde(default = "default_metadata_path")]
    pub path: PathBuf,
    /// Compare-and-swap attempts before an update reports a conflict
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: MetadataBackend::default(),
            path: default_metadata_path(),
            max_update_attempts: default_max_update_attempts(),
        }
    }
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("./data/events.json")
}

fn default_max_update_attempts() -> u32 {
    8
}

/// One allow-listed file kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedType {
    pub extension: String,
    pub media_type: String,
}

impl AllowedType {
    fn new(extension: &str, media_type: &str) -> Self {
        Self {
            extension: extension.to_string(),
            media_type: media_type.to_string(),
        }
    }
}

/// Upload limits and allow-list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    #[serde(default = "default_max_guest_name_len")]
    pub max_guest_name_len: usize,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    /// Number of blob writes in flight per transaction
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<AllowedType>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_size: default_max_file_size(),
            max_guest_name_len: default_max_guest_name_len(),
            max_message_len: default_max_message_len(),
            concurrency: default_concurrency(),
            allowed_types: default_allowed_types(),
        }
    }
}

impl UploadConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_files == 0 {
            return Err(ConfigError::ValidationError(
                "upload.max_files must be at least 1".into(),
            ));
        }
        if self.max_file_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload.max_file_size must be greater than zero".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "upload.concurrency must be at least 1".into(),
            ));
        }
        if self.allowed_types.is_empty() {
            return Err(ConfigError::ValidationError(
                "upload.allowed_types cannot be empty".into(),
            ));
        }
        for allowed in &self.allowed_types {
            if allowed.extension.is_empty() || allowed.extension.starts_with('.') {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid allowed extension '{}': must be non-empty and without a leading dot",
                    allowed.extension
                )));
            }
            if !allowed.media_type.contains('/') {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid allowed media type '{}'",
                    allowed.media_type
                )));
            }
        }
        Ok(())
    }
}

fn default_max_files() -> usize {
    20
}

fn default_max_file_size() -> usize {
    52428800 // 50MB
}

fn default_max_guest_name_len() -> usize {
    100
}

fn default_max_message_len() -> usize {
    500
}

fn default_concurrency() -> usize {
    4
}

fn default_allowed_types() -> Vec<AllowedType> {
    vec![
        AllowedType::new("jpg", "image/jpeg"),
        AllowedType::new("jpeg", "image/jpeg"),
        AllowedType::new("png", "image/png"),
        AllowedType::new("gif", "image/gif"),
        AllowedType::new("webp", "image/webp"),
        AllowedType::new("heic", "image/heic"),
        AllowedType::new("heif", "image/heif"),
        AllowedType::new("mp4", "video/mp4"),
        AllowedType::new("mov", "video/quicktime"),
        AllowedType::new("webm", "video/webm"),
    ]
}

/// Compression used for archive entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveCompression {
    #[default]
    Deflate,
    Stored,
}

/// Gallery archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default)]
    pub compression: ArchiveCompression,
    /// Size of the in-process pipe between the zip writer and the response
    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            compression: ArchiveCompression::default(),
            pipe_buffer_size: default_pipe_buffer_size(),
        }
    }
}

impl ArchiveConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn default_fetch_timeout() -> u64 {
    60
}

fn default_pipe_buffer_size() -> usize {
    262144 // 256KB
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; RUST_LOG takes precedence when set
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.max_files, 20);
        assert_eq!(config.storage.backend, StorageBackend::Fs);
        assert_eq!(config.metadata.backend, MetadataBackend::JsonFile);
    }

    #[test]
    fn test_s3_backend_requires_s3_section() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::S3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_s3_credentials_must_be_paired() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::S3;
        config.storage.s3 = Some(S3Config {
            bucket: "photos".into(),
            region: "us-east-1".into(),
            endpoint: None,
            access_key: Some("key".into()),
            secret_key: None,
            force_path_style: false,
            public_base_url: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allowed_extension_with_dot_rejected() {
        let mut config = Config::default();
        config.upload.allowed_types = vec![AllowedType::new(".png", "image/png")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.upload.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        std::env::remove_var("GALLERIA_TEST_MISSING");
        assert_eq!(
            expand_env_vars("bucket: ${GALLERIA_TEST_MISSING:-photos}"),
            "bucket: photos"
        );
        assert_eq!(
            expand_env_vars("bucket: ${GALLERIA_TEST_MISSING}"),
            "bucket: ${GALLERIA_TEST_MISSING}"
        );
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = r#"
server:
  address: "127.0.0.1:8080"
storage:
  backend: memory
  public_base_url: "http://127.0.0.1:8080/media"
metadata:
  backend: memory
archive:
  compression: stored
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.archive.compression, ArchiveCompression::Stored);
        assert_eq!(config.upload.allowed_types.len(), 10);
    }
}
