//! S3 Credentials
//!
//! Resolves the credentials the S3 blob store signs requests with.
//!
//! - Static credentials from configuration win when both keys are set
//! - Otherwise the AWS default provider chain is used (environment, profile,
//!   instance metadata)

use crate::config::S3Config;
use thiserror::Error;

/// Credential loading errors
#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),
}

/// Static access key pair
#[derive(Clone)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Convert into the SDK's credential type. Static keys never carry a
    /// session token.
    pub fn into_sdk(self) -> aws_credential_types::Credentials {
        aws_credential_types::Credentials::new(
            self.access_key_id,
            self.secret_access_key,
            None,
            None,
            "galleria-config",
        )
    }
}

/// Credential resolution
pub struct CredentialsProvider;

impl CredentialsProvider {
    /// Static credentials from `config`, or `None` to defer to the default chain.
    ///
    /// Setting only one of the two keys is an error.
    pub fn from_config(config: &S3Config) -> Result<Option<Credentials>, CredentialsError> {
        match (&config.access_key, &config.secret_key) {
            (Some(access), Some(secret)) => Ok(Some(Credentials::new(access, secret))),
            (None, None) => Ok(None),
            (None, Some(_)) => Err(CredentialsError::MissingCredentials(
                "access_key not set in config".into(),
            )),
            (Some(_), None) => Err(CredentialsError::MissingCredentials(
                "secret_key not set in config".into(),
            )),
        }
    }
}
