//! Configuration types for transfer runs
//!
//! `TransferConfig` describes one pipeline run (mode, concurrency, targets)
//! and is built through a validating builder. `CloudConfig` and
//! `PlatformConfig` capture the environment-sourced settings; both fail fast
//! on missing or malformed values so a misconfigured run dies before any
//! transfer starts.

use crate::error::{Result, TransferError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of simultaneously in-flight transfers.
pub const DEFAULT_CONCURRENCY: usize = 50;

/// Default object-key prefix inside the bucket.
pub const DEFAULT_OBJECT_PREFIX: &str = "fathomnet/";

/// Default per-request timeout for remote fetches and uploads.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Environment variable naming the dataset-platform endpoint.
pub const ENV_PLATFORM_URI: &str = "DATASET_PLATFORM_URI";
/// Environment variable naming the dataset-platform API key.
pub const ENV_PLATFORM_API_KEY: &str = "DATASET_PLATFORM_API_KEY";
/// Environment variable naming the cloud project.
pub const ENV_CLOUD_PROJECT: &str = "GOOGLE_CLOUD_PROJECT";
/// Environment variable pointing at a service-account credential file.
pub const ENV_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
/// Environment variable carrying a ready-made OAuth access token.
pub const ENV_OAUTH_ACCESS_TOKEN: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Which of the two mutually exclusive delivery paths a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Fetch, crop each annotation box, save locally, append to `labels.csv`.
    CropAnnotations,
    /// Fetch and stream the original bytes to an object-store key.
    StreamToBucket,
}

impl Default for TransferMode {
    fn default() -> Self {
        Self::CropAnnotations
    }
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CropAnnotations => write!(f, "crop"),
            Self::StreamToBucket => write!(f, "upload"),
        }
    }
}

/// Configuration for one transfer run.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Delivery mode, fixed for the whole run.
    pub mode: TransferMode,

    /// Maximum simultaneously in-flight transfers.
    pub concurrency: usize,

    /// Optional cap on the number of items processed.
    pub limit: Option<usize>,

    /// Crop-mode output directory.
    pub output_dir: Option<PathBuf>,

    /// Upload-mode bucket name.
    pub bucket: Option<String>,

    /// Base object-key prefix inside the bucket.
    pub object_prefix: String,

    /// Dataset split tag (shapes object keys and platform sample tags).
    pub split: String,

    /// Per-request timeout for remote I/O.
    pub request_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mode: TransferMode::default(),
            concurrency: DEFAULT_CONCURRENCY,
            limit: None,
            output_dir: None,
            bucket: None,
            object_prefix: DEFAULT_OBJECT_PREFIX.to_string(),
            split: "train".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl TransferConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::default()
    }

    /// Full object prefix for this run, e.g. `fathomnet/train_images/`.
    #[must_use]
    pub fn split_prefix(&self) -> String {
        format!("{}{}_images/", self.object_prefix, self.split)
    }
}

/// Builder for [`TransferConfig`] with build-time validation.
#[derive(Debug, Default)]
pub struct TransferConfigBuilder {
    config: TransferConfig,
}

impl TransferConfigBuilder {
    /// Set the delivery mode.
    #[must_use]
    pub fn mode(mut self, mode: TransferMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the concurrency budget.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Cap the number of processed items.
    #[must_use]
    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.config.limit = limit;
        self
    }

    /// Set the crop-mode output directory.
    #[must_use]
    pub fn output_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    /// Set the upload-mode bucket.
    #[must_use]
    pub fn bucket<S: Into<String>>(mut self, bucket: S) -> Self {
        self.config.bucket = Some(bucket.into());
        self
    }

    /// Set the base object prefix (a trailing `/` is added when missing).
    #[must_use]
    pub fn object_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.config.object_prefix = prefix;
        self
    }

    /// Set the split tag.
    #[must_use]
    pub fn split<S: Into<String>>(mut self, split: S) -> Self {
        self.config.split = split.into();
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Validate and produce the configuration.
    ///
    /// # Errors
    /// - Zero concurrency
    /// - Empty split tag
    /// - Crop mode without an output directory
    /// - Upload mode without a bucket
    pub fn build(self) -> Result<TransferConfig> {
        let config = self.config;
        if config.concurrency == 0 {
            return Err(TransferError::invalid_config(
                "concurrency must be at least 1",
            ));
        }
        if config.split.is_empty() {
            return Err(TransferError::invalid_config("split tag cannot be empty"));
        }
        match config.mode {
            TransferMode::CropAnnotations if config.output_dir.is_none() => {
                return Err(TransferError::invalid_config(
                    "crop mode requires an output directory",
                ));
            },
            TransferMode::StreamToBucket
                if config.bucket.as_deref().map_or(true, str::is_empty) =>
            {
                return Err(TransferError::invalid_config(
                    "upload mode requires a bucket name",
                ));
            },
            _ => {},
        }
        Ok(config)
    }
}

/// Minimal view of a service-account key file. Only the fields the tool
/// actually reads; everything else is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub client_email: Option<String>,
}

/// Cloud-side settings resolved from the environment.
#[derive(Debug, Clone, Default)]
pub struct CloudConfig {
    /// Cloud project id (`GOOGLE_CLOUD_PROJECT`, else the credential file's).
    pub project_id: Option<String>,
    /// Service-account credential file, when one was found.
    pub credentials_path: Option<PathBuf>,
    /// Service account the credential file names, for diagnostics.
    pub service_account: Option<String>,
    /// Ready-made OAuth access token from the environment.
    pub access_token: Option<String>,
}

impl CloudConfig {
    /// Resolve cloud settings from the environment.
    ///
    /// `GOOGLE_APPLICATION_CREDENTIALS`, when set, must point at a readable
    /// service-account JSON file; a dangling path is a configuration error,
    /// not something to discover mid-run. When unset, the gcloud
    /// application-default credentials file is picked up if present.
    ///
    /// # Errors
    /// - Explicit credential path does not exist or is not valid JSON
    pub fn from_env() -> Result<Self> {
        let access_token = std::env::var(ENV_OAUTH_ACCESS_TOKEN)
            .ok()
            .filter(|token| !token.is_empty());

        let explicit = std::env::var(ENV_APPLICATION_CREDENTIALS)
            .ok()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let (credentials_path, key) = match explicit {
            Some(path) => {
                let key = Self::read_key_file(&path)?;
                (Some(path), Some(key))
            },
            None => match Self::default_credentials_path() {
                Some(path) if path.exists() => {
                    // The ADC file is informational here; a malformed one
                    // must not kill runs that never touch the bucket.
                    let key = Self::read_key_file(&path).ok();
                    (Some(path), key)
                },
                _ => (None, None),
            },
        };

        let project_id = std::env::var(ENV_CLOUD_PROJECT)
            .ok()
            .filter(|project| !project.is_empty())
            .or_else(|| key.as_ref().and_then(|k| k.project_id.clone()));

        Ok(Self {
            project_id,
            credentials_path,
            service_account: key.and_then(|k| k.client_email),
            access_token,
        })
    }

    /// Location of gcloud's application-default credentials.
    #[must_use]
    pub fn default_credentials_path() -> Option<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("gcloud").join("application_default_credentials.json"))
    }

    fn read_key_file(path: &Path) -> Result<ServiceAccountKey> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            TransferError::invalid_config(format!(
                "credential file {} is not readable: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            TransferError::invalid_config(format!(
                "credential file {} is not valid JSON: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Dataset-platform settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Base endpoint URI.
    pub endpoint: String,
    /// API key sent with every request.
    pub api_key: String,
}

impl PlatformConfig {
    /// Resolve platform settings from the environment.
    ///
    /// # Errors
    /// - Either `DATASET_PLATFORM_URI` or `DATASET_PLATFORM_API_KEY` is
    ///   missing or empty
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var(ENV_PLATFORM_URI)
            .ok()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| {
                TransferError::invalid_config(format!("{} is not set", ENV_PLATFORM_URI))
            })?;
        let api_key = std::env::var(ENV_PLATFORM_API_KEY)
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                TransferError::invalid_config(format!("{} is not set", ENV_PLATFORM_API_KEY))
            })?;
        Ok(Self { endpoint, api_key })
    }
}
