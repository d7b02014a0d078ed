//! Google Cloud Storage access
//!
//! Drives the GCS JSON/upload API directly over the crate's HTTP client —
//! bucket metadata, prefix listing, media upload. Bearer tokens come from
//! the environment or, on GCE, the instance metadata server; there is no
//! vendor SDK underneath.

use crate::config::{CloudConfig, ENV_OAUTH_ACCESS_TOKEN};
use crate::error::{Result, TransferError};
use crate::fetch::FetchedAsset;
use crate::pipeline::{DeliveredItem, TransferSink, TransferTask};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const STORAGE_UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the access token came from, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable.
    Environment,
    /// GCE instance metadata server.
    MetadataServer,
}

impl std::fmt::Display for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Environment => write!(f, "environment ({})", ENV_OAUTH_ACCESS_TOKEN),
            Self::MetadataServer => write!(f, "GCE metadata server"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectMeta>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
}

/// Authenticated GCS client.
pub struct GcsClient {
    http: Client,
    token: String,
    token_source: TokenSource,
}

impl GcsClient {
    /// Resolve a token and build a client.
    ///
    /// Token resolution order: environment token, then the metadata server.
    /// Failing both is a configuration error — upload runs must die here,
    /// before any fetch starts.
    ///
    /// # Errors
    /// - No token source is available
    /// - HTTP client construction fails
    pub async fn connect(cloud: &CloudConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::network_error("Failed to create HTTP client", e))?;

        if let Some(token) = &cloud.access_token {
            log::debug!("using access token from the environment");
            return Ok(Self {
                http,
                token: token.clone(),
                token_source: TokenSource::Environment,
            });
        }

        match Self::metadata_token(&http).await {
            Ok(token) => {
                log::debug!("using access token from the metadata server");
                Ok(Self {
                    http,
                    token,
                    token_source: TokenSource::MetadataServer,
                })
            },
            Err(e) => Err(TransferError::invalid_config(format!(
                "no cloud access token: {} is unset and the metadata server is unreachable ({})",
                ENV_OAUTH_ACCESS_TOKEN, e
            ))),
        }
    }

    async fn metadata_token(http: &Client) -> Result<String> {
        let response = http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| TransferError::network_error("metadata server request failed", e))?;
        if !response.status().is_success() {
            return Err(TransferError::network_message(format!(
                "metadata server returned {}",
                response.status()
            )));
        }
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| TransferError::network_error("metadata token is malformed", e))?;
        Ok(token.access_token)
    }

    /// Which source produced this client's token.
    #[must_use]
    pub fn token_source(&self) -> TokenSource {
        self.token_source
    }

    /// Whether `bucket` exists and is visible to this token.
    ///
    /// # Errors
    /// - Request fails or the API answers with an unexpected status
    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let url = format!("{}/b/{}", STORAGE_API, bucket);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| TransferError::network_error(format!("bucket lookup for {}", bucket), e))?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(TransferError::storage_error(format!(
                "bucket lookup for {} returned HTTP {}",
                bucket, status
            ))),
        }
    }

    /// Names of all objects under `prefix`, following pagination.
    ///
    /// One listing up front replaces a per-object existence round-trip for
    /// every task.
    ///
    /// # Errors
    /// - Request fails or the API answers with a non-success status
    pub async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<HashSet<String>> {
        let url = format!("{}/b/{}/o", STORAGE_API, bucket);
        let mut names = HashSet::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[("prefix", prefix), ("fields", "items/name,nextPageToken")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await.map_err(|e| {
                TransferError::network_error(format!("listing gs://{}/{}", bucket, prefix), e)
            })?;
            if !response.status().is_success() {
                return Err(TransferError::storage_error(format!(
                    "listing gs://{}/{} returned HTTP {}",
                    bucket,
                    prefix,
                    response.status()
                )));
            }

            let page: ObjectList = response.json().await.map_err(|e| {
                TransferError::network_error("object listing is malformed", e)
            })?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(names)
    }

    /// Whether a single object exists.
    ///
    /// # Errors
    /// - Request fails or the API answers with a non-success status
    pub async fn object_exists(&self, bucket: &str, name: &str) -> Result<bool> {
        let names = self.list_prefix(bucket, name).await?;
        Ok(names.contains(name))
    }

    /// Upload `bytes` as `gs://bucket/name` with the given content type.
    ///
    /// # Errors
    /// - Request fails or the API rejects the upload
    pub async fn upload(
        &self,
        bucket: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let url = format!("{}/b/{}/o", STORAGE_UPLOAD_API, bucket);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .query(&[("uploadType", "media"), ("name", name)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                TransferError::network_error(format!("uploading gs://{}/{}", bucket, name), e)
            })?;

        if !response.status().is_success() {
            return Err(TransferError::storage_error(format!(
                "uploading gs://{}/{} returned HTTP {}",
                bucket,
                name,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Result of a credential diagnostic pass.
#[derive(Debug)]
pub struct AuthReport {
    pub token_source: Option<TokenSource>,
    pub project_id: Option<String>,
    pub credentials_path: Option<String>,
    pub service_account: Option<String>,
    pub bucket: Option<String>,
    pub bucket_accessible: Option<bool>,
    pub failure: Option<String>,
}

impl AuthReport {
    /// Whether the diagnostics found a usable token.
    #[must_use]
    pub fn authenticated(&self) -> bool {
        self.token_source.is_some()
    }
}

impl std::fmt::Display for AuthReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.credentials_path {
            Some(path) => writeln!(f, "Credentials file: {}", path)?,
            None => writeln!(f, "Credentials file: none (using default/user auth)")?,
        }
        if let Some(account) = &self.service_account {
            writeln!(f, "Service account: {}", account)?;
        }
        match &self.token_source {
            Some(source) => writeln!(f, "Access token: OK ({})", source)?,
            None => writeln!(
                f,
                "Access token: FAILED{}",
                self.failure
                    .as_deref()
                    .map(|reason| format!(" — {}", reason))
                    .unwrap_or_default()
            )?,
        }
        match &self.project_id {
            Some(project) => writeln!(f, "Project: {}", project)?,
            None => writeln!(f, "Project: not configured")?,
        }
        if let Some(bucket) = &self.bucket {
            match self.bucket_accessible {
                Some(true) => writeln!(f, "Bucket gs://{}: accessible", bucket)?,
                Some(false) => writeln!(f, "Bucket gs://{}: NOT FOUND", bucket)?,
                None => writeln!(f, "Bucket gs://{}: not checked", bucket)?,
            }
        }
        Ok(())
    }
}

/// Run credential diagnostics: resolve a token and, when a bucket is named,
/// verify it is reachable. Never errors — problems land in the report.
pub async fn verify_access(
    cloud: &CloudConfig,
    bucket: Option<&str>,
    timeout: Duration,
) -> AuthReport {
    let mut report = AuthReport {
        token_source: None,
        project_id: cloud.project_id.clone(),
        credentials_path: cloud
            .credentials_path
            .as_ref()
            .map(|path| path.display().to_string()),
        service_account: cloud.service_account.clone(),
        bucket: bucket.map(str::to_string),
        bucket_accessible: None,
        failure: None,
    };

    let client = match GcsClient::connect(cloud, timeout).await {
        Ok(client) => client,
        Err(e) => {
            report.failure = Some(e.to_string());
            return report;
        },
    };
    report.token_source = Some(client.token_source());

    if let Some(bucket) = bucket {
        match client.bucket_exists(bucket).await {
            Ok(accessible) => report.bucket_accessible = Some(accessible),
            Err(e) => {
                report.bucket_accessible = Some(false);
                report.failure = Some(e.to_string());
            },
        }
    }

    report
}

/// Sink that streams original bytes to bucket keys.
pub struct GcsSink {
    client: Arc<GcsClient>,
    bucket: String,
    existing: HashSet<String>,
}

impl GcsSink {
    /// Open the sink, pre-listing objects under `prefix` as the skip set.
    ///
    /// # Errors
    /// - Prefix listing fails
    pub async fn open(client: Arc<GcsClient>, bucket: &str, prefix: &str) -> Result<Self> {
        let existing = client.list_prefix(bucket, prefix).await?;
        log::info!(
            "found {} existing object(s) under gs://{}/{}",
            existing.len(),
            bucket,
            prefix
        );
        Ok(Self {
            client,
            bucket: bucket.to_string(),
            existing,
        })
    }

    /// Number of objects the skip set holds.
    #[must_use]
    pub fn existing_objects(&self) -> usize {
        self.existing.len()
    }
}

#[async_trait]
impl TransferSink for GcsSink {
    async fn is_delivered(&self, task: &TransferTask) -> Result<bool> {
        Ok(self.existing.contains(&task.target))
    }

    async fn deliver(&self, task: &TransferTask, asset: FetchedAsset) -> Result<DeliveredItem> {
        let content_type = asset.content_type_or_default().to_string();
        self.client
            .upload(&self.bucket, &task.target, asset.bytes, &content_type)
            .await?;
        Ok(DeliveredItem {
            location: format!("gs://{}/{}", self.bucket, task.target),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_list_deserializes_pagination() {
        let page: ObjectList = serde_json::from_str(
            r#"{"items": [{"name": "fathomnet/train_images/a.png"}], "nextPageToken": "tok"}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("tok"));

        let empty: ObjectList = serde_json::from_str("{}").unwrap();
        assert!(empty.items.is_empty());
        assert!(empty.next_page_token.is_none());
    }

    #[test]
    fn test_metadata_token_deserializes() {
        let token: MetadataToken = serde_json::from_str(
            r#"{"access_token": "ya29.token", "expires_in": 3599, "token_type": "Bearer"}"#,
        )
        .unwrap();
        assert_eq!(token.access_token, "ya29.token");
    }

    #[test]
    fn test_token_source_display() {
        assert!(TokenSource::Environment.to_string().contains(ENV_OAUTH_ACCESS_TOKEN));
        assert!(TokenSource::MetadataServer.to_string().contains("metadata"));
    }

    #[test]
    fn test_auth_report_rendering() {
        let report = AuthReport {
            token_source: Some(TokenSource::Environment),
            project_id: Some("reef-1".to_string()),
            credentials_path: None,
            service_account: None,
            bucket: Some("voxel51-test".to_string()),
            bucket_accessible: Some(true),
            failure: None,
        };
        let rendered = report.to_string();
        assert!(rendered.contains("Access token: OK"));
        assert!(rendered.contains("gs://voxel51-test: accessible"));
        assert!(report.authenticated());
    }

    #[test]
    fn test_auth_report_failure_rendering() {
        let report = AuthReport {
            token_source: None,
            project_id: None,
            credentials_path: None,
            service_account: None,
            bucket: None,
            bucket_accessible: None,
            failure: Some("no cloud access token".to_string()),
        };
        let rendered = report.to_string();
        assert!(rendered.contains("FAILED"));
        assert!(rendered.contains("no cloud access token"));
        assert!(!report.authenticated());
    }
}
