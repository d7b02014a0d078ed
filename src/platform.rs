//! Hosted dataset-platform client
//!
//! The curation platform is an external collaborator behind one
//! request/response exchange: submit a dataset manifest, receive a handle.
//! Samples point at the uploaded `gs://` objects; only metadata crosses this
//! boundary, the images stay in the bucket.

use crate::coco::CocoManifest;
use crate::config::PlatformConfig;
use crate::error::{Result, TransferError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_KEY_HEADER: &str = "X-API-Key";
const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// One detection on a sample, with the box in relative coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub label: String,
    /// `[x, y, w, h]`, each in `0.0..=1.0` of the image dimensions.
    pub bounding_box: [f64; 4],
    pub annotation_id: u64,
}

/// One sample: a pointer into the bucket plus its ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSample {
    pub filepath: String,
    pub split: String,
    pub image_id: u64,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_captured: Option<String>,
    pub detections: Vec<Detection>,
}

/// Dataset registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRequest {
    pub name: String,
    pub persistent: bool,
    pub overwrite: bool,
    pub samples: Vec<DatasetSample>,
}

/// Handle the platform returns for a registered dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub id: String,
    pub name: String,
    pub sample_count: usize,
}

/// Build a registration request from a manifest whose images live under
/// `gs://<bucket>/<prefix>`.
///
/// Mirrors the transfer side: one sample per image (honoring `limit`),
/// detections converted from COCO pixel boxes to relative coordinates,
/// category ids resolved to names with an `unknown` fallback.
#[must_use]
pub fn build_dataset_request(
    manifest: &CocoManifest,
    name: &str,
    bucket: &str,
    prefix: &str,
    split: &str,
    limit: Option<usize>,
    overwrite: bool,
) -> DatasetRequest {
    let categories = manifest.category_names();
    let annotations = manifest.annotations_by_image();

    let samples = manifest
        .images
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|image| {
            let detections = annotations
                .get(&image.id)
                .map(|anns| {
                    anns.iter()
                        .map(|ann| Detection {
                            label: categories
                                .get(&ann.category_id)
                                .map_or("unknown", |label| *label)
                                .to_string(),
                            bounding_box: ann.bbox.to_relative(image.width, image.height),
                            annotation_id: ann.id,
                        })
                        .collect()
                })
                .unwrap_or_default();

            DatasetSample {
                filepath: format!("gs://{}/{}{}", bucket, prefix, image.safe_file_name()),
                split: split.to_string(),
                image_id: image.id,
                width: image.width,
                height: image.height,
                date_captured: image.date_captured.clone(),
                detections,
            }
        })
        .collect();

    DatasetRequest {
        name: name.to_string(),
        persistent: true,
        overwrite,
        samples,
    }
}

/// Client for the dataset platform's registration endpoint.
pub struct PlatformClient {
    http: Client,
    endpoint: String,
    api_key: String,
    run_id: Option<String>,
}

impl PlatformClient {
    /// Create a client from resolved platform settings.
    ///
    /// # Errors
    /// - HTTP client construction fails
    pub fn new(config: &PlatformConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::network_error("Failed to create HTTP client", e))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            run_id: None,
        })
    }

    /// Attach a run id, sent as a request header for correlation.
    #[must_use]
    pub fn with_run_id<S: Into<String>>(mut self, run_id: S) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Register a dataset and return its handle.
    ///
    /// # Errors
    /// - Request fails
    /// - The platform rejects the registration (a 409 means the name is
    ///   taken and `overwrite` was false)
    pub async fn create_dataset(&self, request: &DatasetRequest) -> Result<DatasetHandle> {
        let url = format!("{}/datasets", self.endpoint);
        log::info!(
            "registering dataset '{}' ({} samples) at {}",
            request.name,
            request.samples.len(),
            url
        );

        let mut builder = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request);
        if let Some(run_id) = &self.run_id {
            builder = builder.header(REQUEST_ID_HEADER, run_id);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransferError::network_error("dataset registration failed", e))?;

        let status = response.status();
        if status.as_u16() == 409 {
            return Err(TransferError::platform_error(format!(
                "dataset '{}' already exists on the platform; enable overwrite to replace it",
                request.name
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::platform_error(format!(
                "registration returned HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let handle: DatasetHandle = response
            .json()
            .await
            .map_err(|e| TransferError::network_error("registration response is malformed", e))?;
        log::info!(
            "dataset '{}' registered as {} with {} sample(s)",
            handle.name,
            handle.id,
            handle.sample_count
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> CocoManifest {
        CocoManifest::parse(
            r#"{
                "images": [
                    {"id": 1, "file_name": "a.png", "coco_url": "https://h/a.png", "width": 640, "height": 480, "date_captured": "2019-06-01 12:00:00"},
                    {"id": 2, "file_name": "b.png", "coco_url": "https://h/b.png", "width": 320, "height": 240}
                ],
                "annotations": [
                    {"id": 10, "image_id": 1, "category_id": 7, "bbox": [64.0, 48.0, 320.0, 240.0]},
                    {"id": 11, "image_id": 1, "category_id": 99, "bbox": [0.0, 0.0, 64.0, 48.0]}
                ],
                "categories": [{"id": 7, "name": "Sebastes"}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_build_request_samples_and_detections() {
        let request = build_dataset_request(
            &manifest(),
            "fathomnet-2025",
            "voxel51-test",
            "fathomnet/train_images/",
            "train",
            None,
            false,
        );

        assert_eq!(request.name, "fathomnet-2025");
        assert!(request.persistent);
        assert_eq!(request.samples.len(), 2);

        let first = &request.samples[0];
        assert_eq!(
            first.filepath,
            "gs://voxel51-test/fathomnet/train_images/a.png"
        );
        assert_eq!(first.split, "train");
        assert_eq!(first.detections.len(), 2);
        assert_eq!(first.detections[0].label, "Sebastes");
        assert_eq!(first.detections[0].bounding_box, [0.1, 0.1, 0.5, 0.5]);
        // Unmapped category falls back.
        assert_eq!(first.detections[1].label, "unknown");

        // Image without annotations still becomes a sample.
        assert!(request.samples[1].detections.is_empty());
    }

    #[test]
    fn test_build_request_honors_limit() {
        let request = build_dataset_request(
            &manifest(),
            "d",
            "b",
            "p/",
            "train",
            Some(1),
            false,
        );
        assert_eq!(request.samples.len(), 1);
    }

    #[test]
    fn test_request_serialization_shape() {
        let request = build_dataset_request(
            &manifest(),
            "d",
            "b",
            "p/",
            "test",
            Some(1),
            true,
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["overwrite"], true);
        assert_eq!(json["samples"][0]["split"], "test");
        assert!(json["samples"][0]["date_captured"].is_string());
        // Absent capture dates are omitted, not null.
        let request2 = build_dataset_request(&manifest(), "d", "b", "p/", "t", None, false);
        let json2 = serde_json::to_value(&request2).unwrap();
        assert!(json2["samples"][1].get("date_captured").is_none());
    }

    #[test]
    fn test_handle_deserializes() {
        let handle: DatasetHandle = serde_json::from_str(
            r#"{"id": "ds_01", "name": "fathomnet-2025", "sample_count": 2}"#,
        )
        .unwrap();
        assert_eq!(handle.id, "ds_01");
        assert_eq!(handle.sample_count, 2);
    }
}
