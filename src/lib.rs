#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # FathomNet Transfer
//!
//! Bounded concurrent transfer of COCO-format image datasets. Reads a COCO
//! manifest, fetches the referenced images over HTTP with at most K
//! transfers in flight, and delivers the bytes to one of two destinations
//! chosen at startup:
//!
//! - **Crop mode** (default): decode, crop each annotation's bounding box,
//!   save the crop locally, and append a `(path, label)` row to
//!   `labels.csv`.
//! - **Upload mode**: stream the original bytes to keys in a Google Cloud
//!   Storage bucket, skipping objects that already exist.
//!
//! After an upload run the dataset can be registered with a hosted curation
//! platform; only metadata crosses that boundary, the images stay in the
//! bucket.
//!
//! Failures are per-task: a bad fetch or decode is logged, counted, and the
//! batch keeps going. Missing startup configuration fails before any
//! transfer begins.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use fathomnet_transfer::{transfer_from_path, TransferConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = TransferConfig::builder()
//!     .output_dir("crops/")
//!     .concurrency(16)
//!     .build()?;
//! let summary = transfer_from_path("data/dataset_train.json", &config).await?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `cli` (default): the `downloader` command-line interface, progress
//!   bars, and tracing subscriber setup
//! - `tracing-json`: JSON log output for the CLI

#[cfg(feature = "cli")]
pub mod cli;
pub mod coco;
pub mod config;
pub mod error;
pub mod export;
pub mod fetch;
pub mod gcs;
pub mod pipeline;
pub mod platform;
#[cfg(feature = "cli")]
pub mod tracing_config;

use std::path::Path;
use std::sync::Arc;

// Public API exports
pub use coco::{BBox, CocoAnnotation, CocoCategory, CocoImage, CocoManifest, PixelBox};
pub use config::{
    CloudConfig, PlatformConfig, TransferConfig, TransferConfigBuilder, TransferMode,
    DEFAULT_CONCURRENCY,
};
pub use error::{Result, TransferError};
pub use export::{crop_image, CropExportSink, LABELS_FILE};
pub use fetch::{FetchedAsset, HttpImageSource, ImageSource};
pub use gcs::{verify_access, AuthReport, GcsClient, GcsSink, TokenSource};
pub use pipeline::{
    crop_tasks, upload_tasks, DeliveredItem, ProgressIndicator, TaskOutcome, TaskStatus,
    TransferPipeline, TransferSink, TransferSummary, TransferTask,
};
pub use platform::{
    build_dataset_request, DatasetHandle, DatasetRequest, DatasetSample, Detection, PlatformClient,
};

#[cfg(feature = "cli")]
pub use tracing_config::{TracingConfig, TracingFormat};

/// Run a transfer over an already-loaded manifest, reporting progress
/// through `progress`.
///
/// Builds the source and the mode-appropriate sink, then runs the bounded
/// scheduler to completion. In upload mode, cloud credentials are resolved
/// from the environment here — before any fetch starts.
///
/// # Errors
/// - Invalid configuration for the selected mode
/// - Sink construction fails (output directory, credentials, prefix listing)
pub async fn transfer_manifest_with_progress(
    manifest: &CocoManifest,
    config: &TransferConfig,
    progress: ProgressIndicator,
) -> Result<TransferSummary> {
    let source = Arc::new(HttpImageSource::new(config.request_timeout)?);

    let (sink, tasks): (Arc<dyn TransferSink>, Vec<TransferTask>) = match config.mode {
        TransferMode::CropAnnotations => {
            let output_dir = config.output_dir.as_ref().ok_or_else(|| {
                TransferError::invalid_config("crop mode requires an output directory")
            })?;
            let sink = Arc::new(CropExportSink::create(output_dir)?);
            (sink, crop_tasks(manifest, config.limit))
        },
        TransferMode::StreamToBucket => {
            let bucket = config
                .bucket
                .as_deref()
                .ok_or_else(|| TransferError::invalid_config("upload mode requires a bucket"))?;
            let cloud = CloudConfig::from_env()?;
            let client = Arc::new(GcsClient::connect(&cloud, config.request_timeout).await?);
            let prefix = config.split_prefix();
            let sink = Arc::new(GcsSink::open(client, bucket, &prefix).await?);
            (sink, upload_tasks(manifest, &prefix, config.limit))
        },
    };

    let pipeline = TransferPipeline::new(source, sink, config.concurrency).with_progress(progress);
    Ok(pipeline.run(tasks).await)
}

/// [`transfer_manifest_with_progress`] without progress reporting.
pub async fn transfer_manifest(
    manifest: &CocoManifest,
    config: &TransferConfig,
) -> Result<TransferSummary> {
    transfer_manifest_with_progress(manifest, config, ProgressIndicator::NoOp).await
}

/// Load a manifest from disk and transfer it.
///
/// # Errors
/// - Manifest cannot be read or parsed
/// - See [`transfer_manifest_with_progress`]
pub async fn transfer_from_path<P: AsRef<Path>>(
    manifest_path: P,
    config: &TransferConfig,
) -> Result<TransferSummary> {
    let manifest = CocoManifest::from_path(manifest_path)?;
    transfer_manifest(&manifest, config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transfer_from_missing_manifest_is_config_error() {
        let config = TransferConfig::builder()
            .output_dir("/tmp/fathomnet-transfer-test-out")
            .build()
            .unwrap();
        let err = transfer_from_path("/nonexistent/manifest.json", &config)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FileIo { .. }));
    }
}
