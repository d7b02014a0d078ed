//! Dataset downloader CLI
//!
//! Command-line interface over the transfer pipeline: crop-and-save by
//! default, stream-to-bucket with `--upload`, plus credential diagnostics
//! and optional platform registration.

use super::config::CliConfigBuilder;
use crate::{
    build_dataset_request, transfer_manifest_with_progress, verify_access, CloudConfig,
    CocoManifest, PlatformClient, PlatformConfig, ProgressIndicator, TransferMode,
    DEFAULT_CONCURRENCY,
};
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

/// FathomNet dataset downloader
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "downloader")]
pub struct Cli {
    /// COCO manifest path
    #[arg(value_name = "DATASET", required_unless_present = "check_auth")]
    pub dataset: Option<PathBuf>,

    /// Output directory for cropped images (crop mode)
    #[arg(value_name = "OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Process at most NUM items
    #[arg(short = 'n', long = "limit", value_name = "NUM")]
    pub limit: Option<usize>,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Stream original images to the cloud bucket instead of cropping locally
    #[arg(long)]
    pub upload: bool,

    /// Destination bucket for upload mode
    #[arg(long, default_value = "voxel51-test")]
    pub bucket: String,

    /// Base object prefix inside the bucket
    #[arg(long, default_value = "fathomnet/")]
    pub object_prefix: String,

    /// Dataset split tag (shapes object keys and platform sample tags)
    #[arg(long, default_value = "train")]
    pub split: String,

    /// Maximum simultaneous transfers
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Register the dataset with the hosted platform after the upload run
    #[arg(long)]
    pub ingest: bool,

    /// Dataset name used for platform registration
    #[arg(long, default_value = "fathomnet-2025")]
    pub dataset_name: String,

    /// Replace the platform dataset if it already exists
    #[arg(long)]
    pub recreate: bool,

    /// Check cloud credentials and exit
    #[arg(long)]
    pub check_auth: bool,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    crate::TracingConfig::new()
        .with_verbosity(cli.verbose)
        .init()
        .context("Failed to initialize tracing")?;

    if cli.check_auth {
        return check_auth(&cli).await;
    }

    CliConfigBuilder::validate_cli(&cli).context("Invalid CLI arguments")?;
    let config = CliConfigBuilder::from_cli(&cli).context("Failed to build configuration")?;
    debug!("configuration: {:?}", config);

    // Resolve every environment dependency the run will need before any
    // work starts; a bad environment must not fail halfway into a batch.
    let platform_config = if cli.ingest {
        Some(PlatformConfig::from_env().context("--ingest requires platform configuration")?)
    } else {
        None
    };
    if config.mode == TransferMode::StreamToBucket {
        CloudConfig::from_env().context("Cloud configuration is invalid")?;
    }

    let run_id = uuid::Uuid::new_v4();
    let dataset_path = cli
        .dataset
        .as_ref()
        .expect("clap enforces DATASET outside --check-auth");

    info!("run {}: loading {}", run_id, dataset_path.display());
    let manifest = CocoManifest::from_path(dataset_path)
        .with_context(|| format!("Failed to load manifest {}", dataset_path.display()))?;
    info!(
        "manifest: {} image(s), {} annotation(s), {} categories",
        manifest.images.len(),
        manifest.annotations.len(),
        manifest.categories.len()
    );

    let batch_len = match config.mode {
        TransferMode::CropAnnotations => manifest.annotations.len(),
        TransferMode::StreamToBucket => manifest.images.len(),
    };
    let batch_len = cli.limit.map_or(batch_len, |cap| batch_len.min(cap));
    if let Some(cap) = cli.limit {
        info!("limiting to first {} item(s)", cap);
    }

    let progress = ProgressIndicator::for_batch(batch_len as u64);
    let start_time = Instant::now();
    let summary = transfer_manifest_with_progress(&manifest, &config, progress)
        .await
        .context("Transfer failed to start")?;

    info!(
        "{} mode finished in {:.2}s: {}",
        config.mode,
        start_time.elapsed().as_secs_f64(),
        summary
    );
    if summary.failed() > 0 {
        warn!(
            "{} task(s) failed; re-running the same command retries only the missing items",
            summary.failed()
        );
    }

    if let Some(platform_config) = platform_config {
        let request = build_dataset_request(
            &manifest,
            &cli.dataset_name,
            &cli.bucket,
            &config.split_prefix(),
            &cli.split,
            cli.limit,
            cli.recreate,
        );
        let client = PlatformClient::new(&platform_config, config.request_timeout)?
            .with_run_id(run_id.to_string());
        let handle = client
            .create_dataset(&request)
            .await
            .context("Dataset registration failed")?;
        println!(
            "Registered dataset '{}' as {} ({} samples)",
            handle.name, handle.id, handle.sample_count
        );
    }

    Ok(())
}

/// Credential diagnostics: resolve a token, probe the bucket, report.
async fn check_auth(cli: &Cli) -> Result<()> {
    let cloud = CloudConfig::from_env().context("Cloud configuration is invalid")?;
    let report = verify_access(
        &cloud,
        Some(cli.bucket.as_str()),
        crate::config::DEFAULT_REQUEST_TIMEOUT,
    )
    .await;
    print!("{}", report);
    if report.authenticated() {
        Ok(())
    } else {
        anyhow::bail!(
            "cloud authentication failed; run 'gcloud auth application-default login' or set {}",
            crate::config::ENV_OAUTH_ACCESS_TOKEN
        )
    }
}
