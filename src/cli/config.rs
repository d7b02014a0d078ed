//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::Cli;
use crate::config::{TransferConfig, TransferMode};
use anyhow::Result;

/// Convert CLI arguments to a validated [`TransferConfig`].
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build a `TransferConfig` from CLI arguments.
    pub(crate) fn from_cli(cli: &Cli) -> Result<TransferConfig> {
        let mode = if cli.upload {
            TransferMode::StreamToBucket
        } else {
            TransferMode::CropAnnotations
        };

        let mut builder = TransferConfig::builder()
            .mode(mode)
            .concurrency(cli.concurrency)
            .limit(cli.limit)
            .object_prefix(cli.object_prefix.clone())
            .split(cli.split.clone());

        if let Some(output_dir) = &cli.output_dir {
            builder = builder.output_dir(output_dir.clone());
        }
        if mode == TransferMode::StreamToBucket {
            builder = builder.bucket(cli.bucket.clone());
        }

        Ok(builder.build()?)
    }

    /// Validate CLI arguments for consistency before doing any work.
    pub(crate) fn validate_cli(cli: &Cli) -> Result<()> {
        if !cli.upload && cli.output_dir.is_none() {
            anyhow::bail!("OUTPUT_DIR is required in crop mode (or pass --upload)");
        }
        if cli.upload && cli.output_dir.is_some() {
            log::warn!("OUTPUT_DIR is ignored in upload mode");
        }
        if cli.ingest && !cli.upload {
            anyhow::bail!("--ingest requires --upload: samples must point at uploaded objects");
        }
        if cli.concurrency == 0 {
            anyhow::bail!("--concurrency must be at least 1");
        }
        if cli.upload && cli.bucket.is_empty() {
            anyhow::bail!("--bucket cannot be empty in upload mode");
        }
        Ok(())
    }
}
