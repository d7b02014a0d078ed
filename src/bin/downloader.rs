//! FathomNet dataset downloader
//!
//! Command-line interface for moving COCO-format image datasets into local
//! crop exports or cloud storage using the fathomnet-transfer library.

#[cfg(feature = "cli")]
use fathomnet_transfer::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
