//! Error types for dataset transfer operations
//!
//! All fallible library APIs return [`Result`]. Variants carry enough context
//! (operation, path, upstream status) that per-task failures can be logged
//! without re-deriving where they came from.

use std::path::Path;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors produced while moving dataset assets.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Network-level failure talking to an HTTP endpoint.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A remote fetch completed with a non-success HTTP status.
    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    /// Filesystem operation failed.
    #[error("File I/O error during {operation} at {path}: {source}")]
    FileIo {
        operation: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The COCO manifest could not be read or does not parse.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Image bytes could not be decoded, cropped, or encoded.
    #[error("Image processing error: {0}")]
    Image(String),

    /// Object-store request was rejected or returned an unexpected payload.
    #[error("Object store error: {0}")]
    Storage(String),

    /// Dataset-platform request failed.
    #[error("Platform error: {0}")]
    Platform(String),

    /// Startup configuration is missing or inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransferError {
    /// Network failure with an upstream cause.
    pub fn network_error<S: Into<String>, E>(message: S, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Network failure without a distinct upstream cause.
    pub fn network_message<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Filesystem failure, annotated with the attempted operation and path.
    pub fn file_io_error<S: Into<String>>(operation: S, path: &Path, source: &std::io::Error) -> Self {
        Self::FileIo {
            operation: operation.into(),
            path: path.display().to_string(),
            source: std::io::Error::new(source.kind(), source.to_string()),
        }
    }

    /// Manifest read/parse failure.
    pub fn manifest_error<S: Into<String>>(message: S) -> Self {
        Self::Manifest(message.into())
    }

    /// Decode/crop/encode failure.
    pub fn image_error<S: Into<String>>(message: S) -> Self {
        Self::Image(message.into())
    }

    /// Object-store failure.
    pub fn storage_error<S: Into<String>>(message: S) -> Self {
        Self::Storage(message.into())
    }

    /// Dataset-platform failure.
    pub fn platform_error<S: Into<String>>(message: S) -> Self {
        Self::Platform(message.into())
    }

    /// Configuration failure surfaced before any work begins.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this error is fatal at startup rather than per-task.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfig(_) | Self::Manifest(_))
    }
}
