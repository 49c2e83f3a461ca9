//! CLI error types and conversions

use crate::downloader::{DownloadError, RateLimitError};

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Download error
    #[error("download error: {0}")]
    DownloadError(#[from] DownloadError),

    /// Rate limit could not be parsed
    #[error("rate limit error: {0}")]
    RateLimitError(#[from] RateLimitError),

    /// Some requested files are missing at the end of the run
    #[error("{failed} of {total} downloads failed")]
    DownloadsFailed {
        /// Files without a final copy
        failed: usize,
        /// Files requested
        total: usize,
    },

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}
