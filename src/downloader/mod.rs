//! Download engines, retry and rate limiting
//!
//! This module provides both download engines and the primitives they share.
//!
//! # Overview
//!
//! 1. **Synchronous engine**: [`FileDownloader`] decides whether to skip,
//!    names the `.part` file, sleeps before starting, dispatches progress hooks
//!    and renames the result; [`HttpDownloader`] performs the HTTP transfer
//!    behind it.
//! 2. **Concurrent engine**: [`AsyncDownloadEngine`] runs many transfers at once,
//!    bounded by a semaphore, each with its own retry loop.
//! 3. **Thread bridge**: [`AsyncDownloadManager`] runs one engine on a dedicated
//!    thread; [`AsyncFileDownloader`] exposes it behind the same [`Downloader`]
//!    trait as the synchronous engine.
//! 4. **Primitives**: [`RetryManager`] with injectable policies,
//!    [`RateLimiter`] byte-rate throttling, throughput helpers in [`progress`].
//!
//! # Error Handling
//!
//! All operations return `Result<T, DownloadError>`:
//! - Network and content errors (retried with backoff)
//! - File access errors (retried with a short fixed sleep)
//! - Cancellation (terminal, never retried)
//! - Validation errors (not retried)

pub mod adapter;
pub mod config;
pub mod engine;
pub mod file_downloader;
pub mod http;
pub mod job;
pub mod manager;
pub mod progress;
pub mod rate_limit;
pub mod retry;

pub use adapter::AsyncFileDownloader;
pub use config::{DownloadConfig, FileDownloaderOptions};
pub use engine::{AsyncDownloadEngine, DownloadStats, HttpClient, HttpResponse, ReqwestClient};
pub use file_downloader::{DownloadOutcome, Downloader, FileDownloader, RealDownload};
pub use http::{BlockingTransport, HttpDownloader, ReqwestTransport, TransportResponse};
pub use job::{DownloadStatus, DownloadTask, InfoDict, TaskId};
pub use manager::AsyncDownloadManager;
pub use progress::{
    DownloadPhase, DownloadProgress, ProgressCallback, ProgressHook, ProgressHooks,
    ProgressStatus,
};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use retry::{RetryManager, RetryPolicy, SleepFunc};

use std::path::PathBuf;
use std::time::Duration;

/// Download errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Rate limit configuration error
    #[error("rate limit error: {0}")]
    RateLimitError(#[from] RateLimitError),

    /// Connection, DNS or read failure
    #[error("network error: {0}")]
    NetworkError(String),

    /// Server answered with an error status
    #[error("HTTP Error {status}: {url}")]
    HttpStatus {
        /// Status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Fewer bytes arrived than announced
    #[error("content too short: expected {expected} bytes, got {actual}")]
    ContentTooShort {
        /// Announced size
        expected: u64,
        /// Size on disk
        actual: u64,
    },

    /// Local I/O failure outside the file access wrapper
    #[error("IO error: {0}")]
    IoError(String),

    /// `open`, `remove` or `rename` kept failing
    #[error("unable to {action} file {}: {source}", path.display())]
    FileAccess {
        /// Operation that failed
        action: &'static str,
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Invalid input
    #[error("validation error: {0}")]
    ValidationError(String),

    /// The task was cancelled
    #[error("download cancelled")]
    Cancelled,

    /// A bridged task ended in `failed`
    #[error("download failed: {0}")]
    TaskFailed(String),

    /// No terminal status within the bridge deadline
    #[error("download timed out after {0:?}")]
    Timeout(Duration),

    /// The background manager could not run
    #[error("manager error: {0}")]
    ManagerError(String),
}

impl DownloadError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::NetworkError(_)
            | DownloadError::ContentTooShort { .. }
            | DownloadError::IoError(_) => true,
            DownloadError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::IoError(e.to_string())
    }
}
