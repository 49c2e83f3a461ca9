//! Download configuration constants and per-engine configuration
//!
//! [`DownloadConfig`] configures the concurrent engine; [`FileDownloaderOptions`]
//! configures the synchronous [`FileDownloader`](super::FileDownloader).
//! Both are plain values owned by the instance they configure; nothing here is
//! shared between engines.

use crate::downloader::retry::SleepFunc;
use crate::downloader::DownloadError;
use std::time::Duration;

/// Default number of simultaneous transfers.
/// 4 keeps several connections busy without tripping per-host limits on most CDNs.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Default streaming write granularity in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Default transport timeout in seconds (connect and read).
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default base delay for exponential backoff in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Default number of retries after the first attempt (async engine).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Minimum spacing between two progress snapshots of the same task.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of retries for HTTP errors in the sync engine.
pub const DEFAULT_HTTP_RETRIES: u32 = 10;

/// Default number of retries for local file access errors.
pub const DEFAULT_FILE_ACCESS_RETRIES: u32 = 3;

/// Sleep between two file access attempts.
/// Short on purpose: these errors come from antivirus scanners or indexers
/// holding a handle for a moment.
pub const FILE_ACCESS_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Initial read buffer of the sync HTTP downloader.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Upper bound for an adaptive read block (4 MiB).
pub const MAX_BLOCK_SIZE: f64 = 4_194_304.0;

/// Configuration of an [`AsyncDownloadEngine`](super::AsyncDownloadEngine)
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadConfig {
    /// Maximum transfers in flight at once
    pub max_concurrent: usize,
    /// Bytes written per streaming step
    pub chunk_size: usize,
    /// Transport connect/read timeout
    pub timeout: Duration,
    /// Base of the exponential backoff between attempts
    pub retry_delay: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl DownloadConfig {
    /// Set the admission bound
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the streaming granularity
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the transport timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the backoff base
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Set the retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.max_concurrent == 0 {
            return Err(DownloadError::ValidationError(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(DownloadError::ValidationError(
                "chunk_size must be at least 1 byte".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(DownloadError::ValidationError(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Calculate the delay before retrying after `attempt` (0-based) failed.
///
/// `retry_delay * 2^attempt`, saturating instead of overflowing.
pub fn calculate_backoff(retry_delay: Duration, attempt: u32) -> Duration {
    retry_delay.saturating_mul(2u32.saturating_pow(attempt))
}

/// Options of the synchronous [`FileDownloader`](super::FileDownloader)
#[derive(Debug, Clone)]
pub struct FileDownloaderOptions {
    /// Byte rate ceiling in bytes/sec, `None` for unlimited
    pub ratelimit: Option<u64>,
    /// Resume partially downloaded files
    pub continuedl: bool,
    /// Write directly to the final name instead of a `.part` file
    pub nopart: bool,
    /// Overwrite existing destination files
    pub overwrites: bool,
    /// Retries for local `open`/`remove`/`rename` failures
    pub file_access_retries: u32,
    /// Retries for HTTP errors, `None` for infinite
    pub retries: Option<u32>,
    /// Lower bound of the random sleep before a download
    pub sleep_interval: Option<Duration>,
    /// Upper bound of the random sleep before a download
    pub max_sleep_interval: Option<Duration>,
    /// Fixed sleep before a subtitle download
    pub sleep_interval_subtitles: Option<Duration>,
    /// Initial read buffer size
    pub buffersize: usize,
    /// Keep the read buffer at `buffersize` instead of adapting it
    pub noresizebuffer: bool,
    /// Apply the server's `Last-Modified` as the file modification time
    pub updatetime: bool,
    /// Sleep policy between HTTP retries
    pub retry_sleep_http: Option<SleepFunc>,
    /// Sleep policy between file access retries
    pub retry_sleep_file_access: Option<SleepFunc>,
}

impl Default for FileDownloaderOptions {
    fn default() -> Self {
        Self {
            ratelimit: None,
            continuedl: true,
            nopart: false,
            overwrites: true,
            file_access_retries: DEFAULT_FILE_ACCESS_RETRIES,
            retries: Some(DEFAULT_HTTP_RETRIES),
            sleep_interval: None,
            max_sleep_interval: None,
            sleep_interval_subtitles: None,
            buffersize: DEFAULT_BUFFER_SIZE,
            noresizebuffer: false,
            updatetime: true,
            retry_sleep_http: None,
            retry_sleep_file_access: None,
        }
    }
}
