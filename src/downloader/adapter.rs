//! Blocking [`Downloader`] over the background manager.

use crate::downloader::config::DownloadConfig;
use crate::downloader::file_downloader::{DownloadOutcome, Downloader};
use crate::downloader::job::{DownloadStatus, InfoDict};
use crate::downloader::manager::AsyncDownloadManager;
use crate::downloader::progress::{DownloadPhase, ProgressHook, ProgressHooks, ProgressStatus};
use crate::downloader::DownloadError;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Status poll spacing while waiting on the manager
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs downloads through an [`AsyncDownloadManager`] and blocks until each
/// one reaches a terminal state.
///
/// The wait is bounded by twice the configured request timeout, so a long
/// transfer on a slow link can hit [`DownloadError::Timeout`] even though
/// the transfer itself is still healthy.
pub struct AsyncFileDownloader {
    manager: Arc<AsyncDownloadManager>,
    timeout: Duration,
    hooks: ProgressHooks,
}

impl AsyncFileDownloader {
    /// Adapter over a shared manager; `config` supplies the timeout
    pub fn new(manager: Arc<AsyncDownloadManager>, config: &DownloadConfig) -> Self {
        Self {
            manager,
            timeout: config.timeout,
            hooks: ProgressHooks::new(),
        }
    }

    /// Append a progress hook
    pub fn with_progress_hook(mut self, hook: ProgressHook) -> Self {
        self.hooks.add(hook);
        self
    }

    /// Longest wait for one download
    pub fn deadline(&self) -> Duration {
        self.timeout.saturating_mul(2)
    }

    /// Underlying manager
    pub fn manager(&self) -> &Arc<AsyncDownloadManager> {
        &self.manager
    }
}

impl Downloader for AsyncFileDownloader {
    fn download(
        &self,
        filename: &Path,
        info_dict: &InfoDict,
    ) -> Result<DownloadOutcome, DownloadError> {
        let url = info_dict
            .url()
            .ok_or_else(|| DownloadError::ValidationError("info dict has no url".to_string()))?;
        let format_id = info_dict.format_id().unwrap_or_default();
        let expected_size = info_dict.filesize();

        self.manager.start()?;
        let task_id = self.manager.add_download(
            url,
            filename,
            info_dict.clone(),
            format_id,
            expected_size,
        )?;
        info!("[download] Destination: {}", filename.display());

        let limit = self.deadline();
        let deadline = Instant::now() + limit;
        let mut last_reported = None;
        loop {
            if let Some(task) = self.manager.get_download_status(&task_id) {
                match task.status {
                    DownloadStatus::Completed => {
                        let mut status = ProgressStatus::new(DownloadPhase::Finished, filename);
                        status.downloaded_bytes = Some(task.downloaded_bytes);
                        status.total_bytes = task.expected_size.or(Some(task.downloaded_bytes));
                        status.format_id = Some(task.format_id.clone());
                        self.hooks.dispatch(status, info_dict);
                        return Ok(DownloadOutcome::transferred(true));
                    }
                    DownloadStatus::Failed => {
                        let mut status = ProgressStatus::new(DownloadPhase::Error, filename);
                        status.downloaded_bytes = Some(task.downloaded_bytes);
                        self.hooks.dispatch(status, info_dict);
                        return Err(DownloadError::TaskFailed(
                            task.error.unwrap_or_else(|| "unknown error".to_string()),
                        ));
                    }
                    DownloadStatus::Cancelled => return Err(DownloadError::Cancelled),
                    DownloadStatus::Downloading
                        if last_reported != Some(task.downloaded_bytes) =>
                    {
                        last_reported = Some(task.downloaded_bytes);
                        let mut status =
                            ProgressStatus::new(DownloadPhase::Downloading, filename);
                        status.downloaded_bytes = Some(task.downloaded_bytes);
                        status.total_bytes = task.expected_size;
                        status.format_id = Some(task.format_id.clone());
                        self.hooks.dispatch(status, info_dict);
                    }
                    _ => {}
                }
            }

            if Instant::now() >= deadline {
                debug!(task_id = %task_id, "Gave up waiting for download");
                return Err(DownloadError::Timeout(limit));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
