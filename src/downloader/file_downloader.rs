//! Synchronous download contract shared by every downloader.
//!
//! [`FileDownloader`] owns the policy around a transfer: the resume/skip
//! decision, `.part` naming, the optional sleep before starting, retried file
//! access, byte-rate throttling and hook fan-out. The transfer itself is a
//! [`RealDownload`] implementation such as
//! [`HttpDownloader`](super::HttpDownloader).

use crate::downloader::config::{FileDownloaderOptions, FILE_ACCESS_RETRY_SLEEP};
use crate::downloader::job::InfoDict;
use crate::downloader::progress::{DownloadPhase, ProgressHook, ProgressHooks, ProgressStatus};
use crate::downloader::rate_limit::RateLimiter;
use crate::downloader::retry::{AttemptError, RetryEvent, RetryManager, RetryPolicy, SleepFunc};
use crate::downloader::DownloadError;
use crate::shutdown::{self, SharedShutdown};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

const PART_SUFFIX: &str = ".part";

/// Result of [`Downloader::download`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// The final file is in place
    pub success: bool,
    /// A transfer actually ran (false when the file was already there)
    pub did_real_work: bool,
}

impl DownloadOutcome {
    /// Existing file reused
    pub fn skipped() -> Self {
        Self {
            success: true,
            did_real_work: false,
        }
    }

    /// A transfer ran and ended with `success`
    pub fn transferred(success: bool) -> Self {
        Self {
            success,
            did_real_work: true,
        }
    }
}

/// Anything that can bring `info_dict` to `filename`.
///
/// Implemented by the synchronous HTTP downloader and by the adapter over the
/// concurrent engine, so callers cannot tell which one did the work.
pub trait Downloader: Send + Sync {
    /// Download `info_dict`'s media to `filename`
    fn download(&self, filename: &Path, info_dict: &InfoDict)
        -> Result<DownloadOutcome, DownloadError>;
}

/// The transfer step run by [`FileDownloader::download`].
pub trait RealDownload {
    /// Perform the transfer; `Ok(false)` means it ended without a final file
    fn real_download(
        &self,
        fd: &FileDownloader,
        filename: &Path,
        info_dict: &InfoDict,
    ) -> Result<bool, DownloadError>;
}

/// Name the transfer writes to before the final rename.
///
/// `<filename>.part`, except with `nopart`, for stdout (`-`), or when the
/// destination exists and is not a regular file (a named pipe, say).
pub fn temp_name(filename: &Path, nopart: bool) -> PathBuf {
    let exists_but_not_file = filename.exists() && !filename.is_file();
    if nopart || filename == Path::new("-") || exists_but_not_file {
        return filename.to_path_buf();
    }
    let mut name = OsString::from(filename.as_os_str());
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Strip a trailing `.part`
pub fn undo_temp_name(filename: &Path) -> PathBuf {
    let name = filename.to_string_lossy();
    match name.strip_suffix(PART_SUFFIX) {
        Some(stripped) => PathBuf::from(stripped),
        None => filename.to_path_buf(),
    }
}

/// Name of the `.ytdl` sidecar holding resumable download state
pub fn ytdl_filename(filename: &Path) -> PathBuf {
    let mut name = OsString::from(filename.as_os_str());
    name.push(".ytdl");
    PathBuf::from(name)
}

fn is_transient_file_error(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::PermissionDenied | ErrorKind::InvalidInput)
}

/// Synchronous download policy
pub struct FileDownloader {
    options: FileDownloaderOptions,
    hooks: ProgressHooks,
    rate_limiter: RateLimiter,
    shutdown: Option<SharedShutdown>,
}

impl FileDownloader {
    /// Create a downloader with `options`
    pub fn new(options: FileDownloaderOptions) -> Self {
        let rate_limiter = RateLimiter::new(options.ratelimit);
        Self {
            options,
            hooks: ProgressHooks::new(),
            rate_limiter,
            shutdown: shutdown::get_global_shutdown(),
        }
    }

    /// Append a progress hook
    pub fn add_progress_hook(&mut self, hook: ProgressHook) {
        self.hooks.add(hook);
    }

    /// Builder form of [`add_progress_hook`](Self::add_progress_hook)
    pub fn with_progress_hook(mut self, hook: ProgressHook) -> Self {
        self.add_progress_hook(hook);
        self
    }

    /// Attach a shared shutdown handle for graceful cancellation
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Options in effect
    pub fn options(&self) -> &FileDownloaderOptions {
        &self.options
    }

    /// Whether Ctrl+C (or another shutdown request) arrived
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }

    /// Download through `real`, skipping files that are already there.
    ///
    /// The skip check runs before any network call. `subtitle` selects the
    /// subtitle sleep interval.
    pub fn download(
        &self,
        real: &dyn RealDownload,
        filename: &Path,
        info_dict: &InfoDict,
        subtitle: bool,
    ) -> Result<DownloadOutcome, DownloadError> {
        if let Some(size) = self.existing_download_size(filename) {
            self.report_file_already_downloaded(filename);
            let mut status = ProgressStatus::new(DownloadPhase::Finished, filename);
            status.total_bytes = Some(size);
            status.downloaded_bytes = Some(size);
            self.report_progress(status, info_dict);
            return Ok(DownloadOutcome::skipped());
        }

        if let Some(delay) = self.sleep_before_download(subtitle) {
            info!("[download] Sleeping {:.2} seconds ...", delay.as_secs_f64());
            std::thread::sleep(delay);
        }

        let success = real.real_download(self, filename, info_dict)?;
        Ok(DownloadOutcome::transferred(success))
    }

    /// Size of an existing destination that makes the download unnecessary.
    fn existing_download_size(&self, filename: &Path) -> Option<u64> {
        if filename == Path::new("-") {
            return None;
        }
        let nooverwrites_and_exists = !self.options.overwrites && filename.exists();
        let continuedl_and_exists =
            self.options.continuedl && filename.is_file() && !self.options.nopart;
        if nooverwrites_and_exists || continuedl_and_exists {
            fs::metadata(filename).map(|m| m.len()).ok()
        } else {
            None
        }
    }

    /// Random sleep before a download, if configured.
    pub fn sleep_before_download(&self, subtitle: bool) -> Option<Duration> {
        let delay = if subtitle {
            self.options.sleep_interval_subtitles.unwrap_or_default()
        } else {
            let min = self.options.sleep_interval.unwrap_or_default();
            let max = self.options.max_sleep_interval.unwrap_or(min).max(min);
            if max > min {
                let secs = rand::thread_rng().gen_range(min.as_secs_f64()..=max.as_secs_f64());
                Duration::from_secs_f64(secs)
            } else {
                min
            }
        };
        (!delay.is_zero()).then_some(delay)
    }

    /// Temporary name for `filename` under the current options
    pub fn temp_name(&self, filename: &Path) -> PathBuf {
        temp_name(filename, self.options.nopart)
    }

    /// Run a file operation, retrying permission and invalid-argument errors.
    ///
    /// Other errors are not retried. With `fatal`, exhaustion returns the
    /// error; otherwise it is logged and `Ok(None)` comes back.
    fn with_file_access<T>(
        &self,
        action: &'static str,
        path: &Path,
        fatal: bool,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> Result<Option<T>, DownloadError> {
        let sleep_func = self
            .options
            .retry_sleep_file_access
            .clone()
            .unwrap_or_else(|| SleepFunc::fixed(FILE_ACCESS_RETRY_SLEEP));
        let policy = RetryPolicy::new()
            .fatal(fatal)
            .with_sleep_func(Some(sleep_func))
            .with_reporter(move |event| match event {
                RetryEvent::Sleeping(_) => debug!("{}", event.message()),
                RetryEvent::GivingUp { fatal: true, .. } => {
                    error!("Unable to {action} file: {}", event.message())
                }
                _ => warn!("[download] Unable to {action} file: {}", event.message()),
            });
        let manager = RetryManager::new(Some(self.options.file_access_retries), policy);
        manager
            .run(|_| {
                op().map_err(|e| {
                    if is_transient_file_error(&e) {
                        AttemptError::Retry(e)
                    } else {
                        AttemptError::Abort(e)
                    }
                })
            })
            .map_err(|source| DownloadError::FileAccess {
                action,
                path: path.to_path_buf(),
                source,
            })
    }

    /// Open the output for writing; `-` is stdout. Failures are fatal.
    pub fn sanitize_open(
        &self,
        path: &Path,
        append: bool,
    ) -> Result<Box<dyn Write + Send>, DownloadError> {
        if path == Path::new("-") {
            return Ok(Box::new(io::stdout()));
        }
        let opened = self.with_file_access("open", path, true, || {
            let mut options = OpenOptions::new();
            options.create(true);
            if append {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            options.open(path)
        })?;
        match opened {
            Some(file) => Ok(Box::new(file)),
            None => Err(DownloadError::IoError(format!(
                "unable to open {}",
                path.display()
            ))),
        }
    }

    /// Remove a file; failures are logged, not returned. Returns whether it is gone.
    pub fn try_remove(&self, path: &Path) -> bool {
        match self.with_file_access("remove", path, false, || match fs::remove_file(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }) {
            Ok(result) => result.is_some(),
            Err(e) => {
                warn!(error = %e, "Failed to remove file");
                false
            }
        }
    }

    /// Rename `old` to `new`; failures are logged, not returned. Returns success.
    pub fn try_rename(&self, old: &Path, new: &Path) -> bool {
        if old == new {
            return true;
        }
        match self.with_file_access("rename", old, false, || fs::rename(old, new)) {
            Ok(result) => result.is_some(),
            Err(e) => {
                warn!(error = %e, "Failed to rename file");
                false
            }
        }
    }

    /// Set the modification time from a `Last-Modified` header value.
    ///
    /// Returns the applied time; unparseable headers and I/O failures are ignored.
    pub fn try_utime(&self, filename: &Path, last_modified: &str) -> Option<DateTime<Utc>> {
        let parsed = DateTime::parse_from_rfc2822(last_modified.trim())
            .ok()?
            .with_timezone(&Utc);
        let mtime: SystemTime = parsed.into();
        let result = OpenOptions::new()
            .write(true)
            .open(filename)
            .and_then(|file| file.set_modified(mtime));
        match result {
            Ok(()) => Some(parsed),
            Err(e) => {
                debug!(error = %e, "Failed to set file modification time");
                None
            }
        }
    }

    /// Sleep as needed to honor the byte-rate ceiling
    pub fn slow_down(&self, start: Instant, now: Instant, bytes: u64) {
        self.rate_limiter.slow_down(start, now, bytes);
    }

    /// Attach `info_dict` and send `status` to every hook
    pub fn report_progress(&self, status: ProgressStatus, info_dict: &InfoDict) {
        debug!(filename = %status.filename.display(), "{}", status.format_line());
        self.hooks.dispatch(status, info_dict);
    }

    /// Announce the destination
    pub fn report_destination(&self, filename: &Path) {
        info!("[download] Destination: {}", filename.display());
    }

    /// Announce a resumed download
    pub fn report_resuming_byte(&self, resume_len: u64) {
        info!("[download] Resuming download at byte {}", resume_len);
    }

    /// Announce that the server ignored the range request
    pub fn report_unable_to_resume(&self) {
        warn!("[download] Unable to resume");
    }

    /// Announce a skipped download
    pub fn report_file_already_downloaded(&self, filename: &Path) {
        info!(
            "[download] {} has already been downloaded",
            filename.display()
        );
    }
}

impl std::fmt::Debug for FileDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDownloader")
            .field("options", &self.options)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
