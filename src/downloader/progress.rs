//! Progress tracking, throughput helpers and hook dispatch.
//!
//! The synchronous engine reports [`ProgressStatus`] values to an ordered list
//! of hooks; the concurrent engine emits immutable [`DownloadProgress`]
//! snapshots, throttled per task by a [`ProgressState`]. Hook failures are
//! logged and swallowed so that a broken consumer never aborts a transfer.

use crate::downloader::config::{MAX_BLOCK_SIZE, PROGRESS_INTERVAL};
use crate::downloader::job::{DownloadTask, InfoDict};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const MIN_ELAPSED: Duration = Duration::from_millis(1);

/// Average speed in bytes/sec, `None` for nothing transferred or under 1 ms.
pub fn calc_speed(start: Instant, now: Instant, bytes: u64) -> Option<f64> {
    let elapsed = now.saturating_duration_since(start);
    if bytes == 0 || elapsed < MIN_ELAPSED {
        return None;
    }
    Some(bytes as f64 / elapsed.as_secs_f64())
}

/// Remaining seconds at the average speed so far.
pub fn calc_eta(start: Instant, now: Instant, total: Option<u64>, current: u64) -> Option<u64> {
    let total = total?;
    let elapsed = now.saturating_duration_since(start);
    if current == 0 || elapsed < MIN_ELAPSED {
        return None;
    }
    let rate = current as f64 / elapsed.as_secs_f64();
    let remaining = total.saturating_sub(current) as f64;
    Some((remaining / rate).round() as u64)
}

/// Completion percentage, `None` when the total is unknown.
pub fn calc_percent(byte_counter: u64, data_len: Option<u64>) -> Option<f64> {
    match data_len {
        None => None,
        Some(0) => Some(100.0),
        Some(len) => Some(byte_counter as f64 / len as f64 * 100.0),
    }
}

/// Size of the next read so that one read takes about one second.
///
/// The result stays within `[max(bytes/2, 1), min(max(bytes*2, 1), 4 MiB)]`
/// and therefore within `[1, 4 MiB]`.
pub fn best_block_size(elapsed: Duration, bytes: u64) -> usize {
    let bytes = bytes as f64;
    let new_max = (bytes * 2.0).max(1.0).min(MAX_BLOCK_SIZE);
    let new_min = (bytes / 2.0).max(1.0).min(new_max);
    if elapsed < MIN_ELAPSED {
        return new_max as usize;
    }
    let rate = bytes / elapsed.as_secs_f64();
    rate.clamp(new_min, new_max) as usize
}

/// `HH:MM:SS`, or `--:--:--` past 99 hours.
pub fn format_seconds(seconds: u64) -> String {
    let hours = seconds / 3600;
    if hours > 99 {
        return "--:--:--".to_string();
    }
    format!("{:02}:{:02}:{:02}", hours, (seconds % 3600) / 60, seconds % 60)
}

/// ETA without a leading zero hour (`05:23`), `Unknown` when absent.
pub fn format_eta(eta: Option<u64>) -> String {
    match eta {
        None => "Unknown".to_string(),
        Some(seconds) => {
            let formatted = format_seconds(seconds);
            formatted
                .strip_prefix("00:")
                .map(str::to_string)
                .unwrap_or(formatted)
        }
    }
}

/// Right-aligned percentage, `---.-%` when absent.
pub fn format_percent(percent: Option<f64>) -> String {
    match percent {
        None => "---.-%".to_string(),
        Some(p) => format!("{p:>5.1}%"),
    }
}

/// Binary-suffixed byte count (`1.50MiB`).
pub fn format_bytes(bytes: f64) -> String {
    const SUFFIXES: [&str; 7] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
    let mut value = bytes;
    let mut index = 0;
    while value >= 1024.0 && index < SUFFIXES.len() - 1 {
        value /= 1024.0;
        index += 1;
    }
    format!("{value:.2}{}B", SUFFIXES[index])
}

/// Transfer speed, `Unknown B/s` when absent.
pub fn format_speed(speed: Option<f64>) -> String {
    match speed {
        None => "Unknown B/s".to_string(),
        Some(s) => format!("{}/s", format_bytes(s)),
    }
}

/// Retry ceiling for messages (`inf` when unbounded).
pub fn format_retries(retries: Option<u32>) -> String {
    retries.map_or_else(|| "inf".to_string(), |r| r.to_string())
}

/// Phase reported to synchronous hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPhase {
    /// Bytes are flowing
    Downloading,
    /// The final file is in place
    Finished,
    /// The download stopped with an error
    Error,
}

/// Status handed to synchronous progress hooks.
#[derive(Debug, Clone)]
pub struct ProgressStatus {
    /// Current phase
    pub status: DownloadPhase,
    /// Final destination
    pub filename: PathBuf,
    /// File actually being written, when different from `filename`
    pub tmpfilename: Option<PathBuf>,
    /// Format being downloaded
    pub format_id: Option<String>,
    /// Bytes on disk so far
    pub downloaded_bytes: Option<u64>,
    /// Exact size when known
    pub total_bytes: Option<u64>,
    /// Size estimate when the exact size is unknown
    pub total_bytes_estimate: Option<u64>,
    /// Time since the transfer started
    pub elapsed: Option<Duration>,
    /// Bytes/sec
    pub speed: Option<f64>,
    /// Seconds remaining
    pub eta: Option<u64>,
    /// Extractor metadata, shared and never copied
    pub info_dict: Option<InfoDict>,
}

impl ProgressStatus {
    /// Empty status for `filename` in `status`
    pub fn new(status: DownloadPhase, filename: impl Into<PathBuf>) -> Self {
        Self {
            status,
            filename: filename.into(),
            tmpfilename: None,
            format_id: None,
            downloaded_bytes: None,
            total_bytes: None,
            total_bytes_estimate: None,
            elapsed: None,
            speed: None,
            eta: None,
            info_dict: None,
        }
    }

    /// Percentage from the exact or estimated total
    pub fn percentage(&self) -> Option<f64> {
        let downloaded = self.downloaded_bytes?;
        calc_percent(downloaded, self.total_bytes.or(self.total_bytes_estimate))
    }

    /// One-line summary in the downloader's screen format
    pub fn format_line(&self) -> String {
        match self.status {
            DownloadPhase::Finished => {
                let size = self
                    .total_bytes
                    .or(self.downloaded_bytes)
                    .map(|b| format_bytes(b as f64))
                    .unwrap_or_else(|| "N/A".to_string());
                match self.elapsed {
                    Some(elapsed) => format!(
                        "100% of {size} in {}",
                        format_seconds(elapsed.as_secs())
                    ),
                    None => format!("100% of {size}"),
                }
            }
            DownloadPhase::Downloading => format!(
                "{} of {} at {} ETA {}",
                format_percent(self.percentage()),
                self.total_bytes
                    .or(self.total_bytes_estimate)
                    .map(|b| format_bytes(b as f64))
                    .unwrap_or_else(|| "Unknown".to_string()),
                format_speed(self.speed),
                format_eta(self.eta)
            ),
            DownloadPhase::Error => "ERROR".to_string(),
        }
    }
}

/// Synchronous progress hook
pub type ProgressHook = Arc<dyn Fn(&ProgressStatus) -> anyhow::Result<()> + Send + Sync>;

/// Concurrent-engine progress callback
pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) -> anyhow::Result<()> + Send + Sync>;

/// Run a hook, turning errors and panics into warnings.
pub(crate) fn invoke_hook<T>(hook: &(dyn Fn(&T) -> anyhow::Result<()> + Send + Sync), value: &T) {
    match catch_unwind(AssertUnwindSafe(|| hook(value))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Progress hook failed"),
        Err(_) => warn!("Progress hook panicked"),
    }
}

/// Ordered list of hooks receiving every status.
#[derive(Clone, Default)]
pub struct ProgressHooks {
    hooks: Vec<ProgressHook>,
}

impl ProgressHooks {
    /// Empty hook list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook; hooks run in insertion order
    pub fn add(&mut self, hook: ProgressHook) {
        self.hooks.push(hook);
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hook is registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Attach `info_dict` and broadcast `status` to every hook
    pub fn dispatch(&self, mut status: ProgressStatus, info_dict: &InfoDict) {
        status.info_dict = Some(info_dict.clone());
        for hook in &self.hooks {
            invoke_hook(hook.as_ref(), &status);
        }
    }
}

impl std::fmt::Debug for ProgressHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHooks")
            .field("len", &self.hooks.len())
            .finish()
    }
}

/// Immutable progress snapshot of one concurrent transfer
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Task state when the snapshot was taken
    pub task: DownloadTask,
    /// Bytes written so far in this attempt
    pub downloaded_bytes: u64,
    /// Expected size when known
    pub total_bytes: Option<u64>,
    /// Bytes/sec
    pub speed: Option<f64>,
    /// Seconds remaining
    pub eta: Option<u64>,
    /// 0-100 when the total is known
    pub percentage: Option<f64>,
}

/// Per-transfer progress counter with emission throttling.
///
/// Owned by the single coroutine driving a transfer, so snapshots of one task
/// are emitted in order with non-decreasing byte counts.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Bytes written so far
    pub downloaded_bytes: u64,
    /// Expected size when known
    pub total_bytes: Option<u64>,
    /// When the transfer started
    pub start_time: Instant,
    /// When the last snapshot went out
    pub last_update: Option<Instant>,
    /// Minimum spacing between snapshots
    pub update_interval: Duration,
}

impl ProgressState {
    /// Fresh state with the default 500 ms spacing
    pub fn new(total_bytes: Option<u64>) -> Self {
        Self {
            downloaded_bytes: 0,
            total_bytes,
            start_time: Instant::now(),
            last_update: None,
            update_interval: PROGRESS_INTERVAL,
        }
    }

    /// Count newly written bytes
    pub fn update(&mut self, new_bytes: u64) {
        self.downloaded_bytes = self.downloaded_bytes.saturating_add(new_bytes);
    }

    /// Whether enough time passed since the last snapshot
    pub fn should_emit_update(&self, now: Instant) -> bool {
        match self.last_update {
            None => now.saturating_duration_since(self.start_time) >= self.update_interval,
            Some(last) => now.saturating_duration_since(last) >= self.update_interval,
        }
    }

    /// Record that a snapshot went out
    pub fn mark_emitted(&mut self, now: Instant) {
        self.last_update = Some(now);
    }

    /// Bytes/sec so far
    pub fn speed(&self, now: Instant) -> Option<f64> {
        calc_speed(self.start_time, now, self.downloaded_bytes)
    }

    /// Build a snapshot for `task`
    pub fn snapshot(&self, task: DownloadTask, now: Instant) -> DownloadProgress {
        DownloadProgress {
            task,
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            speed: self.speed(now),
            eta: calc_eta(self.start_time, now, self.total_bytes, self.downloaded_bytes),
            percentage: calc_percent(self.downloaded_bytes, self.total_bytes),
        }
    }

    /// Human-readable progress string for logging
    pub fn format_progress(&self, now: Instant) -> String {
        let mut parts = vec![format!(
            "[download] {}",
            format_percent(calc_percent(self.downloaded_bytes, self.total_bytes))
        )];
        if let Some(total) = self.total_bytes {
            parts.push(format!("of {}", format_bytes(total as f64)));
        }
        parts.push(format!("at {}", format_speed(self.speed(now))));
        parts.push(format!(
            "ETA {}",
            format_eta(calc_eta(
                self.start_time,
                now,
                self.total_bytes,
                self.downloaded_bytes
            ))
        ));
        parts.join(" ")
    }
}
