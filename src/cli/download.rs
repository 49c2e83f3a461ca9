//! Download command implementation

use crate::downloader::config::{
    DownloadConfig, FileDownloaderOptions, DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE,
    DEFAULT_FILE_ACCESS_RETRIES, DEFAULT_HTTP_RETRIES, DEFAULT_MAX_RETRIES,
};
use crate::downloader::progress::{format_bytes, format_percent, ProgressHook, ProgressStatus};
use crate::downloader::rate_limit::parse_bytes;
use crate::downloader::{
    AsyncDownloadManager, AsyncFileDownloader, DownloadPhase, DownloadProgress, Downloader,
    FileDownloader, HttpDownloader, InfoDict, ProgressCallback, ReqwestTransport,
};
use crate::shutdown::SharedShutdown;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::CliError;

/// Maximum allowed concurrency
const MAX_CONCURRENCY: usize = 32;

/// Fallback name when the URL has no usable path segment
const DEFAULT_FILENAME: &str = "download.bin";

/// Parse and validate concurrency value
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Retry count: a number or `infinite`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCount(pub Option<u32>);

impl FromStr for RetryCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inf" | "infinite" => Ok(RetryCount(None)),
            other => other
                .parse()
                .map(|n| RetryCount(Some(n)))
                .map_err(|_| format!("Invalid retry count: {s}. Use a number or 'infinite'")),
        }
    }
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// Which engine runs the transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// One file at a time, resumable `.part` files
    Sync,
    /// Concurrent transfers on the async engine
    Async,
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(Engine::Sync),
            "async" => Ok(Engine::Async),
            _ => Err(format!("Invalid engine: {s}. Valid options: sync, async")),
        }
    }
}

/// Media downloader CLI
#[derive(Parser, Debug)]
#[command(name = "media-downloader")]
#[command(about = "Download media files over HTTP with resume, retries and rate limiting", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Download engine: sync or async
    #[arg(long, global = true, default_value = "sync")]
    pub engine: Engine,

    /// Concurrent transfers for the async engine (max: 32)
    #[arg(long, global = true, default_value = "4", value_parser = parse_concurrency)]
    pub concurrency: usize,

    /// Retries after the first attempt; "infinite" works with the sync engine only
    ///
    /// Defaults to 10 for the sync engine and 3 for the async engine.
    #[arg(long, global = true)]
    pub retries: Option<RetryCount>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, default_value = "30")]
    pub timeout: u64,

    /// Write size in bytes for the async engine
    #[arg(long, global = true, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Base delay between async retries in milliseconds, doubled per attempt
    #[arg(long, global = true, default_value = "1000")]
    pub retry_delay_ms: u64,

    /// Maximum download rate, e.g. 50K or 4.2M (sync only)
    #[arg(long, global = true)]
    pub limit_rate: Option<String>,

    /// Do not resume partially downloaded files
    #[arg(long, global = true, default_value_t = false)]
    pub no_continue: bool,

    /// Write directly into the output file instead of a .part file
    #[arg(long, global = true, default_value_t = false)]
    pub no_part: bool,

    /// Never overwrite existing files
    #[arg(long, global = true, default_value_t = false)]
    pub no_overwrites: bool,

    /// Do not apply the Last-Modified header as the file modification time
    #[arg(long, global = true, default_value_t = false)]
    pub no_mtime: bool,

    /// Retries on file access errors
    #[arg(long, global = true, default_value_t = DEFAULT_FILE_ACCESS_RETRIES)]
    pub file_access_retries: u32,

    /// Seconds to sleep before each download (minimum when --max-sleep-interval is set)
    #[arg(long, global = true)]
    pub sleep_interval: Option<f64>,

    /// Upper bound of the random sleep before each download
    #[arg(long, global = true)]
    pub max_sleep_interval: Option<f64>,

    /// Initial read size in bytes for the sync engine
    #[arg(long, global = true, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Keep the read size fixed instead of adapting it to throughput
    #[arg(long, global = true, default_value_t = false)]
    pub no_resize_buffer: bool,

    /// Hide the progress bar
    #[arg(long, global = true, default_value_t = false)]
    pub no_progress: bool,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9090)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

fn seconds(value: Option<f64>, name: &str) -> Result<Option<Duration>, CliError> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|_| CliError::InvalidArgument(format!("invalid {name}: {secs}")))
        })
        .transpose()
}

impl Cli {
    /// Options for the synchronous engine
    pub fn file_downloader_options(&self) -> Result<FileDownloaderOptions, CliError> {
        let ratelimit = self
            .limit_rate
            .as_deref()
            .map(parse_bytes)
            .transpose()?;
        let retries = self
            .retries
            .map(|r| r.0)
            .unwrap_or(Some(DEFAULT_HTTP_RETRIES));
        Ok(FileDownloaderOptions {
            ratelimit,
            continuedl: !self.no_continue,
            nopart: self.no_part,
            overwrites: !self.no_overwrites,
            file_access_retries: self.file_access_retries,
            retries,
            sleep_interval: seconds(self.sleep_interval, "sleep interval")?,
            max_sleep_interval: seconds(self.max_sleep_interval, "max sleep interval")?,
            buffersize: self.buffer_size,
            noresizebuffer: self.no_resize_buffer,
            updatetime: !self.no_mtime,
            ..Default::default()
        })
    }

    /// Configuration for the async engine
    pub fn download_config(&self) -> Result<DownloadConfig, CliError> {
        let max_retries = match self.retries {
            None => DEFAULT_MAX_RETRIES,
            Some(RetryCount(Some(n))) => n,
            Some(RetryCount(None)) => {
                return Err(CliError::InvalidArgument(
                    "the async engine needs a finite retry count".to_string(),
                ))
            }
        };
        let config = DownloadConfig::default()
            .with_max_concurrent(self.concurrency)
            .with_chunk_size(self.chunk_size)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
            .with_max_retries(max_retries);
        config.validate()?;
        Ok(config)
    }
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download one or more URLs
    Download(DownloadArgs),
}

/// Download command arguments
#[derive(Parser, Debug)]
pub struct DownloadArgs {
    /// URLs to download
    #[arg(required = true, num_args = 1..)]
    pub urls: Vec<String>,

    /// Output file (single URL only)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory for files named after their URL
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Format identifier passed to progress reporting
    #[arg(long, default_value = "")]
    pub format_id: String,
}

/// Final state of one requested file
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    /// Source URL
    pub url: String,
    /// Destination path
    pub filename: PathBuf,
    /// Final file is in place
    pub success: bool,
    /// Existing file was reused
    pub skipped: bool,
    /// Bytes on disk, when known
    pub bytes: Option<u64>,
    /// Failure message
    pub error: Option<String>,
}

impl FileReport {
    fn new(url: &str, filename: &Path) -> Self {
        Self {
            url: url.to_string(),
            filename: filename.to_path_buf(),
            success: false,
            skipped: false,
            bytes: None,
            error: None,
        }
    }
}

/// Last non-empty path segment of `url`, or a fixed fallback
pub fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        })
        .filter(|name| name != "." && name != "..")
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
}

impl DownloadArgs {
    /// Resolve `(url, destination)` pairs
    pub fn targets(&self) -> Result<Vec<(String, PathBuf)>, CliError> {
        match &self.output {
            Some(output) if self.urls.len() == 1 => {
                Ok(vec![(self.urls[0].clone(), output.clone())])
            }
            Some(_) => Err(CliError::InvalidArgument(
                "--output accepts a single URL; use --output-dir for several".to_string(),
            )),
            None => Ok(self
                .urls
                .iter()
                .map(|url| (url.clone(), self.output_dir.join(filename_from_url(url))))
                .collect()),
        }
    }

    fn info_dict(&self, url: &str) -> InfoDict {
        InfoDict::from_value(serde_json::json!({
            "url": url,
            "format_id": self.format_id,
        }))
    }

    /// Execute the download command
    pub fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let targets = self.targets()?;
        info!(
            count = targets.len(),
            engine = ?cli.engine,
            "Starting downloads"
        );

        let reports = match cli.engine {
            Engine::Sync => self.run_sync(cli, &targets, shutdown)?,
            Engine::Async => self.run_async(cli, &targets, shutdown)?,
        };

        match cli.output_format {
            OutputFormat::Json => output_json(&reports)?,
            OutputFormat::Human => output_human(&reports),
        }

        let failed = reports.iter().filter(|r| !r.success).count();
        if failed > 0 {
            return Err(CliError::DownloadsFailed {
                failed,
                total: reports.len(),
            });
        }
        Ok(())
    }

    fn run_sync(
        &self,
        cli: &Cli,
        targets: &[(String, PathBuf)],
        shutdown: SharedShutdown,
    ) -> Result<Vec<FileReport>, CliError> {
        let bar = create_progress_bar(cli.no_progress);
        let fd = FileDownloader::new(cli.file_downloader_options()?)
            .with_shutdown(shutdown.clone())
            .with_progress_hook(progress_hook(bar.clone()));
        let transport = ReqwestTransport::new(Duration::from_secs(cli.timeout))?;
        let downloader = HttpDownloader::new(fd, Arc::new(transport));

        let reports = self.run_each(&downloader, targets, 1, &shutdown, &bar, &|| {});
        bar.finish_and_clear();
        Ok(reports)
    }

    /// Same loop as the sync engine, with `--concurrency` callers blocked on
    /// the background manager at once
    fn run_async(
        &self,
        cli: &Cli,
        targets: &[(String, PathBuf)],
        shutdown: SharedShutdown,
    ) -> Result<Vec<FileReport>, CliError> {
        let config = cli.download_config()?;
        let bar = create_progress_bar(cli.no_progress);
        bar.set_length(targets.len() as u64);

        let manager = Arc::new(AsyncDownloadManager::new(
            config.clone(),
            Some(progress_callback(bar.clone())),
        ));
        let downloader = AsyncFileDownloader::new(manager.clone(), &config);
        let workers = config.max_concurrent;

        let reports =
            self.run_each(&downloader, targets, workers, &shutdown, &bar, &|| bar.inc(1));
        manager.stop();
        bar.finish_and_clear();
        Ok(reports)
    }

    /// Download every target through `downloader` on up to `workers` threads,
    /// keeping reports in target order
    fn run_each(
        &self,
        downloader: &dyn Downloader,
        targets: &[(String, PathBuf)],
        workers: usize,
        shutdown: &SharedShutdown,
        bar: &ProgressBar,
        on_finished: &(dyn Fn() + Sync),
    ) -> Vec<FileReport> {
        let next = AtomicUsize::new(0);
        let workers = workers.clamp(1, targets.len().max(1));
        let mut reports: Vec<(usize, FileReport)> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| {
                    self.drain(downloader, targets, &next, shutdown, bar, on_finished)
                }));
            }
            let mut reports = Vec::with_capacity(targets.len());
            for handle in handles {
                match handle.join() {
                    Ok(done) => reports.extend(done),
                    Err(_) => error!("Download worker panicked"),
                }
            }
            reports
        });
        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }

    /// Take targets off the shared cursor until none are left
    fn drain(
        &self,
        downloader: &dyn Downloader,
        targets: &[(String, PathBuf)],
        next: &AtomicUsize,
        shutdown: &SharedShutdown,
        bar: &ProgressBar,
        on_finished: &(dyn Fn() + Sync),
    ) -> Vec<(usize, FileReport)> {
        let mut done = Vec::new();
        loop {
            let index = next.fetch_add(1, Ordering::SeqCst);
            let Some((url, filename)) = targets.get(index) else {
                return done;
            };
            let report = self.download_one(downloader, url, filename, shutdown, bar);
            on_finished();
            done.push((index, report));
        }
    }

    fn download_one(
        &self,
        downloader: &dyn Downloader,
        url: &str,
        filename: &Path,
        shutdown: &SharedShutdown,
        bar: &ProgressBar,
    ) -> FileReport {
        let mut report = FileReport::new(url, filename);
        if shutdown.is_shutdown_requested() {
            report.error = Some("cancelled".to_string());
            return report;
        }
        bar.set_message(filename.display().to_string());
        match downloader.download(filename, &self.info_dict(url)) {
            Ok(outcome) => {
                report.success = outcome.success;
                report.skipped = !outcome.did_real_work;
                report.bytes = std::fs::metadata(filename).ok().map(|m| m.len());
                if !outcome.success {
                    report.error = Some("download did not complete".to_string());
                }
            }
            Err(e) => {
                error!(url = %url, error = %e, "Download failed");
                report.error = Some(e.to_string());
            }
        }
        report
    }
}

/// Output results as a single JSON object
fn output_json(reports: &[FileReport]) -> Result<(), CliError> {
    let succeeded = reports.iter().filter(|r| r.success).count();
    let output = serde_json::json!({
        "status": if succeeded == reports.len() { "success" } else { "error" },
        "succeeded": succeeded,
        "failed": reports.len() - succeeded,
        "files": reports,
    });
    let line = serde_json::to_string(&output)
        .map_err(|e| CliError::ConfigurationError(format!("failed to encode output: {e}")))?;
    println!("{line}");
    Ok(())
}

/// Output results in human-readable format
fn output_human(reports: &[FileReport]) {
    for report in reports {
        let size = report
            .bytes
            .map(|b| format_bytes(b as f64))
            .unwrap_or_else(|| "N/A".to_string());
        if report.skipped {
            println!("Already downloaded: {} ({size})", report.filename.display());
        } else if report.success {
            println!("Downloaded: {} ({size})", report.filename.display());
        } else {
            eprintln!(
                "Failed: {} -> {}: {}",
                report.url,
                report.filename.display(),
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    let failed = reports.iter().filter(|r| !r.success).count();
    if failed > 0 {
        warn!(failed, total = reports.len(), "Some downloads failed");
    }
}

// ─── Progress bar ────────────────────────────────────────────────────────────

/// Create progress bar with style, hidden when disabled
fn create_progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    match ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
    ) {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => warn!(error = %e, "Invalid progress bar template"),
    }
    pb
}

/// Hook driving the bar from synchronous progress
fn progress_hook(bar: ProgressBar) -> ProgressHook {
    Arc::new(move |status: &ProgressStatus| {
        match status.status {
            DownloadPhase::Downloading => {
                if let Some(total) = status.total_bytes.or(status.total_bytes_estimate) {
                    bar.set_length(total);
                }
                if let Some(done) = status.downloaded_bytes {
                    bar.set_position(done);
                }
            }
            DownloadPhase::Finished => {
                bar.println(format!("[download] {}", status.format_line()));
                bar.reset();
            }
            DownloadPhase::Error => bar.reset(),
        }
        Ok(())
    })
}

/// Callback naming the most recent transfer on the bar
fn progress_callback(bar: ProgressBar) -> ProgressCallback {
    Arc::new(move |progress: &DownloadProgress| {
        let name = progress
            .task
            .filename
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        bar.set_message(format!("{name} {}", format_percent(progress.percentage)));
        Ok(())
    })
}
