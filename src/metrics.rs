//! Download metrics
//!
//! Both engines record through the `metrics` facade; nothing is exported
//! unless [`init_metrics`] installs the Prometheus recorder. Without it the
//! macros are no-ops.
//!
//! ## Metrics
//!
//! - `downloads_completed_total`, `downloads_failed_total`,
//!   `downloads_cancelled_total` (label `engine`)
//! - `download_retries_total` (label `engine`)
//! - `download_bytes_total`
//! - `download_duration_seconds`, `retry_backoff_duration_seconds`

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the Prometheus exporter on `addr`.
///
/// Idempotent. Outside a Tokio runtime the exporter runs on its own thread.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    if METRICS_INITIALIZED.load(Ordering::SeqCst) {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    describe_counter!(
        "downloads_completed_total",
        Unit::Count,
        "Downloads whose final file is in place"
    );
    describe_counter!(
        "downloads_failed_total",
        Unit::Count,
        "Downloads that ran out of attempts"
    );
    describe_counter!(
        "downloads_cancelled_total",
        Unit::Count,
        "Downloads stopped on request"
    );
    describe_counter!(
        "download_retries_total",
        Unit::Count,
        "Transfer attempts after the first"
    );
    describe_counter!(
        "download_bytes_total",
        Unit::Bytes,
        "Bytes written to disk by completed transfers"
    );
    describe_histogram!(
        "download_duration_seconds",
        Unit::Seconds,
        "Wall time of completed downloads"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Sleep before a retried attempt"
    );

    METRICS_INITIALIZED.store(true, Ordering::SeqCst);
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Whether the exporter is installed
pub fn is_initialized() -> bool {
    METRICS_INITIALIZED.load(Ordering::SeqCst)
}

/// Record a retry and the backoff preceding it
pub fn record_retry_backoff(engine: &'static str, duration: Duration, attempt: u32) {
    counter!("download_retries_total", "engine" => engine).increment(1);
    histogram!("retry_backoff_duration_seconds").record(duration.as_secs_f64());
    debug!(
        engine,
        attempt,
        backoff_ms = duration.as_millis() as u64,
        "Retry backoff recorded"
    );
}

/// Lifetime of one download, from first attempt to terminal state
#[derive(Debug)]
pub struct DownloadMetrics {
    engine: &'static str,
    start_time: Instant,
}

impl DownloadMetrics {
    /// Start tracking a download run by `engine` (`sync` or `async`)
    pub fn start(engine: &'static str) -> Self {
        Self {
            engine,
            start_time: Instant::now(),
        }
    }

    /// Record a completed download of `bytes`
    pub fn record_success(&self, bytes: u64) {
        let duration = self.start_time.elapsed();
        counter!("downloads_completed_total", "engine" => self.engine).increment(1);
        counter!("download_bytes_total").increment(bytes);
        histogram!("download_duration_seconds").record(duration.as_secs_f64());
        info!(
            engine = self.engine,
            bytes,
            duration_ms = duration.as_millis() as u64,
            "Download completed successfully"
        );
    }

    /// Record a download that ran out of attempts
    pub fn record_failure(&self, error: &str) {
        counter!("downloads_failed_total", "engine" => self.engine).increment(1);
        error!(
            engine = self.engine,
            error = %error,
            duration_ms = self.start_time.elapsed().as_millis() as u64,
            "Download failed"
        );
    }

    /// Record a download stopped on request
    pub fn record_cancelled(&self) {
        counter!("downloads_cancelled_total", "engine" => self.engine).increment(1);
        warn!(engine = self.engine, "Download cancelled");
    }
}
