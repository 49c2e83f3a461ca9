//! Blocking HTTP transfer for the synchronous engine.
//!
//! [`HttpDownloader`] resumes from an existing `.part` file with a `Range`
//! request, adapts its read size to the observed throughput, honors the byte
//! rate ceiling, verifies the announced length and renames the finished file.
//! The network side sits behind [`BlockingTransport`] so it can be replaced
//! in tests.

use crate::downloader::file_downloader::{DownloadOutcome, Downloader, FileDownloader, RealDownload};
use crate::downloader::job::InfoDict;
use crate::downloader::progress::{
    best_block_size, calc_eta, calc_speed, DownloadPhase, ProgressStatus,
};
use crate::downloader::retry::{AttemptError, RetryManager, RetryPolicy};
use crate::downloader::DownloadError;
use crate::metrics::DownloadMetrics;
use reqwest::header::{LAST_MODIFIED, RANGE};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Status returned when a range starts past the end of the resource
const RANGE_NOT_SATISFIABLE: u16 = 416;
const PARTIAL_CONTENT: u16 = 206;

/// An opened response body
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// `Content-Length` of this response (the remaining bytes when resuming)
    pub content_length: Option<u64>,
    /// Raw `Last-Modified` header
    pub last_modified: Option<String>,
    /// Body reader
    pub body: Box<dyn Read + Send>,
}

impl TransportResponse {
    /// Whether the server honored the range request
    pub fn is_partial(&self) -> bool {
        self.status == PARTIAL_CONTENT
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

/// Opens a URL, optionally from a byte offset.
///
/// Implementations return `Ok` for success statuses and for 416 so the caller
/// can decide whether the part file is already complete; other error
/// statuses become [`DownloadError::HttpStatus`].
pub trait BlockingTransport: Send + Sync {
    /// Open `url`, sending `Range: bytes=<start>-` when `range_start` is set
    fn open(&self, url: &str, range_start: Option<u64>) -> Result<TransportResponse, DownloadError>;
}

/// [`BlockingTransport`] over `reqwest::blocking`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    /// Client with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("media-downloader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::NetworkError(e.to_string()))?;
        Ok(Self { client })
    }
}

impl BlockingTransport for ReqwestTransport {
    fn open(
        &self,
        url: &str,
        range_start: Option<u64>,
    ) -> Result<TransportResponse, DownloadError> {
        let mut request = self.client.get(url);
        if let Some(start) = range_start {
            request = request.header(RANGE, format!("bytes={start}-"));
        }
        let response = request
            .send()
            .map_err(|e| DownloadError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() && status != RANGE_NOT_SATISFIABLE {
            return Err(DownloadError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(TransportResponse {
            status,
            content_length: response.content_length(),
            last_modified,
            body: Box::new(response),
        })
    }
}

struct Transfer {
    bytes: u64,
    last_modified: Option<String>,
}

/// Synchronous HTTP downloader
pub struct HttpDownloader {
    fd: FileDownloader,
    transport: Arc<dyn BlockingTransport>,
}

impl HttpDownloader {
    /// Pair a download policy with a transport
    pub fn new(fd: FileDownloader, transport: Arc<dyn BlockingTransport>) -> Self {
        Self { fd, transport }
    }

    /// Underlying policy
    pub fn file_downloader(&self) -> &FileDownloader {
        &self.fd
    }

    /// Download a subtitle, using the subtitle sleep interval
    pub fn download_subtitle(
        &self,
        filename: &Path,
        info_dict: &InfoDict,
    ) -> Result<DownloadOutcome, DownloadError> {
        self.fd.download(self, filename, info_dict, true)
    }

    fn transfer(
        &self,
        fd: &FileDownloader,
        url: &str,
        filename: &Path,
        tmpfilename: &Path,
        info_dict: &InfoDict,
        started: Instant,
    ) -> Result<Transfer, DownloadError> {
        let options = fd.options();
        let is_stdout = tmpfilename == Path::new("-");
        let mut resume_len = if options.continuedl && !is_stdout {
            fs::metadata(tmpfilename).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        if resume_len > 0 {
            fd.report_resuming_byte(resume_len);
        }

        let response = self
            .transport
            .open(url, (resume_len > 0).then_some(resume_len))?;

        if response.status == RANGE_NOT_SATISFIABLE {
            if resume_len == 0 {
                return Err(DownloadError::HttpStatus {
                    status: RANGE_NOT_SATISFIABLE,
                    url: url.to_string(),
                });
            }
            info!("[download] The part file is already complete");
            return Ok(Transfer {
                bytes: resume_len,
                last_modified: response.last_modified,
            });
        }
        if resume_len > 0 && !response.is_partial() {
            fd.report_unable_to_resume();
            resume_len = 0;
        }

        let data_len = response.content_length.map(|len| len + resume_len);
        let last_modified = response.last_modified;
        let mut body = response.body;
        let mut out = fd.sanitize_open(tmpfilename, resume_len > 0)?;

        let format_id = info_dict.format_id().map(str::to_string);
        let tmp_display = (tmpfilename != filename).then(|| tmpfilename.to_path_buf());
        let mut byte_counter = resume_len;
        let mut block_size = options.buffersize.max(1);
        let mut buf = vec![0u8; block_size];
        let start = Instant::now();

        loop {
            if fd.shutdown_requested() {
                return Err(DownloadError::Cancelled);
            }
            buf.resize(block_size, 0);
            let before = Instant::now();
            let read = body
                .read(&mut buf)
                .map_err(|e| DownloadError::NetworkError(e.to_string()))?;
            let after = Instant::now();
            if read == 0 {
                break;
            }
            out.write_all(&buf[..read])?;
            byte_counter += read as u64;

            if !options.noresizebuffer {
                block_size = best_block_size(after - before, read as u64);
            }
            fd.slow_down(start, Instant::now(), byte_counter - resume_len);

            let now = Instant::now();
            let mut status = ProgressStatus::new(DownloadPhase::Downloading, filename);
            status.tmpfilename = tmp_display.clone();
            status.format_id = format_id.clone();
            status.downloaded_bytes = Some(byte_counter);
            status.total_bytes = data_len;
            status.total_bytes_estimate = info_dict.filesize_approx();
            status.elapsed = Some(now - started);
            status.speed = calc_speed(start, now, byte_counter - resume_len);
            status.eta = data_len.and_then(|len| {
                calc_eta(
                    start,
                    now,
                    Some(len - resume_len),
                    byte_counter - resume_len,
                )
            });
            fd.report_progress(status, info_dict);
        }
        out.flush()?;
        drop(out);

        if let Some(expected) = data_len {
            if byte_counter != expected {
                return Err(DownloadError::ContentTooShort {
                    expected,
                    actual: byte_counter,
                });
            }
        }
        Ok(Transfer {
            bytes: byte_counter,
            last_modified,
        })
    }
}

impl RealDownload for HttpDownloader {
    #[instrument(skip_all, fields(filename = %filename.display()))]
    fn real_download(
        &self,
        fd: &FileDownloader,
        filename: &Path,
        info_dict: &InfoDict,
    ) -> Result<bool, DownloadError> {
        let url = info_dict
            .url()
            .ok_or_else(|| DownloadError::ValidationError("info dict has no url".to_string()))?;
        let tmpfilename: PathBuf = fd.temp_name(filename);
        fd.report_destination(filename);

        let policy = RetryPolicy::new().with_sleep_func(fd.options().retry_sleep_http.clone());
        let manager = RetryManager::new(fd.options().retries, policy);
        let started = Instant::now();
        let metrics = DownloadMetrics::start("sync");

        let result = manager.run(|attempt| {
            debug!(attempt = attempt.number, "Starting HTTP transfer");
            self.transfer(fd, url, filename, &tmpfilename, info_dict, started)
                .map_err(|e| {
                    if e.is_retryable() {
                        AttemptError::Retry(e)
                    } else {
                        AttemptError::Abort(e)
                    }
                })
        });

        let transfer = match result {
            Ok(Some(transfer)) => transfer,
            Ok(None) => return Ok(false),
            Err(e) => {
                match &e {
                    DownloadError::Cancelled => metrics.record_cancelled(),
                    other => metrics.record_failure(&other.to_string()),
                }
                let mut status = ProgressStatus::new(DownloadPhase::Error, filename);
                status.tmpfilename = Some(tmpfilename.clone());
                fd.report_progress(status, info_dict);
                return Err(e);
            }
        };

        if !fd.try_rename(&tmpfilename, filename) {
            return Ok(false);
        }
        if fd.options().updatetime && filename != Path::new("-") {
            if let Some(last_modified) = &transfer.last_modified {
                fd.try_utime(filename, last_modified);
            }
        }

        metrics.record_success(transfer.bytes);
        let mut status = ProgressStatus::new(DownloadPhase::Finished, filename);
        status.downloaded_bytes = Some(transfer.bytes);
        status.total_bytes = Some(transfer.bytes);
        status.elapsed = Some(started.elapsed());
        status.format_id = info_dict.format_id().map(str::to_string);
        info!("[download] {}", status.format_line());
        fd.report_progress(status, info_dict);
        Ok(true)
    }
}

impl Downloader for HttpDownloader {
    fn download(
        &self,
        filename: &Path,
        info_dict: &InfoDict,
    ) -> Result<DownloadOutcome, DownloadError> {
        self.fd.download(self, filename, info_dict, false)
    }
}
