//! # Media Downloader Library
//!
//! Download engines for media files found by an extractor: a resumable
//! single-file HTTP downloader and a concurrent engine with a background
//! manager that synchronous callers can drive.
//!
//! ## Features
//!
//! - **Resume**: `.part` files resumed with HTTP range requests
//! - **Retries**: one retry loop with pluggable sleep and reporting policies
//! - **Rate Limiting**: byte-rate ceiling with adaptive read sizes
//! - **Concurrency**: semaphore-bounded async transfers with per-task cancellation
//! - **Thread Bridge**: a dedicated runtime thread behind a blocking [`downloader::Downloader`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_downloader::downloader::{
//!     Downloader, FileDownloader, FileDownloaderOptions, HttpDownloader, InfoDict,
//!     ReqwestTransport,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let info = InfoDict::from_value(serde_json::json!({
//!     "url": "https://cdn.example.com/video.mp4",
//!     "format_id": "22",
//! }));
//!
//! let fd = FileDownloader::new(FileDownloaderOptions::default());
//! let transport = ReqwestTransport::new(Duration::from_secs(30))?;
//! let downloader = HttpDownloader::new(fd, Arc::new(transport));
//! let outcome = downloader.download(Path::new("video.mp4"), &info)?;
//! assert!(outcome.success);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`downloader`] - Both engines, retry, rate limiting and progress
//! - [`shutdown`] - Ctrl+C coordination shared by both engines
//! - [`metrics`] - Prometheus counters and histograms
//! - [`cli`] - The `media-downloader` command line

#![warn(missing_docs)]
#![warn(clippy::all)]

/// CLI command implementations
pub mod cli;

/// Download engines and their primitives
pub mod downloader;

/// Download metrics
pub mod metrics;

/// Graceful shutdown coordination
pub mod shutdown;
