//! Download task structures and status tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Opaque extractor metadata passed through to progress hooks.
///
/// Cloning shares the underlying map; consumers read it and never mutate it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoDict(Arc<Map<String, Value>>);

impl InfoDict {
    /// Wrap an extractor map
    pub fn new(map: Map<String, Value>) -> Self {
        Self(Arc::new(map))
    }

    /// Wrap a JSON value; anything but an object becomes an empty dict
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::new(map),
            _ => Self::default(),
        }
    }

    /// Raw field access
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Underlying map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Media URL (`url`)
    pub fn url(&self) -> Option<&str> {
        self.get("url").and_then(Value::as_str)
    }

    /// Format identifier (`format_id`)
    pub fn format_id(&self) -> Option<&str> {
        self.get("format_id").and_then(Value::as_str)
    }

    /// Exact size in bytes (`filesize`)
    pub fn filesize(&self) -> Option<u64> {
        self.get("filesize").and_then(Value::as_u64)
    }

    /// Approximate size in bytes (`filesize_approx`)
    pub fn filesize_approx(&self) -> Option<u64> {
        self.get("filesize_approx").and_then(Value::as_u64)
    }

    /// Whether two handles share the same map
    pub fn ptr_eq(&self, other: &InfoDict) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Map<String, Value>> for InfoDict {
    fn from(map: Map<String, Value>) -> Self {
        Self::new(map)
    }
}

/// Identifier of a task: hash of `(url, filename)`.
///
/// Stable across runs; the same pair re-queued maps to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Derive the id for a `(url, filename)` pair
    pub fn derive(url: &str, filename: &Path) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"_");
        hasher.update(filename.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Hex form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Registered, not started
    #[default]
    Pending,
    /// A transfer attempt is running or backing off
    Downloading,
    /// The final file is in place
    Completed,
    /// All attempts failed
    Failed,
    /// Stopped on request
    Cancelled,
}

impl DownloadStatus {
    /// Whether the task reached a state it never leaves
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One requested transfer
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Hash of `(url, filename)`
    pub task_id: TaskId,
    /// Source URL
    pub url: String,
    /// Destination path
    pub filename: PathBuf,
    /// Extractor metadata passthrough
    pub info_dict: InfoDict,
    /// Format being downloaded
    pub format_id: String,
    /// Size in bytes, when known up front or from the response
    pub expected_size: Option<u64>,
    /// Bytes written by the current attempt
    pub downloaded_bytes: u64,
    /// Lifecycle state
    pub status: DownloadStatus,
    /// 0-based index of the current attempt
    pub retry_count: u32,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Last failure message
    pub error: Option<String>,
    /// When the first attempt started
    pub start_time: Option<DateTime<Utc>>,
    /// Cooperative cancellation signal, shared by every copy of this task
    pub cancel: CancellationToken,
}

impl DownloadTask {
    /// Create a pending task
    pub fn new(
        url: impl Into<String>,
        filename: impl Into<PathBuf>,
        info_dict: InfoDict,
        format_id: impl Into<String>,
        expected_size: Option<u64>,
    ) -> Self {
        let url = url.into();
        let filename = filename.into();
        Self {
            task_id: TaskId::derive(&url, &filename),
            url,
            filename,
            info_dict,
            format_id: format_id.into(),
            expected_size,
            downloaded_bytes: 0,
            status: DownloadStatus::Pending,
            retry_count: 0,
            max_retries: 0,
            error: None,
            start_time: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validate task parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        if self.filename.as_os_str().is_empty() {
            return Err("Filename cannot be empty".to_string());
        }
        Ok(())
    }

    /// Completion percentage when the size is known
    pub fn percentage(&self) -> Option<f64> {
        crate::downloader::progress::calc_percent(self.downloaded_bytes, self.expected_size)
    }

    /// JSON summary for reports
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "task_id": self.task_id,
            "url": self.url,
            "filename": self.filename.display().to_string(),
            "format_id": self.format_id,
            "status": self.status,
            "downloaded_bytes": self.downloaded_bytes,
            "expected_size": self.expected_size,
            "retry_count": self.retry_count,
            "error": self.error,
        })
    }
}
