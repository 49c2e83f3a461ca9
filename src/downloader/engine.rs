//! Concurrent download engine.
//!
//! [`AsyncDownloadEngine`] keeps a table of [`DownloadTask`]s and runs their
//! transfers on the Tokio runtime, at most `max_concurrent` at a time. Each
//! transfer streams into `<filename>.part`, checks the size and renames the
//! file into place; every failure removes the part file. Attempts are retried
//! with exponential backoff, and cancellation (per task, on engine close, or
//! on process shutdown) stops a transfer between chunks.

use crate::downloader::config::{calculate_backoff, DownloadConfig};
use crate::downloader::file_downloader::temp_name;
use crate::downloader::job::{DownloadStatus, DownloadTask, InfoDict, TaskId};
use crate::downloader::progress::{invoke_hook, ProgressCallback, ProgressState};
use crate::downloader::DownloadError;
use crate::metrics::{record_retry_backoff, DownloadMetrics};
use crate::shutdown;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

/// Streamed response body
pub struct HttpResponse {
    /// `Content-Length`, when the server sent one
    pub content_length: Option<u64>,
    /// Body chunks
    pub body: BoxStream<'static, Result<Bytes, DownloadError>>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Async HTTP GET used by the engine.
///
/// Implementations return [`DownloadError::HttpStatus`] for non-success
/// statuses.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issue a GET for `url`
    async fn get(&self, url: &str) -> Result<HttpResponse, DownloadError>;
}

/// [`HttpClient`] over a pooled `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Client whose requests time out after `config.timeout`
    pub fn new(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_concurrent)
            .user_agent(concat!("media-downloader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::NetworkError(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| DownloadError::NetworkError(e.to_string())))
            .boxed();
        Ok(HttpResponse {
            content_length,
            body,
        })
    }
}

/// Aggregate counts over the task table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadStats {
    /// Registered tasks
    pub total: usize,
    /// Not started
    pub pending: usize,
    /// Running or backing off
    pub downloading: usize,
    /// Final file in place
    pub completed: usize,
    /// Out of attempts
    pub failed: usize,
    /// Stopped on request
    pub cancelled: usize,
    /// Bytes written across all tasks
    pub downloaded_bytes: u64,
    /// Completed share of finished tasks, `0.0` when none finished
    pub success_rate: f64,
}

struct EngineInner {
    config: DownloadConfig,
    client: Arc<dyn HttpClient>,
    semaphore: Arc<Semaphore>,
    tasks: RwLock<HashMap<TaskId, DownloadTask>>,
    progress_callback: Option<ProgressCallback>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Concurrent download engine.
///
/// Cheap to clone; clones share the task table, the semaphore and the
/// cancellation root. Dropping the last clone cancels whatever is still
/// running. Call [`close`](Self::close) to also wait for those transfers to
/// wind down.
#[derive(Clone)]
pub struct AsyncDownloadEngine {
    inner: Arc<EngineInner>,
    /// `None` on the handles given to spawned transfers, so they never keep
    /// the engine alive on their own.
    _owner: Option<Arc<DropGuard>>,
}

impl std::fmt::Debug for AsyncDownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDownloadEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl AsyncDownloadEngine {
    /// Start an engine backed by reqwest
    pub fn start(
        config: DownloadConfig,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<Self, DownloadError> {
        let client = ReqwestClient::new(&config)?;
        Self::with_client(config, Arc::new(client), progress_callback)
    }

    /// Start an engine with a custom HTTP client
    pub fn with_client(
        config: DownloadConfig,
        client: Arc<dyn HttpClient>,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<Self, DownloadError> {
        config.validate()?;
        let cancel = match shutdown::get_global_shutdown() {
            Some(coordinator) => coordinator.child_token(),
            None => CancellationToken::new(),
        };
        info!(
            max_concurrent = config.max_concurrent,
            max_retries = config.max_retries,
            "Download engine started"
        );
        let owner = Arc::new(cancel.clone().drop_guard());
        Ok(Self {
            inner: Arc::new(EngineInner {
                semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                client,
                tasks: RwLock::new(HashMap::new()),
                progress_callback,
                cancel,
                tracker: TaskTracker::new(),
            }),
            _owner: Some(owner),
        })
    }

    /// Handle for spawned transfers
    fn worker_handle(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _owner: None,
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    /// Stop in-flight transfers and wait for them to wind down.
    ///
    /// The HTTP client stays alive until the last clone is dropped.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Download engine closed");
    }

    /// Whether the engine is shutting down
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Register a new pending task and return its id.
    ///
    /// A task with the same `(url, filename)` replaces the old entry.
    pub async fn add_task(
        &self,
        url: impl Into<String>,
        filename: impl Into<PathBuf>,
        info_dict: InfoDict,
        format_id: impl Into<String>,
        expected_size: Option<u64>,
    ) -> Result<TaskId, DownloadError> {
        let task = DownloadTask::new(url, filename, info_dict, format_id, expected_size)
            .with_max_retries(self.inner.config.max_retries);
        task.validate().map_err(DownloadError::ValidationError)?;
        Ok(self.register_task(task).await)
    }

    /// Register a task built elsewhere, keeping its cancellation token
    pub async fn register_task(&self, task: DownloadTask) -> TaskId {
        let task_id = task.task_id.clone();
        debug!(task_id = %task_id, url = %task.url, "Task registered");
        self.inner.tasks.write().await.insert(task_id.clone(), task);
        task_id
    }

    /// Copy of one task
    pub async fn get_task_status(&self, task_id: &TaskId) -> Option<DownloadTask> {
        self.inner.tasks.read().await.get(task_id).cloned()
    }

    /// Forget a task, returning its last state
    pub async fn remove_task(&self, task_id: &TaskId) -> Option<DownloadTask> {
        self.inner.tasks.write().await.remove(task_id)
    }

    /// Copy of the whole table
    pub async fn get_all_tasks(&self) -> HashMap<TaskId, DownloadTask> {
        self.inner.tasks.read().await.clone()
    }

    /// Cancel a task that has not finished. Returns whether it was cancelled.
    pub async fn cancel_task(&self, task_id: &TaskId) -> bool {
        let mut tasks = self.inner.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = DownloadStatus::Cancelled;
                task.cancel.cancel();
                info!(task_id = %task_id, "Task cancelled");
                true
            }
            _ => false,
        }
    }

    /// Counts by status
    pub async fn get_download_stats(&self) -> DownloadStats {
        let tasks = self.inner.tasks.read().await;
        let mut stats = DownloadStats {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks.values() {
            match task.status {
                DownloadStatus::Pending => stats.pending += 1,
                DownloadStatus::Downloading => stats.downloading += 1,
                DownloadStatus::Completed => stats.completed += 1,
                DownloadStatus::Failed => stats.failed += 1,
                DownloadStatus::Cancelled => stats.cancelled += 1,
            }
            stats.downloaded_bytes += task.downloaded_bytes;
        }
        let finished = stats.completed + stats.failed + stats.cancelled;
        if finished > 0 {
            stats.success_rate = stats.completed as f64 / finished as f64;
        }
        stats
    }

    /// Apply `f` to a task unless it already reached a terminal state.
    async fn update_task(&self, task_id: &TaskId, f: impl FnOnce(&mut DownloadTask)) {
        let mut tasks = self.inner.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if !task.status.is_terminal() {
                f(task);
            }
        }
    }

    async fn set_status(&self, task_id: &TaskId, status: DownloadStatus) {
        self.update_task(task_id, |task| task.status = status).await;
    }

    fn is_cancelled(&self, token: &CancellationToken) -> bool {
        token.is_cancelled() || self.inner.cancel.is_cancelled()
    }

    async fn cancelled(&self, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.inner.cancel.cancelled() => {}
        }
    }

    async fn mark_cancelled(&self, task_id: &TaskId, metrics: &DownloadMetrics) {
        let mut tasks = self.inner.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if !task.status.is_terminal() {
                task.status = DownloadStatus::Cancelled;
            }
        }
        metrics.record_cancelled();
    }

    /// Download one registered task with retries.
    ///
    /// Returns `Ok(true)` once the final file is in place, `Ok(false)` when
    /// the task failed or was cancelled, and `Err` for an unknown id. A task
    /// that already finished is not run again.
    pub async fn download_file(&self, task_id: &TaskId) -> Result<bool, DownloadError> {
        let task = self
            .get_task_status(task_id)
            .await
            .ok_or_else(|| DownloadError::ValidationError(format!("unknown task {task_id}")))?;
        if task.status.is_terminal() {
            debug!(task_id = %task_id, status = ?task.status, "Task already finished");
            return Ok(task.status == DownloadStatus::Completed);
        }
        let span = info_span!("download", task_id = %task_id, filename = %task.filename.display());
        self.run_with_retries(task).instrument(span).await
    }

    async fn run_with_retries(&self, task: DownloadTask) -> Result<bool, DownloadError> {
        let task_id = task.task_id.clone();
        let token = task.cancel.clone();
        let metrics = DownloadMetrics::start("async");

        if self.is_cancelled(&token) {
            self.mark_cancelled(&task_id, &metrics).await;
            return Ok(false);
        }

        if let Some(expected) = task.expected_size {
            if let Ok(meta) = fs::metadata(&task.filename).await {
                if meta.is_file() && meta.len() == expected {
                    info!("[download] {} has already been downloaded", task.filename.display());
                    self.update_task(&task_id, |t| {
                        t.status = DownloadStatus::Completed;
                        t.downloaded_bytes = expected;
                    })
                    .await;
                    return Ok(true);
                }
            }
        }

        self.update_task(&task_id, |t| {
            t.status = DownloadStatus::Downloading;
            t.start_time.get_or_insert_with(Utc::now);
        })
        .await;

        let max_retries = task.max_retries;
        for attempt in 0..=max_retries {
            if self.is_cancelled(&token) {
                self.mark_cancelled(&task_id, &metrics).await;
                return Ok(false);
            }
            self.update_task(&task_id, |t| {
                t.retry_count = attempt;
                t.status = DownloadStatus::Downloading;
            })
            .await;

            match self.download_single_file(&task_id, &token).await {
                Ok(bytes) => {
                    self.update_task(&task_id, |t| {
                        t.status = DownloadStatus::Completed;
                        t.downloaded_bytes = bytes;
                        t.error = None;
                    })
                    .await;
                    metrics.record_success(bytes);
                    return Ok(true);
                }
                Err(DownloadError::Cancelled) => {
                    self.mark_cancelled(&task_id, &metrics).await;
                    return Ok(false);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(attempt = attempt + 1, error = %message, "Download attempt failed");
                    self.update_task(&task_id, |t| t.error = Some(message)).await;

                    if attempt < max_retries {
                        let delay = calculate_backoff(self.inner.config.retry_delay, attempt);
                        record_retry_backoff("async", delay, attempt + 1);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancelled(&token) => {
                                self.mark_cancelled(&task_id, &metrics).await;
                                return Ok(false);
                            }
                        }
                    }
                }
            }
        }

        self.set_status(&task_id, DownloadStatus::Failed).await;
        let error = self
            .get_task_status(&task_id)
            .await
            .and_then(|t| t.error)
            .unwrap_or_default();
        metrics.record_failure(&error);
        Ok(false)
    }

    /// One attempt: stream into the part file, verify and rename.
    ///
    /// The part file is removed on any failure.
    async fn download_single_file(
        &self,
        task_id: &TaskId,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let _permit = tokio::select! {
            permit = self.inner.semaphore.clone().acquire_owned() => permit
                .map_err(|_| DownloadError::ManagerError("engine semaphore closed".to_string()))?,
            _ = self.cancelled(token) => return Err(DownloadError::Cancelled),
        };

        let task = self
            .get_task_status(task_id)
            .await
            .ok_or_else(|| DownloadError::ValidationError(format!("unknown task {task_id}")))?;
        let part = temp_name(&task.filename, false);

        match self.write_part(&task, &part, token).await {
            Ok(bytes) => match fs::rename(&part, &task.filename).await {
                Ok(()) => Ok(bytes),
                Err(e) => {
                    remove_part(&part).await;
                    Err(DownloadError::FileAccess {
                        action: "rename",
                        path: part,
                        source: e,
                    })
                }
            },
            Err(e) => {
                remove_part(&part).await;
                Err(e)
            }
        }
    }

    async fn write_part(
        &self,
        task: &DownloadTask,
        part: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let response = tokio::select! {
            response = self.inner.client.get(&task.url) => response?,
            _ = self.cancelled(token) => return Err(DownloadError::Cancelled),
        };

        let total = task.expected_size.or(response.content_length);
        self.update_task(&task.task_id, |t| {
            t.downloaded_bytes = 0;
            if t.expected_size.is_none() {
                t.expected_size = total;
            }
        })
        .await;

        if let Some(parent) = task.filename.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(part).await.map_err(|e| DownloadError::FileAccess {
            action: "open",
            path: part.to_path_buf(),
            source: e,
        })?;

        let chunk_size = self.inner.config.chunk_size.max(1);
        let mut state = ProgressState::new(total);
        let mut body = response.body;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancelled(token) => return Err(DownloadError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            for piece in chunk.chunks(chunk_size) {
                if self.is_cancelled(token) {
                    return Err(DownloadError::Cancelled);
                }
                file.write_all(piece).await?;
                state.update(piece.len() as u64);
            }

            let downloaded = state.downloaded_bytes;
            self.update_task(&task.task_id, |t| t.downloaded_bytes = downloaded)
                .await;
            let now = Instant::now();
            if state.should_emit_update(now) {
                self.emit_progress(&task.task_id, &state, now).await;
                state.mark_emitted(now);
                debug!("{}", state.format_progress(now));
            }
        }
        file.flush().await?;
        drop(file);

        self.emit_progress(&task.task_id, &state, Instant::now()).await;

        if let Some(expected) = total {
            if state.downloaded_bytes != expected {
                return Err(DownloadError::ContentTooShort {
                    expected,
                    actual: state.downloaded_bytes,
                });
            }
        }
        Ok(state.downloaded_bytes)
    }

    async fn emit_progress(&self, task_id: &TaskId, state: &ProgressState, now: Instant) {
        let Some(callback) = &self.inner.progress_callback else {
            return;
        };
        if let Some(task) = self.get_task_status(task_id).await {
            let progress = state.snapshot(task, now);
            invoke_hook(callback.as_ref(), &progress);
        }
    }

    /// Download several tasks concurrently.
    ///
    /// One task's failure never affects another; errors and panics count as
    /// `false`. Dropping the returned future cancels the batch.
    pub async fn download_all(&self, task_ids: &[TaskId]) -> HashMap<TaskId, bool> {
        let mut batch = BatchGuard {
            tokens: {
                let tasks = self.inner.tasks.read().await;
                task_ids
                    .iter()
                    .filter_map(|id| tasks.get(id).map(|t| t.cancel.clone()))
                    .collect()
            },
        };

        let handles: Vec<_> = task_ids
            .iter()
            .map(|task_id| {
                let handle = self.inner.tracker.spawn({
                    let engine = self.worker_handle();
                    let task_id = task_id.clone();
                    async move { engine.download_file(&task_id).await }
                });
                (task_id.clone(), handle)
            })
            .collect();

        let mut results = HashMap::with_capacity(handles.len());
        for (task_id, handle) in handles {
            let ok = match handle.await {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => {
                    warn!(task_id = %task_id, error = %e, "Download task failed");
                    false
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Download task panicked");
                    false
                }
            };
            results.insert(task_id, ok);
        }
        batch.tokens.clear();
        results
    }
}

/// Cancels a batch whose `download_all` future was dropped early
struct BatchGuard {
    tokens: Vec<CancellationToken>,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        for token in &self.tokens {
            token.cancel();
        }
    }
}

async fn remove_part(part: &Path) {
    match fs::remove_file(part).await {
        Ok(()) => debug!(path = %part.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %part.display(), error = %e, "Failed to remove partial file"),
    }
}
