//! Background download manager.
//!
//! [`AsyncDownloadManager`] owns a dedicated OS thread running a
//! single-threaded Tokio runtime and one [`AsyncDownloadEngine`]. Synchronous
//! callers enqueue downloads and poll their status; the worker drains the
//! queue every [`WORKER_POLL_INTERVAL`], runs each batch concurrently and files
//! the results under completed or failed.
//!
//! All shared state sits behind one mutex that is never held across an
//! await point.

use crate::downloader::config::DownloadConfig;
use crate::downloader::engine::{AsyncDownloadEngine, HttpClient, ReqwestClient};
use crate::downloader::job::{DownloadStatus, DownloadTask, InfoDict, TaskId};
use crate::downloader::progress::{invoke_hook, DownloadProgress, ProgressCallback};
use crate::downloader::DownloadError;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause between queue drains
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long [`AsyncDownloadManager::stop`] waits for the worker thread
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct ManagerState {
    running: bool,
    queue: VecDeque<DownloadTask>,
    active: HashMap<TaskId, DownloadTask>,
    completed: HashMap<TaskId, DownloadTask>,
    failed: HashMap<TaskId, DownloadTask>,
}

type SharedState = Arc<Mutex<ManagerState>>;

fn lock(state: &Mutex<ManagerState>) -> MutexGuard<'_, ManagerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Worker {
    thread: JoinHandle<()>,
    done: mpsc::Receiver<()>,
    stop: CancellationToken,
}

/// Thread-hosted download queue over the concurrent engine
pub struct AsyncDownloadManager {
    config: DownloadConfig,
    client: Option<Arc<dyn HttpClient>>,
    progress_callback: Option<ProgressCallback>,
    state: SharedState,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for AsyncDownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDownloadManager")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AsyncDownloadManager {
    /// Manager whose engine uses reqwest
    pub fn new(config: DownloadConfig, progress_callback: Option<ProgressCallback>) -> Self {
        Self {
            config,
            client: None,
            progress_callback,
            state: Arc::new(Mutex::new(ManagerState::default())),
            worker: Mutex::new(None),
        }
    }

    /// Manager whose engine uses `client`
    pub fn with_client(
        config: DownloadConfig,
        client: Arc<dyn HttpClient>,
        progress_callback: Option<ProgressCallback>,
    ) -> Self {
        let mut manager = Self::new(config, progress_callback);
        manager.client = Some(client);
        manager
    }

    /// Whether the worker is running
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Downloads waiting for the next drain
    pub fn queue_len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Start the worker thread. Idempotent.
    pub fn start(&self) -> Result<(), DownloadError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }

        let client: Arc<dyn HttpClient> = match &self.client {
            Some(client) => client.clone(),
            None => Arc::new(ReqwestClient::new(&self.config)?),
        };
        let engine = AsyncDownloadEngine::with_client(
            self.config.clone(),
            client,
            Some(self.tracking_callback()),
        )?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DownloadError::ManagerError(format!("failed to build runtime: {e}")))?;

        lock(&self.state).running = true;
        let stop = CancellationToken::new();
        let (done_tx, done) = mpsc::channel();
        let state = self.state.clone();
        let worker_stop = stop.clone();
        let spawned = std::thread::Builder::new()
            .name("download-manager".to_string())
            .spawn(move || {
                runtime.block_on(run_worker(state, engine, worker_stop));
                let _ = done_tx.send(());
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                lock(&self.state).running = false;
                return Err(DownloadError::ManagerError(format!(
                    "failed to spawn worker thread: {e}"
                )));
            }
        };

        *worker = Some(Worker { thread, done, stop });
        info!("Download manager started");
        Ok(())
    }

    /// Stop the worker, cancelling in-flight transfers.
    ///
    /// Waits up to [`STOP_TIMEOUT`] for the thread; past that it is detached.
    pub fn stop(&self) {
        let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        lock(&self.state).running = false;
        worker.stop.cancel();
        match worker.done.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    error!("Download manager thread panicked");
                }
                info!("Download manager stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_secs = STOP_TIMEOUT.as_secs(),
                    "Download manager did not stop in time, detaching"
                );
            }
        }
    }

    /// Queue a download and return its id.
    ///
    /// Re-queueing a finished `(url, filename)` pair drops the old result;
    /// a pair that is still queued or active keeps its entry.
    pub fn add_download(
        &self,
        url: impl Into<String>,
        filename: impl Into<PathBuf>,
        info_dict: InfoDict,
        format_id: impl Into<String>,
        expected_size: Option<u64>,
    ) -> Result<TaskId, DownloadError> {
        let task = DownloadTask::new(url, filename, info_dict, format_id, expected_size)
            .with_max_retries(self.config.max_retries);
        task.validate().map_err(DownloadError::ValidationError)?;
        let task_id = task.task_id.clone();

        let mut state = lock(&self.state);
        state.completed.remove(&task_id);
        state.failed.remove(&task_id);
        let pending = state.active.contains_key(&task_id)
            || state.queue.iter().any(|t| t.task_id == task_id);
        if !pending {
            debug!(task_id = %task_id, "Download queued");
            state.queue.push_back(task);
        }
        Ok(task_id)
    }

    /// Latest known copy of a task: active, then completed, then failed.
    ///
    /// A task still waiting in the queue is `None`; poll again after the
    /// next drain.
    pub fn get_download_status(&self, task_id: &TaskId) -> Option<DownloadTask> {
        let state = lock(&self.state);
        state
            .active
            .get(task_id)
            .or_else(|| state.completed.get(task_id))
            .or_else(|| state.failed.get(task_id))
            .cloned()
    }

    /// Cancel an active download. Queued ones are not affected.
    pub fn cancel_download(&self, task_id: &TaskId) -> bool {
        let mut state = lock(&self.state);
        match state.active.get_mut(task_id) {
            Some(task) if !task.status.is_terminal() => {
                task.cancel.cancel();
                task.status = DownloadStatus::Cancelled;
                info!(task_id = %task_id, "Download cancelled");
                true
            }
            _ => false,
        }
    }

    /// Callback that mirrors engine progress into the active table before
    /// forwarding it.
    fn tracking_callback(&self) -> ProgressCallback {
        let state = self.state.clone();
        let user = self.progress_callback.clone();
        Arc::new(move |progress: &DownloadProgress| {
            {
                let mut state = lock(&state);
                if let Some(task) = state.active.get_mut(&progress.task.task_id) {
                    if task.status != DownloadStatus::Cancelled {
                        task.status = progress.task.status;
                    }
                    task.downloaded_bytes = progress.downloaded_bytes;
                    task.expected_size = progress.task.expected_size;
                }
            }
            if let Some(user) = &user {
                invoke_hook(user.as_ref(), progress);
            }
            Ok(())
        })
    }
}

impl Drop for AsyncDownloadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_worker(state: SharedState, engine: AsyncDownloadEngine, stop: CancellationToken) {
    debug!("Download manager worker running");
    loop {
        if stop.is_cancelled() || !lock(&state).running {
            break;
        }

        let batch: Vec<DownloadTask> = {
            let mut state = lock(&state);
            let batch: Vec<DownloadTask> = std::mem::take(&mut state.queue).into();
            for task in &batch {
                state.active.insert(task.task_id.clone(), task.clone());
            }
            batch
        };

        if !batch.is_empty() {
            debug!(count = batch.len(), "Starting download batch");
            let mut ids = Vec::with_capacity(batch.len());
            for task in batch {
                ids.push(engine.register_task(task).await);
            }

            let finished = tokio::select! {
                results = engine.download_all(&ids) => Some(results),
                _ = stop.cancelled() => None,
            };
            if finished.is_none() {
                engine.close().await;
            }
            settle(&state, &engine, &ids).await;
        }

        tokio::select! {
            _ = tokio::time::sleep(WORKER_POLL_INTERVAL) => {}
            _ = stop.cancelled() => {}
        }
    }
    engine.close().await;
    debug!("Download manager worker exited");
}

/// Move finished tasks from active to completed or failed, and drop them
/// from the engine's table.
async fn settle(state: &Mutex<ManagerState>, engine: &AsyncDownloadEngine, ids: &[TaskId]) {
    for task_id in ids {
        let final_task = engine.remove_task(task_id).await;
        let mut state = lock(state);
        let Some(active) = state.active.remove(task_id) else {
            continue;
        };
        let mut task = final_task.unwrap_or(active);
        if task.status == DownloadStatus::Completed {
            state.completed.insert(task_id.clone(), task);
        } else {
            if !task.status.is_terminal() {
                task.status = DownloadStatus::Failed;
            }
            state.failed.insert(task_id.clone(), task);
        }
    }
}
