//! Unit tests for retry policies across both engines

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use media_downloader::downloader::retry::{AttemptError, RetryEvent};
use media_downloader::downloader::{
    AsyncDownloadEngine, BlockingTransport, DownloadConfig, DownloadError, DownloadStatus,
    Downloader, FileDownloader, FileDownloaderOptions, HttpDownloader, InfoDict, RetryManager,
    RetryPolicy, SleepFunc, TransportResponse,
};
use tempfile::TempDir;

use crate::support::{payload, Route, RoutedClient};

/// Answers `status` for the first `failures` calls, then serves `body`
struct FlakyTransport {
    failures: usize,
    status: u16,
    body: Vec<u8>,
    calls: AtomicUsize,
}

impl FlakyTransport {
    fn new(failures: usize, status: u16, body: Vec<u8>) -> Self {
        Self {
            failures,
            status,
            body,
            calls: AtomicUsize::new(0),
        }
    }
}

impl BlockingTransport for FlakyTransport {
    fn open(
        &self,
        url: &str,
        _range_start: Option<u64>,
    ) -> Result<TransportResponse, DownloadError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(DownloadError::HttpStatus {
                status: self.status,
                url: url.to_string(),
            });
        }
        Ok(TransportResponse {
            status: 200,
            content_length: Some(self.body.len() as u64),
            last_modified: None,
            body: Box::new(Cursor::new(self.body.clone())),
        })
    }
}

fn info() -> InfoDict {
    InfoDict::from_value(serde_json::json!({ "url": "https://cdn/v" }))
}

/// Sleep policy that records each retry index and never sleeps
fn recording_sleep(indexes: Arc<Mutex<Vec<u32>>>) -> SleepFunc {
    SleepFunc::new(move |n| {
        indexes.lock().unwrap().push(n);
        Duration::ZERO
    })
}

#[test]
fn test_sync_retries_pass_zero_based_index_to_sleep_policy() {
    let dir = TempDir::new().unwrap();
    let indexes = Arc::new(Mutex::new(Vec::new()));
    let options = FileDownloaderOptions {
        retries: Some(5),
        retry_sleep_http: Some(recording_sleep(indexes.clone())),
        ..Default::default()
    };
    let transport = Arc::new(FlakyTransport::new(3, 502, payload(100)));
    let downloader = HttpDownloader::new(FileDownloader::new(options), transport.clone());

    let outcome = downloader.download(&dir.path().join("v.mp4"), &info()).unwrap();
    assert!(outcome.success);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    assert_eq!(*indexes.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_sync_infinite_retries_keep_going() {
    let dir = TempDir::new().unwrap();
    let options = FileDownloaderOptions {
        retries: None,
        retry_sleep_http: Some(SleepFunc::fixed(Duration::ZERO)),
        ..Default::default()
    };
    let transport = Arc::new(FlakyTransport::new(25, 503, payload(10)));
    let downloader = HttpDownloader::new(FileDownloader::new(options), transport.clone());

    assert!(downloader.download(&dir.path().join("v"), &info()).unwrap().success);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 26);
}

#[test]
fn test_sync_forbidden_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let options = FileDownloaderOptions {
        retries: Some(10),
        retry_sleep_http: Some(SleepFunc::fixed(Duration::ZERO)),
        ..Default::default()
    };
    let transport = Arc::new(FlakyTransport::new(usize::MAX, 403, Vec::new()));
    let downloader = HttpDownloader::new(FileDownloader::new(options), transport.clone());

    let err = downloader.download(&dir.path().join("v"), &info()).unwrap_err();
    assert!(matches!(err, DownloadError::HttpStatus { status: 403, .. }));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reporter_sees_every_event_in_order() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let policy = {
        let events = events.clone();
        RetryPolicy::new()
            .fatal(false)
            .with_sleep_func(Some(SleepFunc::fixed(Duration::from_millis(7))))
            .with_sleeper(|_| {})
            .with_reporter(move |event: &RetryEvent<'_>| {
                events.lock().unwrap().push(event.message());
            })
    };
    let manager = RetryManager::new(Some(2), policy);
    let result: Result<Option<()>, String> =
        manager.run(|_| Err(AttemptError::Retry("timed out".to_string())));
    assert_eq!(result, Ok(None));

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "timed out. Retrying (1/2)...".to_string(),
            "Sleeping 0.01 seconds ...".to_string(),
            "timed out. Retrying (2/2)...".to_string(),
            "Sleeping 0.01 seconds ...".to_string(),
            "timed out. Giving up after 2 retries".to_string(),
        ]
    );
}

#[test]
fn test_rename_failure_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let fd = FileDownloader::new(FileDownloaderOptions {
        file_access_retries: 2,
        retry_sleep_file_access: Some(SleepFunc::fixed(Duration::ZERO)),
        ..Default::default()
    });
    let missing = dir.path().join("never-written.part");
    assert!(!fd.try_rename(&missing, &dir.path().join("final")));
    assert!(fd.try_remove(&missing));
}

#[test]
fn test_open_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let fd = FileDownloader::new(FileDownloaderOptions::default());
    let inside_missing_dir = dir.path().join("no").join("such").join("dir.part");
    let err = match fd.sanitize_open(&inside_missing_dir, false) {
        Ok(_) => panic!("open should fail"),
        Err(e) => e,
    };
    assert!(matches!(err, DownloadError::FileAccess { action: "open", .. }));
}

#[tokio::test]
async fn test_async_backoff_doubles_between_attempts() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(RoutedClient::new().route("https://cdn/down", Route::Status(503)));
    let engine = AsyncDownloadEngine::with_client(
        DownloadConfig::default()
            .with_retry_delay(Duration::from_millis(20))
            .with_max_retries(2),
        client.clone(),
        None,
    )
    .unwrap();
    let id = engine
        .add_task("https://cdn/down", dir.path().join("down"), InfoDict::default(), "", None)
        .await
        .unwrap();

    let started = Instant::now();
    assert!(!engine.download_file(&id).await.unwrap());
    // 20 ms then 40 ms
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(client.calls("https://cdn/down"), 3);

    let task = engine.get_task_status(&id).await.unwrap();
    assert_eq!(task.status, DownloadStatus::Failed);
    assert_eq!(task.retry_count, 2);
}

#[tokio::test]
async fn test_async_client_errors_are_retried_too() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(RoutedClient::new().route("https://cdn/nope", Route::Status(404)));
    let engine = AsyncDownloadEngine::with_client(
        DownloadConfig::default()
            .with_retry_delay(Duration::from_millis(1))
            .with_max_retries(3),
        client.clone(),
        None,
    )
    .unwrap();
    let id = engine
        .add_task("https://cdn/nope", dir.path().join("nope"), InfoDict::default(), "", None)
        .await
        .unwrap();

    assert!(!engine.download_file(&id).await.unwrap());
    assert_eq!(client.calls("https://cdn/nope"), 4);
}
