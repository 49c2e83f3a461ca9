//! Integration tests for logging and tracing

use std::sync::Arc;
use std::time::Duration;

use media_downloader::downloader::retry::AttemptError;
use media_downloader::downloader::{
    AsyncDownloadEngine, DownloadConfig, InfoDict, RetryManager, RetryPolicy,
};
use tempfile::TempDir;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::support::{payload, Route, RoutedClient};

fn init_test_tracing() {
    // Either succeeds or fails because already initialized (both are OK)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("media_downloader=trace"))
        .with_test_writer()
        .try_init();
}

#[test]
fn test_json_subscriber_builds() {
    let result = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new("media_downloader=info"))
        .with_test_writer()
        .try_init();
    assert!(result.is_ok() || result.is_err());
}

#[test]
fn test_env_filter_directives_parse() {
    for directive in [
        "info",
        "media_downloader=debug",
        "warn,media_downloader::downloader=trace",
    ] {
        assert!(EnvFilter::try_new(directive).is_ok(), "{directive}");
    }
}

#[test]
fn test_structured_fields_in_download_spans() {
    init_test_tracing();

    let span = info_span!("download", task_id = "abc123", filename = "clip.mp4");
    let _guard = span.enter();
    info!(bytes = 1024u64, "Chunk written");
    warn!(attempt = 2, error = "connection reset", "Download attempt failed");
}

#[test]
fn test_retry_reporting_logs_without_subscriber_side_effects() {
    init_test_tracing();

    let manager = RetryManager::new(Some(1), RetryPolicy::new().fatal(false));
    let result: Result<Option<()>, String> =
        manager.run(|_| Err(AttemptError::Retry("socket closed".to_string())));
    assert_eq!(result, Ok(None));
}

#[tokio::test]
async fn test_engine_logs_through_a_full_download() {
    init_test_tracing();

    let dir = TempDir::new().unwrap();
    let client = Arc::new(RoutedClient::new().route("https://cdn/log", Route::Body(payload(64))));
    let engine = AsyncDownloadEngine::with_client(
        DownloadConfig::default().with_retry_delay(Duration::from_millis(1)),
        client,
        None,
    )
    .unwrap();
    let id = engine
        .add_task("https://cdn/log", dir.path().join("log.bin"), InfoDict::default(), "", None)
        .await
        .unwrap();
    assert!(engine.download_file(&id).await.unwrap());
    engine.close().await;
}
