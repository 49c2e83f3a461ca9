//! Integration tests for the synchronous HTTP downloader over a local server

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use media_downloader::downloader::{
    DownloadError, DownloadOutcome, DownloadPhase, Downloader, FileDownloader,
    FileDownloaderOptions, HttpDownloader, InfoDict, ProgressStatus, ReqwestTransport, SleepFunc,
};
use mockito::{Matcher, Server};
use tempfile::TempDir;

use crate::support::payload;

fn options() -> FileDownloaderOptions {
    FileDownloaderOptions {
        retries: Some(2),
        retry_sleep_http: Some(SleepFunc::fixed(Duration::ZERO)),
        ..Default::default()
    }
}

fn downloader(options: FileDownloaderOptions) -> HttpDownloader {
    let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
    HttpDownloader::new(FileDownloader::new(options), Arc::new(transport))
}

fn info(url: String) -> InfoDict {
    InfoDict::from_value(serde_json::json!({ "url": url, "format_id": "18" }))
}

#[test]
fn test_download_sets_mtime_from_last_modified() {
    let mut server = Server::new();
    let body = payload(3000);
    let mock = server
        .mock("GET", "/watch/clip.mp4")
        .with_status(200)
        .with_header("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT")
        .with_body(body.clone())
        .create();

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("clip.mp4");
    let outcome = downloader(options())
        .download(&target, &info(format!("{}/watch/clip.mp4", server.url())))
        .unwrap();

    assert_eq!(outcome, DownloadOutcome::transferred(true));
    assert_eq!(std::fs::read(&target).unwrap(), body);
    assert!(!dir.path().join("clip.mp4.part").exists());
    let mtime = std::fs::metadata(&target).unwrap().modified().unwrap();
    assert_eq!(
        mtime.duration_since(UNIX_EPOCH).unwrap().as_secs(),
        1_445_412_480
    );
    mock.assert();
}

#[test]
fn test_resume_sends_range_from_part_size() {
    let mut server = Server::new();
    let body = payload(1000);
    let mock = server
        .mock("GET", "/clip")
        .match_header("range", "bytes=400-")
        .with_status(206)
        .with_body(&body[400..])
        .expect(1)
        .create();

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("clip.webm");
    std::fs::write(dir.path().join("clip.webm.part"), &body[..400]).unwrap();

    let outcome = downloader(options())
        .download(&target, &info(format!("{}/clip", server.url())))
        .unwrap();
    assert!(outcome.success);
    assert_eq!(std::fs::read(&target).unwrap(), body);
    mock.assert();
}

#[test]
fn test_server_ignoring_range_restarts_from_zero() {
    let mut server = Server::new();
    let body = payload(800);
    let mock = server
        .mock("GET", "/clip")
        .with_status(200)
        .with_body(body.clone())
        .create();

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("clip.bin");
    std::fs::write(dir.path().join("clip.bin.part"), b"stale bytes").unwrap();

    downloader(options())
        .download(&target, &info(format!("{}/clip", server.url())))
        .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), body);
    mock.assert();
}

#[test]
fn test_range_not_satisfiable_means_part_is_complete() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/done")
        .match_header("range", Matcher::Regex("bytes=\\d+-".to_string()))
        .with_status(416)
        .create();

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("done.bin");
    std::fs::write(dir.path().join("done.bin.part"), payload(64)).unwrap();

    let outcome = downloader(options())
        .download(&target, &info(format!("{}/done", server.url())))
        .unwrap();
    assert!(outcome.success);
    assert_eq!(std::fs::read(&target).unwrap(), payload(64));
    mock.assert();
}

#[test]
fn test_client_error_is_not_retried() {
    let mut server = Server::new();
    let mock = server.mock("GET", "/missing").with_status(404).expect(1).create();

    let dir = TempDir::new().unwrap();
    let phases = Arc::new(Mutex::new(Vec::new()));
    let fd = {
        let phases = phases.clone();
        FileDownloader::new(options()).with_progress_hook(Arc::new(
            move |status: &ProgressStatus| {
                phases.lock().unwrap().push(status.status);
                Ok(())
            },
        ))
    };
    let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(5)).unwrap());
    let downloader = HttpDownloader::new(fd, transport);

    let err = downloader
        .download(
            &dir.path().join("missing.mp4"),
            &info(format!("{}/missing", server.url())),
        )
        .unwrap_err();
    assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
    assert_eq!(*phases.lock().unwrap(), vec![DownloadPhase::Error]);
    mock.assert();
}

#[test]
fn test_server_error_is_retried_until_exhausted() {
    let mut server = Server::new();
    let mock = server.mock("GET", "/flaky").with_status(503).expect(3).create();

    let dir = TempDir::new().unwrap();
    let err = downloader(options())
        .download(
            &dir.path().join("flaky.mp4"),
            &info(format!("{}/flaky", server.url())),
        )
        .unwrap_err();
    assert!(matches!(err, DownloadError::HttpStatus { status: 503, .. }));
    mock.assert();
}

#[test]
fn test_existing_file_skips_network() {
    let mut server = Server::new();
    let mock = server.mock("GET", "/have").expect(0).create();

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("have.mp4");
    std::fs::write(&target, b"already here").unwrap();

    let outcome = downloader(options())
        .download(&target, &info(format!("{}/have", server.url())))
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::skipped());
    assert_eq!(std::fs::read(&target).unwrap(), b"already here");
    mock.assert();
}

#[test]
fn test_rate_limit_slows_transfer() {
    let mut server = Server::new();
    let body = payload(4096);
    server
        .mock("GET", "/limited")
        .with_status(200)
        .with_body(body.clone())
        .create();

    let dir = TempDir::new().unwrap();
    let options = FileDownloaderOptions {
        ratelimit: Some(8192),
        buffersize: 512,
        noresizebuffer: true,
        ..options()
    };
    let started = SystemTime::now();
    downloader(options)
        .download(
            &dir.path().join("limited.bin"),
            &info(format!("{}/limited", server.url())),
        )
        .unwrap();

    // 4 KiB at 8 KiB/s takes about half a second
    let elapsed = started.elapsed().unwrap();
    assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
    assert_eq!(std::fs::read(dir.path().join("limited.bin")).unwrap(), body);
}
