//! Unit tests for throughput and formatting helpers

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use media_downloader::downloader::progress::{
    best_block_size, calc_eta, calc_percent, calc_speed, format_bytes, format_eta,
    format_percent, format_seconds, format_speed, ProgressState,
};
use media_downloader::downloader::{
    DownloadPhase, DownloadTask, InfoDict, ProgressHooks, ProgressStatus,
};

#[test]
fn test_block_size_stays_within_bounds() {
    let samples = [
        (Duration::ZERO, 0u64),
        (Duration::ZERO, 1),
        (Duration::from_micros(10), 1024),
        (Duration::from_millis(1), 1),
        (Duration::from_millis(250), 8192),
        (Duration::from_secs(1), 100_000),
        (Duration::from_secs(10), 1_000),
        (Duration::from_millis(5), 64 * 1024 * 1024),
    ];
    for (elapsed, bytes) in samples {
        let size = best_block_size(elapsed, bytes);
        assert!(size >= 1, "{elapsed:?} {bytes}");
        assert!(size <= 4 * 1024 * 1024, "{elapsed:?} {bytes}");
        let doubled = (bytes * 2).clamp(1, 4 * 1024 * 1024) as usize;
        assert!(size <= doubled, "{elapsed:?} {bytes}");
        let halved = ((bytes / 2).max(1) as usize).min(doubled);
        assert!(size >= halved, "{elapsed:?} {bytes}");
    }
}

#[test]
fn test_block_size_tracks_rate() {
    // 1000 bytes in half a second is 2000 B/s, exactly the doubling cap
    assert_eq!(best_block_size(Duration::from_millis(500), 1000), 2000);
    // slow reads shrink to half the last read
    assert_eq!(best_block_size(Duration::from_secs(10), 1000), 500);
}

#[test]
fn test_speed_and_eta() {
    let start = Instant::now();
    let now = start + Duration::from_secs(2);

    assert_eq!(calc_speed(start, now, 0), None);
    assert_eq!(calc_speed(start, start, 100), None);
    let speed = calc_speed(start, now, 2048).unwrap();
    assert!((speed - 1024.0).abs() < 1e-6);

    assert_eq!(calc_eta(start, now, None, 100), None);
    assert_eq!(calc_eta(start, now, Some(4096), 2048), Some(2));
    assert_eq!(calc_eta(start, now, Some(2048), 2048), Some(0));
}

#[test]
fn test_percentages() {
    assert_eq!(calc_percent(50, Some(200)), Some(25.0));
    assert_eq!(calc_percent(0, Some(0)), Some(100.0));
    assert_eq!(calc_percent(10, None), None);
    assert_eq!(format_percent(Some(25.0)), " 25.0%");
    assert_eq!(format_percent(None), "---.-%");
}

#[test]
fn test_human_formats() {
    assert_eq!(format_seconds(3725), "01:02:05");
    assert_eq!(format_seconds(100 * 3600), "--:--:--");
    assert_eq!(format_eta(Some(323)), "05:23");
    assert_eq!(format_eta(None), "Unknown");
    assert_eq!(format_bytes(512.0), "512.00B");
    assert_eq!(format_bytes(1536.0), "1.50KiB");
    assert_eq!(format_bytes(3.0 * 1024.0 * 1024.0), "3.00MiB");
    assert_eq!(format_speed(Some(2048.0)), "2.00KiB/s");
    assert_eq!(format_speed(None), "Unknown B/s");
}

#[test]
fn test_progress_state_throttles_snapshots() {
    let mut state = ProgressState::new(Some(1000));
    let t0 = state.start_time;
    assert!(!state.should_emit_update(t0 + Duration::from_millis(100)));
    assert!(state.should_emit_update(t0 + Duration::from_millis(500)));

    state.mark_emitted(t0 + Duration::from_millis(500));
    assert!(!state.should_emit_update(t0 + Duration::from_millis(900)));
    assert!(state.should_emit_update(t0 + Duration::from_millis(1000)));

    state.update(250);
    state.update(250);
    let task = DownloadTask::new("https://cdn/x", "x", InfoDict::default(), "", Some(1000));
    let snapshot = state.snapshot(task, t0 + Duration::from_secs(1));
    assert_eq!(snapshot.downloaded_bytes, 500);
    assert_eq!(snapshot.percentage, Some(50.0));
    assert_eq!(snapshot.eta, Some(1));
}

#[test]
fn test_hooks_run_in_order_and_share_info_dict() {
    let info = InfoDict::from_value(serde_json::json!({ "url": "https://cdn/x" }));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = ProgressHooks::new();
    for name in ["first", "second"] {
        let calls = calls.clone();
        let info = info.clone();
        hooks.add(Arc::new(move |status: &ProgressStatus| {
            let shared = status.info_dict.as_ref().is_some_and(|d| d.ptr_eq(&info));
            calls.lock().unwrap().push((name, shared));
            Ok(())
        }));
    }

    hooks.dispatch(ProgressStatus::new(DownloadPhase::Downloading, "x"), &info);
    assert_eq!(*calls.lock().unwrap(), vec![("first", true), ("second", true)]);
}

#[test]
fn test_failing_hook_does_not_stop_later_hooks() {
    let reached = Arc::new(Mutex::new(false));
    let mut hooks = ProgressHooks::new();
    hooks.add(Arc::new(|_: &ProgressStatus| -> anyhow::Result<()> {
        anyhow::bail!("broken pipe")
    }));
    hooks.add(Arc::new(|_: &ProgressStatus| -> anyhow::Result<()> {
        panic!("hook bug")
    }));
    {
        let reached = reached.clone();
        hooks.add(Arc::new(move |_: &ProgressStatus| {
            *reached.lock().unwrap() = true;
            Ok(())
        }));
    }

    hooks.dispatch(
        ProgressStatus::new(DownloadPhase::Finished, PathBuf::from("y")),
        &InfoDict::default(),
    );
    assert!(*reached.lock().unwrap());
}

#[test]
fn test_status_line_formats() {
    let mut status = ProgressStatus::new(DownloadPhase::Finished, "v.mp4");
    status.total_bytes = Some(2 * 1024 * 1024);
    status.elapsed = Some(Duration::from_secs(65));
    assert_eq!(status.format_line(), "100% of 2.00MiB in 00:01:05");

    let mut status = ProgressStatus::new(DownloadPhase::Downloading, "v.mp4");
    status.downloaded_bytes = Some(512);
    status.total_bytes_estimate = Some(1024);
    assert_eq!(status.percentage(), Some(50.0));
}
