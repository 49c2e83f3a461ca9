//! Unit tests for CLI download command parsing

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use media_downloader::cli::download::{Cli, Commands, Engine, OutputFormat};

fn parse(args: &[&str]) -> Cli {
    let mut argv = vec!["media-downloader"];
    argv.extend_from_slice(args);
    Cli::parse_from(argv)
}

#[test]
fn test_cli_defaults() {
    let cli = parse(&["download", "https://cdn/v.mp4"]);

    assert_eq!(cli.engine, Engine::Sync);
    assert_eq!(cli.output_format, OutputFormat::Human);
    assert_eq!(cli.concurrency, 4);
    assert_eq!(cli.timeout, 30);
    assert!(cli.metrics_addr.is_none());

    let options = cli.file_downloader_options().unwrap();
    assert_eq!(options.retries, Some(10));
    assert!(options.continuedl);
    assert!(options.updatetime);
    assert_eq!(options.ratelimit, None);

    let config = cli.download_config().unwrap();
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.timeout, Duration::from_secs(30));
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = parse(&[
        "download",
        "https://cdn/v.mp4",
        "--engine",
        "async",
        "--concurrency",
        "8",
        "--retries",
        "5",
    ]);
    assert_eq!(cli.engine, Engine::Async);
    let config = cli.download_config().unwrap();
    assert_eq!(config.max_concurrent, 8);
    assert_eq!(config.max_retries, 5);
}

#[test]
fn test_infinite_retries_for_sync_engine() {
    let cli = parse(&["--retries", "infinite", "download", "https://cdn/v.mp4"]);
    assert_eq!(cli.file_downloader_options().unwrap().retries, None);
    assert!(cli.download_config().is_err());
}

#[test]
fn test_sleep_intervals_and_buffer() {
    let cli = parse(&[
        "--sleep-interval",
        "1.5",
        "--max-sleep-interval",
        "3",
        "--buffer-size",
        "4096",
        "--no-resize-buffer",
        "--limit-rate",
        "1M",
        "download",
        "https://cdn/v.mp4",
    ]);
    let options = cli.file_downloader_options().unwrap();
    assert_eq!(options.sleep_interval, Some(Duration::from_millis(1500)));
    assert_eq!(options.max_sleep_interval, Some(Duration::from_secs(3)));
    assert_eq!(options.buffersize, 4096);
    assert!(options.noresizebuffer);
    assert_eq!(options.ratelimit, Some(1_048_576));
}

#[test]
fn test_negative_sleep_interval_is_rejected() {
    let cli = parse(&["--sleep-interval=-1", "download", "https://cdn/v.mp4"]);
    assert!(cli.file_downloader_options().is_err());
}

#[test]
fn test_concurrency_bounds_enforced_by_parser() {
    for bad in ["0", "33", "many"] {
        let result = Cli::try_parse_from([
            "media-downloader",
            "--concurrency",
            bad,
            "download",
            "https://cdn/v.mp4",
        ]);
        assert!(result.is_err(), "concurrency {bad} should be rejected");
    }
}

#[test]
fn test_download_requires_a_url() {
    assert!(Cli::try_parse_from(["media-downloader", "download"]).is_err());
}

#[test]
fn test_targets_use_output_dir() {
    let cli = parse(&[
        "download",
        "https://cdn/a/first.mp4",
        "https://cdn/b/",
        "--output-dir",
        "media",
    ]);
    let Commands::Download(args) = &cli.command;
    let targets = args.targets().unwrap();
    assert_eq!(
        targets,
        vec![
            (
                "https://cdn/a/first.mp4".to_string(),
                PathBuf::from("media").join("first.mp4")
            ),
            ("https://cdn/b/".to_string(), PathBuf::from("media").join("b")),
        ]
    );
}
