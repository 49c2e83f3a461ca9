//! Main entry point for the media-downloader CLI

use clap::Parser;
use media_downloader::cli::{Cli, Commands};
use media_downloader::metrics;
use media_downloader::shutdown::{self, SharedShutdown, ShutdownCoordinator};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("media_downloader=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Listen for Ctrl+C on a small runtime of its own.
///
/// The sync engine uses blocking I/O, so the main thread stays runtime-free.
fn spawn_ctrl_c_handler(shutdown: SharedShutdown) {
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "Ctrl+C handler unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Ctrl+C received - stopping downloads, partial files are kept for resume");
                    shutdown.request_shutdown();
                }
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to spawn Ctrl+C handler");
    }
}

fn main() {
    init_tracing();

    let cli = Cli::parse();

    let shutdown = ShutdownCoordinator::shared();
    shutdown::set_global_shutdown(shutdown.clone());
    spawn_ctrl_c_handler(shutdown.clone());

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = metrics::init_metrics(addr) {
            warn!(error = %e, "Failed to start metrics exporter");
        }
    }

    let result: anyhow::Result<()> = match cli.command {
        Commands::Download(ref args) => args
            .execute(&cli, shutdown.clone())
            .map_err(|e| anyhow::anyhow!(e)),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}
