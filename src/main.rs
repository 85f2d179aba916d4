//! tunproxy - HTTP/SOCKS5 proxy that tunnels traffic between nodes over QUIC
//!
//! A node runs any combination of a control endpoint (accepting tunnels from
//! other nodes), outbounds (tunnels to other nodes) and client-facing
//! inbounds, all described by one configuration file.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunproxy_config::{Config, LogConfig};
use tunproxy_core::Instance;

const LOG_FILE_NAME: &str = "tunproxy.log";

#[derive(Parser, Debug)]
#[command(name = "tunproxy")]
#[command(about = "Tunnel HTTP and SOCKS5 traffic between nodes over QUIC")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file (.yaml, .yml or .json)
    #[arg(short, long, default_value = "config.yaml", env = "TUNPROXY_CONFIG")]
    config: PathBuf,

    /// Log level for every output, overriding the configuration
    #[arg(long, env = "TUNPROXY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

/// Console output at `consoleLevel` (or RUST_LOG), plus `tunproxy.log` in
/// `logFilePath` at `fileLevel` when a path is configured
fn setup_logging(log: &LogConfig, override_level: Option<&str>) -> Result<()> {
    let console_filter = match override_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&log.console_level))?,
    };
    let console = fmt::layer().with_target(true).with_filter(console_filter);

    let file = match &log.log_file_path {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let path = dir.join(LOG_FILE_NAME);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;

            let filter = EnvFilter::try_new(override_level.unwrap_or(log.file_level.as_str()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if cli.check {
        println!("{}: configuration is valid", cli.config.display());
        return Ok(());
    }

    setup_logging(&config.log, cli.log_level.as_deref())?;

    // Install the ring provider before any TLS config is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(
        "tunproxy {} ({}) starting with {}",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        cli.config.display()
    );

    let instance = Instance::new(&config).context("Failed to initialize")?;
    if let Err(e) = instance.start().await {
        error!("Startup failed: {}", e);
        if let Err(close_err) = instance.close().await {
            error!("{}", close_err);
        }
        return Err(e).context("Failed to start");
    }

    shutdown_signal().await;
    info!("Shutdown signal received, closing");

    instance.close().await.context("Failed to close cleanly")?;
    Ok(())
}
