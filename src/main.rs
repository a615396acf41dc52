//! query2metrics - a configuration-driven Prometheus exporter
//!
//! Usage:
//!     query2metrics --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use query2metrics::collector::{CollectorService, Scheduler};
use query2metrics::config::{Config, ConfigWatcher, load_config};
use query2metrics::server::HttpServer;
use query2metrics::util::{ShutdownSignal, init_logging};

/// A configuration-driven Prometheus exporter for MySQL, Redis, IoTDB and
/// HTTP/JSON backends.
#[derive(Parser, Debug)]
#[command(name = "query2metrics")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Disable config file watching
    #[arg(long)]
    no_watch: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Metrics: {}", config.metrics.len());
        println!(
            "  Connections: {} mysql, {} redis, {} http, iotdb {}",
            config.mysql_connections.len(),
            config.redis_connections.len(),
            config.http_connections.len(),
            if config.iotdb.is_some() { "yes" } else { "no" }
        );
        for metric in &config.metrics {
            println!(
                "    - {} ({:?}) from {} [{}]",
                metric.name,
                metric.kind,
                metric.source,
                metric.connection_name()
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        metrics = config.metrics.len(),
        interval = %humantime::format_duration(config.schedule.interval),
        "query2metrics starting"
    );

    for metric in &config.metrics {
        info!(
            name = %metric.name,
            kind = ?metric.kind,
            source = %metric.source,
            connection = %metric.connection_name(),
            "configured metric"
        );
    }

    run(config, cli.config, cli.no_watch)
}

/// Run the exporter with the given configuration.
fn run(config: Config, config_path: PathBuf, no_watch: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config, config_path, no_watch).await })
}

/// Async entry point for the exporter.
async fn run_async(config: Config, config_path: PathBuf, no_watch: bool) -> Result<()> {
    let shutdown = ShutdownSignal::new();

    let listen: SocketAddr = format!(
        "{}:{}",
        config.prometheus.listen_address, config.prometheus.listen_port
    )
    .parse()
    .context("invalid listen address")?;

    let service = CollectorService::new(config.clone(), shutdown.clone())
        .context("failed to construct collector service")?;

    // The startup apply registers every instrument, opens every client, and
    // runs the initial collection round, so the very first scrape already
    // carries real values.
    service
        .reload(config)
        .await
        .context("failed to apply startup configuration")?;

    let mut handles = Vec::new();

    // Bind before spawning anything: a busy port must fail startup.
    let server = HttpServer::bind(listen, Arc::clone(&service), config_path.clone())
        .await
        .with_context(|| format!("failed to bind listener on {}", listen))?;
    let server_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        server.run(server_rx).await;
    }));

    let scheduler = Scheduler::new(Arc::clone(&service));
    let scheduler_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        scheduler.run(scheduler_rx).await;
    }));

    if !no_watch {
        let watcher = ConfigWatcher::new(config_path, Arc::clone(&service));
        let watcher_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            watcher.run(watcher_rx).await;
        }));
    }

    info!("query2metrics is running");

    wait_for_signal().await;

    info!("initiating graceful shutdown");
    shutdown.shutdown();

    let shutdown_timeout = Duration::from_secs(30);
    let shutdown_deadline = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(shutdown_deadline);

    for (i, handle) in handles.into_iter().enumerate() {
        tokio::select! {
            result = handle => {
                if let Err(e) = result {
                    warn!(task = i, error = %e, "task panicked during shutdown");
                }
            }
            _ = &mut shutdown_deadline => {
                warn!("shutdown timeout reached, forcing exit");
                break;
            }
        }
    }

    service.close().await;

    info!("query2metrics shut down complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for shutdown signal");
            } else {
                info!("received interrupt signal");
            }
        }
        _ = sigterm.recv() => {
            info!("received terminate signal");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }
}
