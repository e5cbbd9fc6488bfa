use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::metrics::ThrottleMetrics;
use floodgate::processor::Processor;
use floodgate::ratelimit::LimiterPool;
use floodgate::server::StatusServer;

/// Rate-limit newline-delimited JSON events from stdin; admitted events are
/// written to stdout.
#[derive(Parser, Debug)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "FLOODGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override `policy.url`
    #[arg(long)]
    policy_url: Option<String>,

    /// Override `server.status_addr`
    #[arg(long)]
    status_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries events, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FloodgateConfig::load(args.config.as_deref())?;
    if let Some(url) = args.policy_url {
        config.policy.url = url;
    }
    if let Some(addr) = args.status_addr {
        config.server.status_addr = addr;
    }
    info!(
        policy_url = %config.policy.url,
        update_interval_secs = config.policy.update_interval_secs,
        bucket_size_secs = config.window.bucket_size_secs,
        buckets = config.window.buckets,
        "Configuration loaded"
    );

    let limiter = Arc::new(LimiterPool::from_config(&config)?);
    let metrics = ThrottleMetrics::new(&config.metrics)?;
    let processor = Processor::new(limiter.clone(), metrics.clone());
    let cancel = CancellationToken::new();

    let server = StatusServer::new(config.server.status_addr, limiter.clone(), metrics.clone());
    let server_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            server
                .serve_with_shutdown(async move { cancel.cancelled().await })
                .await
        })
    };

    limiter.initial_update(config.policy.initial_timeout()).await;

    let refresh_task = {
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        let period = config.policy.update_interval();
        tokio::spawn(async move { limiter.run_updates(period, cancel).await })
    };

    let reset_task = {
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        let period = std::time::Duration::from_secs(config.metrics.reset_interval_secs);
        tokio::spawn(async move { metrics.run_resets(period, cancel).await })
    };

    let outcome = tokio::select! {
        result = pump(&processor) => {
            info!("Input closed");
            result
        }
        _ = shutdown_signal() => Ok(()),
    };

    cancel.cancel();
    let _ = refresh_task.await;
    let _ = reset_task.await;
    match server_task.await {
        Ok(Err(e)) => error!(error = %e, "Status server stopped with an error"),
        Err(e) => error!(error = %e, "Status server task panicked"),
        Ok(Ok(())) => {}
    }

    info!("Floodgate stopped");
    outcome
}

/// Copy admitted lines from stdin to stdout.
///
/// Lines that are not JSON objects cannot be matched against rules and are
/// passed through.
async fn pump(processor: &Processor) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut out = BufWriter::new(tokio::io::stdout());

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let admitted = match serde_json::from_str::<Value>(&line) {
            Ok(event) if event.is_object() => processor.process(&event).is_admitted(),
            _ => {
                warn!("Passing through a line that is not a JSON object");
                true
            }
        };

        if admitted {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }

        // Flush once the input buffered so far has been handled.
        if lines.get_ref().buffer().is_empty() {
            out.flush().await?;
        }
    }

    out.flush().await?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
