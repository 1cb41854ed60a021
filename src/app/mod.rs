use crate::buffer::{BufferMetrics, Controller, ControllerConf, Item, PriorityBuffer};
use crate::sink::FileSink;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Agent wiring configuration. The buffering core itself is configured only
/// through the explicit `ControllerConf`; these flags exist for the binary.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Telemetry buffering agent", long_about = None)]
pub struct Config {
    /// Drain loop tick period in milliseconds
    #[arg(long, env = "DRAIN_INTERVAL_MS", default_value = "500")]
    pub drain_interval_ms: u64,

    /// Maximum items drained per tick
    #[arg(long, env = "MAX_BATCH_LEN", default_value = "1000")]
    pub max_batch_len: usize,

    /// Heap ceiling in MiB for insert admission (0 disables the check)
    #[arg(long, env = "MAX_HEAP_ALLOC_MB", default_value = "0")]
    pub max_heap_alloc_mb: u64,

    /// Maximum buffered item age in seconds before lazy eviction (0 disables)
    #[arg(long, env = "MAX_ITEM_AGE_SECS", default_value = "0")]
    pub max_item_age_secs: u64,

    /// Output path for the JSON-lines stream sink
    #[arg(long, env = "STREAM_PATH", default_value = "agent_stream.log")]
    pub stream_path: PathBuf,

    /// Log filter, e.g. "info" or "telemetry_agent=debug"
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

pub fn setup_logging(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

/// Runs the agent: stdin lines feed the pressure-checked insert path, the
/// drain loop ships batches to the file sink, SIGINT/SIGTERM (or stdin EOF)
/// trigger a flush-and-stop shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    info!(version = crate::VERSION, "starting telemetry agent");

    let registry = prometheus::Registry::new();
    let metrics = BufferMetrics::new().context("create buffer metrics")?;
    metrics
        .register(&registry)
        .context("register buffer metrics")?;

    let buf = Arc::new(PriorityBuffer::with_metrics(
        Duration::from_secs(config.max_item_age_secs),
        metrics,
    ));
    let sink = Arc::new(FileSink::open(&config.stream_path).with_context(|| {
        format!("open stream sink {}", config.stream_path.display())
    })?);

    let conf = ControllerConf {
        drain_interval: Duration::from_millis(config.drain_interval_ms),
        max_batch_len: config.max_batch_len,
        max_heap_alloc_bytes: config.max_heap_alloc_mb * 1024 * 1024,
        on_drain: sink.into_drain_fn(),
    };
    let mut ctrl = Controller::new(conf, buf.clone());
    ctrl.start();

    tokio::select! {
        _ = shutdown_signal() => {}
        result = produce_from_stdin(&ctrl) => {
            result?;
            info!("stdin closed, flushing buffer");
        }
    }

    // Bounded flush window: let the drain loop empty the buffer before it
    // is joined, but never hold shutdown longer than the deadline.
    let deadline = Instant::now() + Duration::from_secs(4);
    while !buf.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    ctrl.stop().await;
    info!("telemetry agent stopped");
    Ok(())
}

/// Demo producer: every non-empty stdin line becomes one metric item.
async fn produce_from_stdin(ctrl: &Controller) -> anyhow::Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        match ctrl.buf_insert([Item::metric(line)]) {
            Ok(()) => {}
            Err(err) if err.is_backpressure() => {
                warn!(error = %err, "item dropped under memory pressure");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = async {
                match sigterm.as_mut() {
                    Some(term) => { term.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for SIGINT");
        }
    }
}

pub async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    setup_logging(&config.log_level);
    run(config).await
}
