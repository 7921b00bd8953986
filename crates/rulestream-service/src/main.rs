//! Rulestream
//!
//! Reads trigger instances as JSON lines, matches them against the rules
//! in a directory and enforces every matched rule exactly once.

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use rulestream_engine::{
    Dispatcher, InMemoryEnforcementStore, InMemoryQueue, InMemoryTriggerInstanceStore,
    RecordingExecutor,
};
use rulestream_rules::RuleIndex;
use rulestream_telemetry::{EventBus, MetricsCollector, OutcomeEvent, TracingSink};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod config;
mod feed;
mod repository;

use config::ServiceConfig;
use repository::FileRuleRepository;

#[derive(Parser, Debug)]
#[command(name = "rulestream")]
#[command(about = "Rulestream rules engine", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "rulestream.yaml", env = "RULESTREAM_CONFIG")]
    config: String,

    /// Directory of rule documents
    #[arg(short, long)]
    rules_dir: Option<PathBuf>,

    /// JSON-lines file of trigger instances (`-` for stdin)
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Number of dispatch workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Deliveries per trigger instance before dead-lettering
    #[arg(long)]
    max_deliveries: Option<u32>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_listen: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print outcome events to stdout as JSON lines
    #[arg(long)]
    print_outcomes: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = ServiceConfig::load(&cli.config, &cli)?;

    // Initialize tracing
    init_tracing(cli.verbose, config.log_json);

    info!("Starting Rulestream");
    info!("Rules directory: {}", config.rules_dir.display());
    info!(
        "Events: {}",
        config
            .events_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdin".to_string())
    );

    // Initialize metrics
    let metrics_handle = init_metrics(config.metrics_listen.as_deref())?;

    let repository = Arc::new(FileRuleRepository::new(&config.rules_dir));
    let queue = Arc::new(InMemoryQueue::new(config.max_deliveries));
    let executor = Arc::new(RecordingExecutor::new());
    let store = Arc::new(InMemoryEnforcementStore::new());
    let metrics = MetricsCollector::new();
    let bus = Arc::new(EventBus::default());

    let dispatcher = Arc::new(
        Dispatcher::new(
            queue.clone(),
            Arc::new(RuleIndex::new(repository.clone())),
            executor.clone(),
            store,
            config.engine.clone(),
        )
        .with_instance_store(Arc::new(InMemoryTriggerInstanceStore::new()))
        .with_sink(Arc::new(TracingSink))
        .with_sink(bus.clone())
        .with_metrics(metrics.clone()),
    );

    let cancel = CancellationToken::new();
    let watcher = Arc::clone(&repository).spawn_watcher(config.watch_interval(), cancel.clone());
    let printer = cli
        .print_outcomes
        .then(|| spawn_outcome_printer(bus.subscribe(), cancel.clone()));
    let feeder = spawn_feeder(&config, queue.clone(), cancel.clone());

    let mut run = tokio::spawn(Arc::clone(&dispatcher).run(cancel.clone()));

    tokio::select! {
        result = &mut run => result??,
        _ = shutdown_signal() => {
            warn!("Shutdown signal received, stopping dispatcher...");
            cancel.cancel();
            run.await??;
        }
    }

    // Stop background tasks
    cancel.cancel();
    if let Err(e) = watcher.await {
        error!(error = %e, "Rules watcher failed");
    }
    match feeder.await {
        Ok(Err(e)) => error!(error = %e, "Event feed failed"),
        Err(e) => error!(error = %e, "Event feed task failed"),
        Ok(Ok(())) => {}
    }
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let snapshot = metrics.snapshot();
    let stats = queue.stats();
    info!(
        instances_processed = snapshot.instances_processed,
        enforced = snapshot.enforced,
        failed = snapshot.failed,
        skipped = snapshot.skipped,
        executions = executor.submission_count(),
        avg_match_latency_us = snapshot.avg_match_latency_us(),
        "Run summary"
    );
    for dead in queue.dead_letters() {
        warn!(
            trigger_instance = %dead.instance.id,
            attempts = dead.attempt,
            "Trigger instance was dead-lettered"
        );
    }
    if stats.in_flight > 0 {
        warn!(in_flight = stats.in_flight, "Stopped with unsettled deliveries");
    }
    if let Some(handle) = metrics_handle {
        debug!("Final metrics:\n{}", handle.render());
    }

    info!("Rulestream shutdown complete");
    Ok(())
}

/// Feed events from the configured source, then close the queue once
/// everything published has settled
fn spawn_feeder(
    config: &ServiceConfig,
    queue: Arc<InMemoryQueue>,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    let path = config.events_path().map(|p| p.to_path_buf());
    tokio::spawn(async move {
        let fed = match &path {
            Some(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    anyhow::anyhow!("failed to open events file {}: {}", path.display(), e)
                });
                match file {
                    Ok(file) => feed::feed_events(BufReader::new(file), &queue, &cancel).await,
                    Err(e) => Err(e),
                }
            }
            None => feed::feed_events(BufReader::new(tokio::io::stdin()), &queue, &cancel).await,
        };

        // the dispatcher must still stop when the feed fails
        feed::close_when_settled(&queue, &cancel).await;
        fed.map(|_| ())
    })
}

/// Print every outcome event to stdout as one JSON line
fn spawn_outcome_printer(
    mut outcomes: broadcast::Receiver<OutcomeEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = outcomes.recv() => received,
            };
            match received {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to encode outcome event"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Outcome printer fell behind")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("rulestream=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rulestream=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Initialize the metrics exporter. Serves `/metrics` when `listen` is set,
/// otherwise returns a handle for rendering.
fn init_metrics(listen: Option<&str>) -> Result<Option<PrometheusHandle>> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = match listen {
        Some(listen) => {
            let addr: SocketAddr = listen.parse()?;
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;
            info!("Metrics exporter listening on http://{}", addr);
            None
        }
        None => Some(
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?,
        ),
    };

    // Initialize baseline metrics
    metrics::describe_counter!(
        "rulestream_trigger_instances_total",
        "Trigger instances processed, by outcome"
    );
    metrics::describe_counter!(
        "rulestream_enforcements_total",
        "Per-rule outcomes by status"
    );
    metrics::describe_counter!(
        "rulestream_submission_retries_total",
        "Execution submissions retried after a transient failure"
    );
    metrics::describe_histogram!(
        "rulestream_match_latency_us",
        metrics::Unit::Microseconds,
        "Rule matching latency per trigger instance in microseconds"
    );

    info!("Metrics exporter initialized");
    Ok(handle)
}
