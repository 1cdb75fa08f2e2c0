//! Pagetrail
//!
//! Offline-tolerant page visit recording with queued batch sync.
//!
//! # Commands
//!
//! ```text
//! pagetrail run                 coordinator + stdin observer + logging viewer
//! pagetrail flush               drain the local queue once
//! pagetrail history <url>       print the fused history of a url as JSON
//! ```
//!
//! `run` reads one JSON metrics record per line from stdin. The first record
//! for a url is treated as a page load that the coordinator collects from the
//! observer; repeats for the same url are pushed by the observer. Example:
//! `{"url":"https://example.com","title":null,"description":null,"link_count":3,"word_count":120,"image_count":1}`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pagetrail::adapters::{FileStateStore, HttpVisitService, SnapshotSource};
use pagetrail::coordinator::{Coordinator, CoordinatorParts};
use pagetrail::domain::{PageMetrics, StateStore, TabId, VisitService};
use pagetrail::history::{ConfirmedHistory, HistoryMerger};
use pagetrail::observer::Observer;
use pagetrail::queue::{DurableQueue, LastMetricsStore};
use pagetrail::router::MessageRouter;
use pagetrail::sync::{SyncCoordinator, SyncOutcome};
use pagetrail::telemetry::{run_telemetry_server, Telemetry};
use pagetrail::viewer::ViewerSession;
use pagetrail::{AppConfig, RateLimiter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pagetrail - offline-tolerant page visit recording
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML config file; flags and environment override its values
    #[arg(long, global = true, env = "PAGETRAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Remote API base URL
    #[arg(long, global = true, env = "PAGETRAIL_API_BASE_URL")]
    api_base_url: Option<String>,

    /// Remote request timeout in milliseconds
    #[arg(long, global = true, env = "PAGETRAIL_API_TIMEOUT_MS")]
    api_timeout_ms: Option<u64>,

    /// Queue sync interval in milliseconds
    #[arg(long, global = true, env = "PAGETRAIL_QUEUE_SYNC_INTERVAL_MS")]
    queue_sync_interval_ms: Option<u64>,

    /// Per-url cooldown window in milliseconds
    #[arg(long, global = true, env = "PAGETRAIL_VISIT_RATE_LIMIT_MS")]
    visit_rate_limit_ms: Option<u64>,

    /// Directory holding the local queue
    #[arg(long, global = true, env = "PAGETRAIL_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Metrics server bind address
    #[arg(long, global = true, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator, a stdin-fed observer and a logging viewer
    Run,
    /// Submit everything queued locally, once
    Flush,
    /// Print the fused history of a url
    History {
        url: String,

        /// Confirmed pages to load
        #[arg(long, default_value = "1")]
        pages: u32,
    },
}

impl Args {
    async fn app_config(&self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_yaml_file(path).await?,
            None => AppConfig::default(),
        };

        if let Some(url) = &self.api_base_url {
            config.api_base_url = url.clone();
        }
        if let Some(ms) = self.api_timeout_ms {
            config.api_timeout_ms = ms;
        }
        if let Some(ms) = self.queue_sync_interval_ms {
            config.queue_sync_interval_ms = ms;
        }
        if let Some(ms) = self.visit_rate_limit_ms {
            config.visit_rate_limit_ms = ms;
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(addr) = &self.metrics_addr {
            config.metrics_addr = addr.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.app_config().await.context("loading configuration")?;
    info!("  API base URL: {}", config.api_base_url);
    info!("  State directory: {}", config.state_dir.display());

    let store: Arc<dyn StateStore> = Arc::new(
        FileStateStore::open(&config.state_dir)
            .await
            .context("opening state directory")?,
    );
    let service: Arc<dyn VisitService> = Arc::new(
        HttpVisitService::new(config.remote()).context("creating HTTP client")?,
    );
    let telemetry = Telemetry::new()?;
    let queue = DurableQueue::new(store.clone());

    match args.command {
        Command::Run => run(config, store, service, queue, telemetry).await,
        Command::Flush => {
            let sync = SyncCoordinator::new(config.sync(), queue, service, telemetry);
            match sync.flush().await? {
                SyncOutcome::Empty => println!("queue empty"),
                SyncOutcome::Synced { count } => println!("synced {} visits", count),
            }
            Ok(())
        }
        Command::History { url, pages } => {
            let merger = HistoryMerger::new(config.merger(), queue, service);
            let mut history = ConfirmedHistory::new(url);

            let refresh = merger.refresh(&mut history).await?;
            if let Some(e) = refresh.remote_error {
                warn!("Remote history unavailable: {}", e);
            }
            for _ in 1..pages {
                if !merger.load_more(&mut history).await? {
                    break;
                }
            }

            let view = merger.view(&history).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
    }
}

async fn run(
    config: AppConfig,
    store: Arc<dyn StateStore>,
    service: Arc<dyn VisitService>,
    queue: Arc<DurableQueue>,
    telemetry: Arc<Telemetry>,
) -> anyhow::Result<()> {
    info!("Starting Pagetrail");
    info!("  Sync interval: {} ms", config.queue_sync_interval_ms);
    info!("  Rate limit window: {} ms", config.visit_rate_limit_ms);

    let shutdown = CancellationToken::new();
    let router = MessageRouter::new(config.router(), telemetry.clone());

    // Coordinator
    let sync = SyncCoordinator::new(config.sync(), queue.clone(), service.clone(), telemetry.clone());
    let coordinator = Coordinator::new(
        config.coordinator(),
        CoordinatorParts {
            limiter: RateLimiter::new(config.limiter()),
            queue: queue.clone(),
            last_metrics: LastMetricsStore::new(store.clone()),
            sync,
            router: router.clone(),
            telemetry: telemetry.clone(),
        },
    );
    let coordinator_tasks = coordinator.start(shutdown.clone());

    // Metrics server
    let metrics_addr = config.metrics_addr.clone();
    let metrics_telemetry = telemetry.clone();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_telemetry_server(&metrics_addr, metrics_telemetry, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Observer fed from stdin
    let source = Arc::new(SnapshotSource::new());
    let observer = Observer::new(TabId(1), config.observer(), source.clone(), router.clone());
    let observer_task = observer.attach(shutdown.clone());

    let (url_tx, mut url_rx) = mpsc::channel::<String>(16);
    let stdin_shutdown = shutdown.clone();
    let stdin_coordinator = coordinator.clone();
    let stdin_task = tokio::spawn(async move {
        let coordinator = stdin_coordinator;
        let mut last_url: Option<String> = None;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = stdin_shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let metrics: PageMetrics = match serde_json::from_str(&line) {
                Ok(metrics) => metrics,
                Err(e) => {
                    warn!("Skipping malformed metrics line: {}", e);
                    continue;
                }
            };

            let url = metrics.url.clone();
            source.load(metrics);
            let _ = url_tx.send(url.clone()).await;

            // a new url is a page load the coordinator asks about; a repeat is pushed
            if last_url.as_deref() == Some(url.as_str()) {
                if let Err(e) = observer.emit_page_metrics().await {
                    warn!("Failed to emit page metrics: {}", e);
                }
            } else {
                last_url = Some(url.clone());
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    match coordinator.on_tab_loaded(TabId(1), &url).await {
                        Some(ingested) => debug!("Collected {}: {:?}", url, ingested),
                        None => debug!("No metrics collected for {}", url),
                    }
                });
            }
        }
        info!("Stdin closed");
    });

    // Viewer
    let (mut viewer, mut inbox) = ViewerSession::open(
        router.clone(),
        HistoryMerger::new(config.merger(), queue.clone(), service.clone()),
        LastMetricsStore::new(store.clone()),
    );
    let mut updates = viewer.watch();
    let mut started = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
            Some(url) = url_rx.recv() => {
                let result = if started {
                    viewer.set_current_url(url).await
                } else {
                    started = true;
                    viewer.start(Some(url)).await
                };
                if let Err(e) = result {
                    warn!("Viewer failed to load history: {}", e);
                }
            }
            Some(envelope) = inbox.recv() => {
                if let Err(e) = viewer.handle_message(envelope.message).await {
                    warn!("Viewer failed to apply message: {}", e);
                }
            }
            Ok(()) = updates.changed() => {
                let snapshot = updates.borrow_and_update().clone();
                if let Some(view) = snapshot.history {
                    info!(
                        "Viewer: {} total visits for {} ({} pending, {} rows)",
                        view.total_visits,
                        view.url,
                        view.pending,
                        view.rows.len()
                    );
                }
                if let Some(e) = snapshot.error {
                    warn!("Viewer: {}", e);
                }
            }
        }
    }

    viewer.teardown();
    shutdown.cancel();

    coordinator_tasks.join().await;
    let _ = observer_task.await;
    let _ = stdin_task.await;

    info!("Pagetrail shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // logs go to stderr so stdout stays machine-readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
