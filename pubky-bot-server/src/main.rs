//! pubky-bot-server: hosts the service execution core.
//!
//! Opens the store (running migrations; a failure is fatal), warms the
//! default routing snapshot, and runs the approval-expiry sweep until
//! shutdown. The chat-platform adapter connects to this runtime as an
//! external collaborator; it is not part of this binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use pubky_bot_core::approval::{ApprovalQueue, HomeserverExecutor, WriteExecutor};
use pubky_bot_core::config::RuntimeConfig;
use pubky_bot_core::store::{PendingWrite, Store};
use pubky_bot_runtime::snapshot::SnapshotBuilder;
use pubky_bot_runtime::source::{ConfigSource, DirConfigSource, default_template};

#[derive(Parser)]
#[command(name = "pubky-bot-server")]
struct Cli {
    /// Database path (overrides LOCAL_DB_URL)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory holding config templates as <id>.json
    #[arg(long, default_value = "templates")]
    template_dir: PathBuf,

    /// Default template id (overrides DEFAULT_TEMPLATE_ID)
    #[arg(long)]
    default_template: Option<String>,

    /// Seconds between approval-expiry sweeps
    #[arg(long, default_value_t = 60)]
    sweep_interval: u64,

    /// Delete orphaned service bundles at startup
    #[arg(long, default_value_t = false)]
    gc_on_start: bool,
}

/// Executor used when no homeserver is configured: every approval fails
/// with a clear message instead of silently dropping the write.
struct UnconfiguredExecutor;

impl WriteExecutor for UnconfiguredExecutor {
    fn execute<'a>(
        &'a self,
        _write: &'a PendingWrite,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async { Err("PUBKY_HOMESERVER is not configured".to_string()) })
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = RuntimeConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(id) = cli.default_template {
        config.default_template_id = id;
    }

    // Migration failure refuses to serve.
    let store = Arc::new(Store::open(&config.db_path).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }));
    log::info!("store open at {}", config.db_path.display());

    let executor: Box<dyn WriteExecutor> = match &config.homeserver {
        Some(base) => Box::new(HomeserverExecutor::new(base)),
        None => {
            log::warn!("PUBKY_HOMESERVER not set; approved writes will fail");
            Box::new(UnconfiguredExecutor)
        }
    };
    let approvals = ApprovalQueue::new(Arc::clone(&store), executor, config.approval_timeout);

    let source = DirConfigSource::new(&cli.template_dir);
    if source.fetch(&config.default_template_id).is_err() {
        log::info!(
            "default template '{}' not found under {}; the built-in '{}' template applies",
            config.default_template_id,
            cli.template_dir.display(),
            default_template().id
        );
    }
    let snapshots = Arc::new(SnapshotBuilder::new(
        Arc::clone(&store),
        Box::new(source),
        config.default_template_id.clone(),
    ));

    if cli.gc_on_start {
        match snapshots.gc_orphans() {
            Ok(report) => log::info!("startup gc: {} deleted, {} kept", report.deleted, report.kept),
            Err(e) => log::error!("startup gc failed: {e}"),
        }
    }

    // Warm the default snapshot so the first event doesn't pay the rebuild,
    // and so a broken default template is visible at startup.
    match snapshots.build("startup-probe", false) {
        Ok(snapshot) => log::info!(
            "default snapshot ready: {} command(s), {} listener(s)",
            snapshot.commands.len(),
            snapshot.listeners.len()
        ),
        Err(e) => log::error!("default snapshot build failed: {e}"),
    }

    let sweep_interval = Duration::from_secs(cli.sweep_interval.max(1));
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = approvals.expired_sweep() {
                log::error!("expiry sweep failed: {e}");
            }
        }
    });

    log::info!("pubky-bot-server running; waiting for shutdown signal");
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {e}");
    }
    sweeper.abort();
    log::info!("shutting down");
}
