//! scriptbot — scripted crypto trading runtime.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens storage, starts the configured traders and the control API, and
//! stops every trader on Ctrl-C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use scriptbot::config::{self, StorageBackend};
use scriptbot::control;
use scriptbot::exchanges::ExchangeRegistry;
use scriptbot::logger::LogSink;
use scriptbot::runtime::{self, Supervisor};
use scriptbot::storage::{MemoryStore, Seed, SqliteStore, Store};

/// How long pending log writes get once the grace period is over.
const FINAL_DRAIN: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load(&config::AppConfig::path_from_env())?;
    init_logging(&cfg);

    let rt = runtime::build_runtime()?;
    let outcome = rt.block_on(serve(cfg));
    // Units still inside a native call are abandoned here.
    rt.shutdown_timeout(FINAL_DRAIN);
    outcome
}

async fn serve(cfg: config::AppConfig) -> Result<()> {
    info!(
        storage = ?cfg.storage.backend,
        control = cfg.control.enabled,
        autostart = ?cfg.runtime.autostart,
        "scriptbot starting up"
    );

    // -- Storage ---------------------------------------------------------

    let seed = match &cfg.storage.seed_path {
        Some(path) => Some(Seed::load(path)?),
        None => None,
    };

    // Without a database, trader logs only go to tracing.
    let (store, sink): (Arc<dyn Store>, Option<Arc<dyn LogSink>>) = match cfg.storage.backend {
        StorageBackend::Memory => {
            let store = MemoryStore::from_seed(seed.unwrap_or_default());
            (Arc::new(store) as Arc<dyn Store>, None)
        }
        StorageBackend::Sqlite => {
            let url = cfg.storage.database_url.as_deref().unwrap_or_default();
            let store = SqliteStore::connect(url).await?;
            if let Some(seed) = &seed {
                store.import(seed).await?;
            }
            let store = Arc::new(store);
            (store.clone() as Arc<dyn Store>, Some(store as Arc<dyn LogSink>))
        }
    };

    // -- Runtime ---------------------------------------------------------

    let exchanges = ExchangeRegistry::with_defaults(&cfg);
    info!(types = ?exchanges.types(), "Exchange adapters registered");
    let supervisor = Arc::new(Supervisor::new(store, exchanges, sink));

    for &id in &cfg.runtime.autostart {
        match supervisor.run(id).await {
            Ok(()) => info!(trader_id = id, "Autostarted trader"),
            Err(e) => error!(trader_id = id, error = %e, "Failed to autostart trader"),
        }
    }

    if cfg.control.enabled {
        control::spawn_control(supervisor.clone(), cfg.control.port).await?;
    }

    // -- Shutdown --------------------------------------------------------

    info!("Running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");

    let asked = supervisor.stop_all();
    let grace = Duration::from_secs(cfg.runtime.shutdown_grace_secs);
    if supervisor.wait_idle(grace).await {
        info!(stopped = asked, "scriptbot shut down cleanly.");
    } else {
        warn!(
            still_running = ?supervisor.running(),
            grace_secs = cfg.runtime.shutdown_grace_secs,
            "Traders did not stop in time; exiting anyway"
        );
    }

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging(cfg: &config::AppConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.runtime.log_filter));

    let json_logging = std::env::var("SCRIPTBOT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
