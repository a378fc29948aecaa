pub mod models {
    pub mod telemetry;
}

pub mod auth;
pub mod config;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod store;
}
pub mod schema;
pub mod services {
    pub mod broadcast;
    pub mod broker;
    pub mod dedup;
    pub mod hierarchy;
    pub mod ingest;
    pub mod measurements;
    pub mod persist;
    pub mod realtime;
    pub mod retry;
    pub mod rooms;
    pub mod state;
    pub mod warnings;
}

use crate::auth::{Authenticator, TokenDirectory};
use crate::config::Config;
use crate::db::store::{HierarchySource, PgStore, TelemetryStore};
use crate::services::broadcast::Broadcaster;
use crate::services::broker::BrokerManager;
use crate::services::hierarchy::HierarchyCache;
use crate::services::ingest::{self, DeviceWorkers, Ingestor, PipelineSettings};
use crate::services::measurements::MeasurementCache;
use crate::services::persist::{PersistSettings, PersistenceCoordinator};
use crate::services::realtime::RealtimeServer;
use crate::services::retry::{self, RetryQueue};
use crate::services::rooms::{RoomHub, RoomService};
use crate::services::warnings::{LogOnlyWarnings, WarningChecker, WebhookWarnings};
use diesel::PgConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Messages buffered per device before the broker loop waits on that device.
const WORKER_QUEUE_DEPTH: usize = 64;
const WORKER_IDLE: Duration = Duration::from_secs(300);
/// How long shutdown waits for device workers to write what they already accepted.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (db_pool={}, broker_refresh={}s, dedup_window={}s, persist_attempts={}, retry_queue={}x{}s, realtime_bind={}, warnings={})",
        cfg.database.pool_size,
        cfg.broker.refresh_interval.as_secs(),
        cfg.ingest.dedup_window.as_secs(),
        cfg.ingest.persist_max_attempts,
        cfg.ingest.retry_queue_capacity,
        cfg.ingest.retry_queue_interval.as_secs(),
        cfg.realtime.bind,
        cfg.warnings.webhook_url.as_deref().unwrap_or("log-only")
    );

    // 2) Connect DB
    let store = Arc::new(PgStore::connect(&cfg.database)?);
    let mut conn = store
        .connection()
        .map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(&mut conn)?;
    drop(conn);

    // 4) Everything else is async
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Starting async runtime failed: {}", e))?;
    runtime.block_on(serve(cfg, store))
}

async fn serve(cfg: Config, store: Arc<PgStore>) -> Result<(), String> {
    let telemetry: Arc<dyn TelemetryStore> = store.clone();
    let source: Arc<dyn HierarchySource> = store;

    // 5) Realtime rooms and fan-out
    let hub = Arc::new(RoomHub::new());
    let hierarchy = HierarchyCache::new(source, cfg.realtime.hierarchy_ttl);
    let rooms = Arc::new(RoomService::new(hub.clone(), hierarchy.clone()));
    let broadcaster = Arc::new(Broadcaster::new(hub.clone(), hierarchy.clone()));

    // 6) Persistence
    let warnings: Arc<dyn WarningChecker> = match &cfg.warnings.webhook_url {
        Some(url) => Arc::new(WebhookWarnings::new(url.clone(), cfg.warnings.timeout)),
        None => Arc::new(LogOnlyWarnings),
    };
    let measurements = Arc::new(MeasurementCache::new());
    let retry_queue = Arc::new(RetryQueue::new(cfg.ingest.retry_queue_capacity));
    let coordinator = Arc::new(PersistenceCoordinator::new(
        telemetry.clone(),
        measurements.clone(),
        retry_queue.clone(),
        broadcaster,
        warnings,
        PersistSettings {
            max_attempts: cfg.ingest.persist_max_attempts,
            retry_delay: cfg.ingest.persist_retry_delay,
        },
    ));

    // 7) Ingestion pipeline, seeded from latest values
    let ingestor = Arc::new(Ingestor::new(
        telemetry.clone(),
        measurements.clone(),
        coordinator.clone(),
        PipelineSettings::from(&cfg.ingest),
    ));
    ingestor
        .hydrate()
        .await
        .map_err(|e| format!("Loading latest values failed: {}", e))?;
    let workers = Arc::new(DeviceWorkers::new(ingestor, WORKER_QUEUE_DEPTH, WORKER_IDLE));

    // 8) Brokers
    let brokers = Arc::new(BrokerManager::new(
        telemetry,
        measurements,
        workers.clone(),
        cfg.broker.clone(),
    ));
    let connected = brokers
        .initialize()
        .await
        .map_err(|e| format!("Loading device registry failed: {}", e))?;
    if connected == 0 {
        warn!("No active devices with a usable broker; waiting for the next refresh");
    }

    // 9) Realtime listener
    let auth: Arc<dyn Authenticator> = match &cfg.realtime.tokens_file {
        Some(path) => {
            let directory = TokenDirectory::load(path)?;
            info!("Loaded {} realtime token(s) from {}", directory.len(), path.display());
            Arc::new(directory)
        }
        None => {
            warn!("REALTIME_TOKENS_FILE not set; realtime clients are anonymous");
            Arc::new(TokenDirectory::empty())
        }
    };
    let listener = TcpListener::bind(cfg.realtime.bind)
        .await
        .map_err(|e| format!("Binding realtime listener on {} failed: {}", cfg.realtime.bind, e))?;
    let realtime = Arc::new(RealtimeServer::new(rooms, auth));

    // 10) Background loops until ctrl-c
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        tokio::spawn(realtime.serve(listener, shutdown_rx.clone())),
        tokio::spawn(brokers.clone().run_refresh_loop(shutdown_rx.clone())),
        tokio::spawn(retry::run_processor(
            coordinator.clone(),
            retry_queue.clone(),
            cfg.ingest.retry_queue_interval,
            cfg.ingest.retry_queue_batch,
            cfg.ingest.retry_queue_max_retries,
            shutdown_rx.clone(),
        )),
        tokio::spawn(ingest::run_stats_loop(
            workers.clone(),
            hub,
            hierarchy,
            cfg.ingest.stats_interval,
            shutdown_rx,
        )),
    ];

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Waiting for shutdown signal failed: {}", e))?;
    info!("Shutdown requested");
    shutdown_tx.send_replace(true);

    // no new messages past this point; then finish what the workers and the retry queue hold
    brokers.shutdown().await;
    workers.shutdown(WORKER_SHUTDOWN_GRACE).await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    retry::drain_remaining(&coordinator, &retry_queue, cfg.ingest.retry_queue_max_retries).await;
    info!("Shutdown complete");
    Ok(())
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                env_file = Some(PathBuf::from(path_str));
            }
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }

    match env_file {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            // values already in the process environment win
            dotenvy::from_path(&path).map_err(|e| format!("failed to load {}: {}", path.display(), e))?;
            Ok(Some(LoadedEnvFile { path, explicit: true }))
        }
        None => match dotenvy::dotenv() {
            Ok(path) => Ok(Some(LoadedEnvFile { path, explicit: false })),
            Err(e) if e.not_found() => Ok(None),
            Err(e) => Err(format!("failed to load .env: {}", e)),
        },
    }
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "telemetry-hub {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
