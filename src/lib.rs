//! runledger -- script execution and scheduling engine.
//!
//! Runs a catalog of external jobs on demand, from a manual run queue and on
//! recurring intervals, recording every execution and its output in a
//! SQLite ledger that survives restarts of the host process.

pub mod activity;
pub mod api;
pub mod catalog;
pub mod config;
pub mod ledger;
pub mod progress;
pub mod reconciler;
pub mod scheduler;
pub mod storage;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::activity::ActivityLog;
use crate::api::state::AppState;
use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::ledger::Ledger;
use crate::reconciler::Reconciler;
use crate::scheduler::{CronQueue, Scheduler};
use crate::supervisor::Supervisor;

const RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Every service, constructed once and shared by cloning.
#[derive(Clone)]
pub struct Services {
    pub catalog: Arc<Catalog>,
    pub ledger: Ledger,
    pub activity: Arc<ActivityLog>,
    pub supervisor: Supervisor,
    pub reconciler: Reconciler,
    pub scheduler: Scheduler,
    pub queue: CronQueue,
}

impl Services {
    pub async fn build(config: &AppConfig) -> Result<Self> {
        let catalog = Arc::new(config.catalog()?);

        info!(db_path = %config.storage.db_path, "initializing database");
        let pool = storage::open_pool(&config.storage.db_path)
            .with_context(|| format!("failed to open database {}", config.storage.db_path))?;
        let ledger = Ledger::with_retry_policy(pool, config.retry_policy());

        let activity = match &config.activity.path {
            Some(path) => ActivityLog::open(path.clone(), config.activity.max_entries).await?,
            None => ActivityLog::disabled(),
        };
        let activity = Arc::new(activity);

        let supervisor = Supervisor::new(
            ledger.clone(),
            Arc::clone(&activity),
            config.runner_settings(),
        );
        let reconciler = Reconciler::new(supervisor.clone());
        let scheduler = Scheduler::new(
            supervisor.clone(),
            Arc::clone(&catalog),
            config.scheduler_settings(),
        );
        let queue = CronQueue::new(
            supervisor.clone(),
            Arc::clone(&catalog),
            config.queue_settings(),
        );

        Ok(Self {
            catalog,
            ledger,
            activity,
            supervisor,
            reconciler,
            scheduler,
            queue,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            catalog: Arc::clone(&self.catalog),
            ledger: self.ledger.clone(),
            supervisor: self.supervisor.clone(),
            reconciler: self.reconciler.clone(),
            scheduler: self.scheduler.clone(),
            queue: self.queue.clone(),
            activity: Arc::clone(&self.activity),
        }
    }
}

/// Start the daemon: heal orphaned executions, start the scheduler and the
/// retention task, then serve the HTTP control surface until Ctrl-C.
pub async fn serve(config: AppConfig) -> Result<()> {
    let services = Services::build(&config).await?;

    // Must finish before anything can start a new execution.
    services
        .reconciler
        .heal_orphans()
        .await
        .context("failed to recover orphaned executions")?;

    let retention = tokio::spawn(retention_loop(
        services.ledger.clone(),
        config.storage.retention_days,
    ));
    services.scheduler.start().await;

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let app = api::router(services.app_state());

    info!(%addr, jobs = services.catalog.list().len(), "runledger listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    services.queue.stop();
    services.scheduler.stop().await;
    retention.abort();
    Ok(())
}

async fn retention_loop(ledger: Ledger, days: u32) {
    let mut ticker = tokio::time::interval(RETENTION_PERIOD);
    loop {
        ticker.tick().await;
        match ledger.cleanup_older_than(days).await {
            Ok(deleted) => info!(deleted, days, "retention pass complete"),
            Err(e) => warn!(error = %e, "retention pass failed"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
