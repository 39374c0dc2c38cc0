//! Job service process: registers the built-in handlers, starts workers and
//! schedules, and runs until SIGINT or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use jobs_actors::{JobService, ServiceConfig};
use jobs_core::{JobStore, JobType, ScheduleConfig, WorkerConfig};
use jobs_db::{DbConfig, MemoryJobStore, SurrealJobStore};
use tracing_subscriber::EnvFilter;

mod handlers;

/// How long shutdown may take before the process exits anyway.
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("JOBS_LOG_JSON").is_ok_and(|v| v != "0" && !v.is_empty());

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().with_target(false).try_init()
    } else {
        builder.try_init()
    };
}

/// Workers and schedules a bare deployment starts with.
fn with_defaults(mut config: ServiceConfig) -> ServiceConfig {
    if config.workers.is_empty() {
        config = config
            .with_worker(WorkerConfig::new(4).with_id("general"))
            .with_worker(
                WorkerConfig::new(1)
                    .with_id("maintenance")
                    .with_types([JobType::Cleanup, JobType::HealthCheck]),
            );
    }
    if config.schedules.is_empty() {
        config = config
            .with_schedule(ScheduleConfig::new(
                "health-check",
                "*/5 * * * *",
                JobType::HealthCheck,
            ))
            .with_schedule(ScheduleConfig::new("cleanup", "0 3 * * *", JobType::Cleanup));
    }
    config
}

async fn open_store() -> Result<Arc<dyn JobStore>, Box<dyn std::error::Error>> {
    match DbConfig::from_lookup("JOBS_", |key| std::env::var(key).ok()) {
        Some(db_config) => {
            tracing::info!("Opening job store at {}", db_config.endpoint);
            Ok(Arc::new(SurrealJobStore::open(&db_config).await?))
        }
        None => {
            tracing::info!("JOBS_DB_ENDPOINT not set, using the in-memory job store");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = with_defaults(ServiceConfig::from_env()?);
    let store = open_store().await?;

    let mut service = JobService::new(store, config);
    handlers::register_all(&mut service);
    service.initialize().await?;

    wait_for_signal().await;

    match tokio::time::timeout(FORCE_EXIT_AFTER, service.shutdown()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            tracing::error!("Shutdown did not finish within {:?}, exiting", FORCE_EXIT_AFTER);
            std::process::exit(1);
        }
    }
}
