//! Process wiring: store, pools, signals.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use reportflow_infra::{
    DispatchPool, JobProcessor, JobStore, NotificationPool, PoolHandle, PostgresJobStore,
    ReportHandler, RetryPool, Shutdown,
};
use reportflow_observability::Telemetry;

use crate::artifacts::FsArtifactSink;
use crate::config::WorkerConfig;
use crate::notifier::LogNotificationSink;
use crate::render::ManifestRenderer;

/// Connect, bootstrap the schema, run the enabled pools until a shutdown
/// signal arrives, then drain them.
pub async fn run(config: WorkerConfig, telemetry: Telemetry) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.acquire_timeout())
        .connect(&config.database.url)
        .await
        .context("failed to connect to database")?;

    let store = PostgresJobStore::new(pool, config.store.budget());
    if config.database.ensure_schema {
        store
            .ensure_schema()
            .await
            .context("failed to create job schema")?;
    }

    let shutdown = Shutdown::new();
    let handles = spawn_pools(Arc::new(store), &config, &telemetry, &shutdown);
    info!(
        pools = handles.len(),
        max_retries = config.store.max_retries,
        "reportflow worker started"
    );

    wait_for_signal().await?;
    info!("shutdown requested; draining pools");

    shutdown.trigger();
    for handle in handles {
        let pool = handle.pool();
        handle.join().await;
        info!(pool, "pool stopped");
    }
    Ok(())
}

/// Spawn every pool enabled in `config` against `store`.
pub fn spawn_pools(
    store: Arc<dyn JobStore>,
    config: &WorkerConfig,
    telemetry: &Telemetry,
    shutdown: &Shutdown,
) -> Vec<PoolHandle> {
    let processor = JobProcessor::new(
        store.clone(),
        Arc::new(ReportHandler::new(ManifestRenderer::new(
            config.render.output_dir.clone(),
        ))),
        Arc::new(FsArtifactSink::new(config.artifacts.clone())),
    );

    let mut handles = Vec::new();
    if config.dispatch.enabled {
        let pool = DispatchPool::new(
            processor.clone(),
            config.dispatch.pool_config(),
            telemetry.clone(),
        );
        handles.push(pool.spawn(shutdown.signal()));
    }
    if config.retry.enabled {
        let pool = RetryPool::new(processor, config.retry.pool_config(), telemetry.clone());
        handles.push(pool.spawn(shutdown.signal()));
    }
    if config.notification.enabled {
        let pool = NotificationPool::new(
            store,
            Arc::new(LogNotificationSink),
            config.notification.pool_config(),
            telemetry.clone(),
        );
        handles.push(pool.spawn(shutdown.signal()));
    }
    handles
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    Ok(())
}
