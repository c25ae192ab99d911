// Scheduler binary entry point

use common::clock::{Clock, TokioClock};
use common::config::{PublisherKind, RetentionPolicy, Settings};
use common::db::{DbPool, PostgresTaskRepository, TaskRepository};
use common::queue::{
    BroadcastTriggerPublisher, NatsClient, NatsConfig, NatsTriggerPublisher, TriggerPublisher,
};
use common::scheduler::{SchedulerConfig, SchedulerEngine, TaskService};
use common::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!("Starting task scheduler");

    let db_pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        e
    })?;
    let repository = PostgresTaskRepository::new(db_pool.clone());
    repository.ensure_schema().await.map_err(|e| {
        error!(error = %e, "Failed to prepare task table");
        e
    })?;
    let repository: Arc<dyn TaskRepository> = Arc::new(repository);

    let publisher = build_publisher(&settings).await?;

    let scheduler_config = SchedulerConfig::from_settings(&settings.scheduler)?;
    info!(timezone = %scheduler_config.timezone, "Scheduler configured");

    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let engine = Arc::new(SchedulerEngine::new(
        scheduler_config,
        clock,
        repository.clone(),
        publisher,
    ));
    let service = Arc::new(TaskService::new(engine.clone(), repository));

    let registered = service.load_and_start_enabled_tasks().await?;
    info!(registered, "Scheduler started");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let retention_handle = match settings.scheduler.retention {
        RetentionPolicy::Delete => {
            let service = service.clone();
            let interval = Duration::from_secs(settings.scheduler.retention_sweep_seconds);
            let mut shutdown_rx = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = service.prune_finished_tasks().await {
                                warn!(error = %e, "Retention sweep failed");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Retention sweep stopping");
                            break;
                        }
                    }
                }
            }))
        }
        RetentionPolicy::Retain => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    let _ = shutdown_tx.send(());
    if let Some(handle) = retention_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Retention sweep task failed");
        }
    }

    engine.shutdown().await;
    db_pool.close().await;
    telemetry::shutdown_tracer();

    info!("Scheduler stopped");
    Ok(())
}

async fn build_publisher(settings: &Settings) -> anyhow::Result<Arc<dyn TriggerPublisher>> {
    match settings.scheduler.publisher {
        PublisherKind::Nats => {
            let nats_client = NatsClient::new(NatsConfig::from(&settings.nats))
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to initialize NATS client");
                    e
                })?;
            nats_client.initialize_stream().await.map_err(|e| {
                error!(error = %e, "Failed to initialize NATS stream");
                e
            })?;

            let timeout = Duration::from_secs(settings.nats.publish_timeout_seconds);
            info!(stream = %settings.nats.stream_name, "Publishing triggers to NATS");
            Ok(Arc::new(
                NatsTriggerPublisher::new(nats_client).with_timeout(timeout),
            ))
        }
        PublisherKind::Broadcast => {
            info!("Publishing triggers in-process");
            Ok(Arc::new(BroadcastTriggerPublisher::default()))
        }
    }
}
