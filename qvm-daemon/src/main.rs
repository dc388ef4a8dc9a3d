use anyhow::{Context, Result};
use qvm_core::observability::{
    SUBSYSTEM_HYPERVISOR, SUBSYSTEM_SCHEDULER, SUBSYSTEM_STATS, SUBSYSTEM_TRANSPORT,
};
use qvm_core::{
    init_observability, shutdown_observability, CommandExecutor, Config, HealthChecker,
    HypervisorFactory, JsonJobStore, ServerContext, SnapshotScheduler, StatsCollector,
    TransportServer,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod shutdown;

use shutdown::{shutdown_signal, ShutdownManager};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize observability FIRST
    init_observability(
        &config.log_level,
        config.metrics_port,
        config.otlp_endpoint.as_deref(),
    )
    .map_err(|e| anyhow::anyhow!("Failed to initialize observability: {}", e))?;

    info!(uri = %config.hypervisor_uri, listen = %config.listen_addr, "QVM daemon starting");

    let health = HealthChecker::with_subsystems(&[
        SUBSYSTEM_HYPERVISOR,
        SUBSYSTEM_TRANSPORT,
        SUBSYSTEM_SCHEDULER,
        SUBSYSTEM_STATS,
    ])
    .await;

    // Connections are opened per command; this only selects the backend.
    let hypervisor = match HypervisorFactory::create(&config.hypervisor_uri) {
        Ok(hypervisor) => {
            info!(
                backend = hypervisor.name(),
                uri = hypervisor.uri(),
                "Hypervisor backend selected"
            );
            hypervisor
        }
        Err(e) => {
            error!("Failed to select hypervisor backend: {}", e);
            return Err(e.into());
        }
    };

    let executor = CommandExecutor::from_config(hypervisor, &config).with_health(health.clone());

    info!(path = %config.schedule_store_path.display(), "Loading snapshot schedules");
    let store = Arc::new(JsonJobStore::new(&config.schedule_store_path));
    let scheduler = SnapshotScheduler::new(executor.clone(), store).with_health(health.clone());
    if let Err(e) = scheduler.restore().await {
        // Keep serving; new registrations rewrite the store.
        error!(error = %e, "Failed to restore snapshot schedules");
        health.mark_unhealthy(SUBSYSTEM_SCHEDULER, format!("restore failed: {}", e)).await;
    }

    let shutdown_tx = shutdown_signal();
    let mut signal = shutdown_tx.subscribe();
    let mut shutdown = ShutdownManager::new(scheduler.clone());

    let mut context = ServerContext::new(executor.clone(), health.clone())
        .with_scheduler(scheduler)
        .with_max_message_bytes(config.max_message_bytes)
        .with_read_timeout(config.read_timeout());

    if config.stats_sweep_period_secs > 0 {
        let collector = StatsCollector::new(
            executor,
            config.stats_interval_secs,
            Duration::from_secs(config.stats_sweep_period_secs),
        )
        .with_health(health.clone());
        shutdown.track("stats-collector", collector.spawn(shutdown_tx.subscribe()));
        context = context.with_collector(collector);
    } else {
        info!("Background stats collection disabled");
    }

    let server = TransportServer::bind(
        &config.listen_addr,
        Arc::new(context),
        config.max_concurrent_connections,
    )
    .await
    .context("Failed to start command transport")?;
    let server_shutdown = shutdown_tx.subscribe();
    let stop_daemon = shutdown_tx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(server_shutdown).await {
            error!(error = %e, "Command transport failed");
            let _ = stop_daemon.send(());
        }
    });
    shutdown.track("transport", server_handle);

    info!("QVM daemon ready");

    // Wait for shutdown signal
    let _ = signal.recv().await;
    info!("Received shutdown signal");

    shutdown.shutdown().await;

    info!("QVM daemon shutting down");
    shutdown_observability();
    Ok(())
}
