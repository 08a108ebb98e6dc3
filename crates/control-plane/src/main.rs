// Framefarm control plane
// Decision: One process hosts the HTTP API, the scheduler loop, the fleet controller
// and (optionally) in-process workers; several processes may share one Postgres store

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use framefarm_control_plane::telemetry::{init_telemetry, TelemetryConfig};
use framefarm_control_plane::{build_app, FarmConfig, Services};
use framefarm_scheduler::dispatch::LocalDispatchChannel;
use framefarm_scheduler::fleet::{DryRunProvisioner, FleetController, HttpProvisioner, Provisioner};
use framefarm_scheduler::worker::{CommandExecutor, ExecutorRegistry, WorkerConfig, WorkerRunner};
use framefarm_scheduler::{
    DecomposerConfig, InMemoryNodeRegistry, InMemoryTaskStore, JobDecomposer, NodeRegistry,
    PostgresTaskStore, Scheduler, TaskStore,
};
use sqlx::PgPool;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine
    let _ = dotenvy::dotenv();

    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.service_version = Some(env!("CARGO_PKG_VERSION").to_string());
    init_telemetry(telemetry_config);

    let config = FarmConfig::from_env().context("Invalid configuration")?;
    tracing::info!("framefarm control plane starting...");

    // Task store
    let store: Arc<dyn TaskStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to database")?;
            let store = PostgresTaskStore::new(pool);
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Connected to database, migrations applied");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory task store (state is lost on exit)");
            Arc::new(InMemoryTaskStore::new())
        }
    };

    let registry: Arc<dyn NodeRegistry> = Arc::new(InMemoryNodeRegistry::new());

    let provisioner: Arc<dyn Provisioner> = match &config.provision_webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Using provisioning webhook");
            Arc::new(HttpProvisioner::new(url.clone()).context("Failed to build provisioner")?)
        }
        None => {
            tracing::info!("PROVISION_WEBHOOK_URL not set, fleet commands are logged only");
            Arc::new(DryRunProvisioner::new())
        }
    };

    // Scheduler with in-process dispatch
    let (channel, queue) = LocalDispatchChannel::new(config.dispatch_capacity);
    let scheduler = Scheduler::new(store.clone(), Arc::new(channel), config.scheduler.clone());
    let decomposer = Arc::new(
        JobDecomposer::new(store.clone(), DecomposerConfig::default())
            .with_wake(scheduler.wake_handle()),
    );

    match decomposer.repair_incomplete().await {
        Ok(0) => {}
        Ok(repaired) => tracing::info!(repaired, "Completed interrupted job decompositions"),
        Err(e) => tracing::error!("Startup repair pass failed: {}", e),
    }

    // Local workers: shell commands for every job type
    let executors = Arc::new(ExecutorRegistry::new().with_fallback(Arc::new(CommandExecutor::new())));
    let workers: Vec<WorkerRunner> = (0..config.local_workers)
        .map(|i| {
            WorkerRunner::new(
                WorkerConfig::default().with_node_id(format!("local-worker-{i}")),
                queue.clone(),
                executors.clone(),
                registry.clone(),
            )
        })
        .collect();
    for worker in &workers {
        worker.start();
    }

    // Without a consumer the dispatch queue would only hold claims until their leases expire
    if workers.is_empty() {
        tracing::warn!("LOCAL_WORKERS=0, scheduler loop disabled on this instance");
    } else {
        scheduler.start().context("Failed to start scheduler")?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fleet = Arc::new(
        FleetController::new(config.fleet.clone(), store.clone(), registry.clone(), provisioner)
            .context("Invalid fleet configuration")?,
    );
    let fleet_handle = tokio::spawn(fleet.run(shutdown_rx.clone()));

    let repair_handle = tokio::spawn(repair_loop(
        decomposer.clone(),
        config.scheduler.sweep_interval,
        shutdown_rx,
    ));

    // HTTP
    if !config.api_prefix.is_empty() {
        tracing::info!(prefix = %config.api_prefix, "API prefix configured");
    }
    if config.cors_origins.is_empty() {
        tracing::info!("CORS not configured (same-origin requests only)");
    } else {
        tracing::info!(origins = ?config.cors_origins, "CORS origins configured");
    }
    let services = Services {
        store,
        decomposer,
        registry,
    };
    let app = build_app(&services, &config.api_prefix, &config.cors_origins);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain: stop claiming first, then let workers finish what they hold
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown: {}", e);
    }
    for worker in &workers {
        worker.shutdown().await;
    }
    for handle in [fleet_handle, repair_handle] {
        if let Err(e) = handle.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }

    tracing::info!("framefarm control plane stopped");
    Ok(())
}

/// Re-run decomposition for jobs whose submission was interrupted
async fn repair_loop(
    decomposer: Arc<JobDecomposer>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The startup pass already ran
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match decomposer.repair_incomplete().await {
                    Ok(0) => {}
                    Ok(repaired) => tracing::info!(repaired, "Repaired job decompositions"),
                    Err(e) => tracing::error!("Repair pass failed: {}", e),
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
