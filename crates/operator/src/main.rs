//! Agent Injector - installs monitoring agents into running containers
//!
//! Watches `MonitoringConfig` resources and pods, and runs the configured
//! install command inside every selected container once it is ready.

use anyhow::{Context, Result};
use operator_lib::{
    cluster::ClusterClient,
    exec::PodExecutor,
    health::HealthRegistry,
    observability::{InjectorMetrics, StructuredLogger},
    reconciler::ReconcileLoop,
    server::{self, AppState},
    watch,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting agent-injector");

    let config = config::OperatorConfig::load()?;
    let scope = config.namespace().unwrap_or("*").to_string();
    info!(
        namespace = %scope,
        exec_timeout_secs = config.exec_timeout_secs,
        max_concurrent = config.max_concurrent_executions,
        "Operator configured"
    );

    let client = ClusterClient::in_cluster()
        .await
        .context("Failed to establish in-cluster identity")?;

    let health_registry = HealthRegistry::with_operator_components().await;
    let metrics = InjectorMetrics::new();
    let logger = StructuredLogger::new(scope);
    logger.log_startup(OPERATOR_VERSION);

    let executor = PodExecutor::new(client.clone()).with_timeout(config.exec_timeout());
    let mut reconcile = ReconcileLoop::new(config.reconciler(), Arc::new(executor))
        .with_health(health_registry.clone())
        .with_logger(logger.clone());
    if config.mark_injected_pods {
        reconcile = reconcile.with_marker(Arc::new(client.clone()));
    }

    let (shutdown_tx, _) = broadcast::channel(1);

    let watches = watch::spawn_watches(
        &client,
        config.namespace(),
        reconcile.sender(),
        health_registry.clone(),
        &shutdown_tx,
    );

    let app_state = Arc::new(AppState::new(health_registry.clone(), metrics));
    let api_port = config.api_port;
    let api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(api_port, app_state, api_shutdown).await {
            error!(error = %e, "API server failed");
        }
    });

    let loop_handle = tokio::spawn(reconcile.run(shutdown_tx.subscribe()));

    health_registry.set_ready(true).await;

    let reason = wait_for_signal().await?;
    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());

    let correlator = loop_handle.await.context("Reconcile loop panicked")?;
    info!(
        tracked_pods = correlator.tracked_pods(),
        "Reconcile loop stopped"
    );

    for handle in watches {
        let _ = handle.await;
    }
    let _ = api_handle.await;

    Ok(())
}

/// Wait for SIGINT or SIGTERM and name the one received.
async fn wait_for_signal() -> Result<&'static str> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;

    let reason = tokio::select! {
        _ = sigint.recv() => "SIGINT received",
        _ = sigterm.recv() => "SIGTERM received",
    };
    Ok(reason)
}
