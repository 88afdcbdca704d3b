// src/main.rs
//! Warden Engine daemon
//!
//! Thin process shell around the engine core: initializes observability,
//! loads configuration, assembles the manager and agreement engine, and
//! waits for shutdown. Network exposure of the operations is a gateway's
//! job and attaches here.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use warden_engine::audit::{self, AuditStore, AuditStoreConfig, AuditTrail};
use warden_engine::observability::{init_metrics, init_tracing};
use warden_engine::resources::monitor::MonitorConfig;
use warden_engine::sandbox::registry::OperationRegistry;
use warden_engine::sandbox::verifier::TrustStore;
use warden_engine::sandbox::SandboxConfig;
use warden_engine::snapshot::store::SnapshotStoreConfig;
use warden_engine::{
    AgentManager, AgreementEngine, EngineConfig, PluginSandbox, ResourceMonitor, SnapshotStore,
};

/// Audit drain cadence
const AUDIT_DRAIN_PERIOD: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize observability (tracing, metrics)
    init_tracing()?;

    info!("Starting Warden Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = EngineConfig::load()?;
    info!("Configuration loaded: {:?}", config);

    if let Err(e) = init_metrics(&config.metrics.listen) {
        error!("Metrics exporter unavailable: {}", e);
    }

    // Assemble the engine
    let monitor = Arc::new(ResourceMonitor::new(MonitorConfig::from_engine(&config)));
    let trust = TrustStore::from_hex_keys(&config.trust.keys)?;
    if trust.is_empty() {
        info!("Trust store is empty; every module attach will be refused");
    }
    let sandbox = Arc::new(PluginSandbox::new(
        trust,
        OperationRegistry::builtin(),
        SandboxConfig::with_timeout_ms(config.runtime.execute_timeout_ms),
    ));
    let snapshots = Arc::new(
        SnapshotStore::new(SnapshotStoreConfig {
            base_dir: config.storage.data_dir.clone(),
            ..Default::default()
        })
        .await?,
    );

    let trail = Arc::new(AuditTrail::new(64 * 1024));
    let audit_store = Arc::new(
        AuditStore::new(AuditStoreConfig {
            base_dir: config.storage.data_dir.clone(),
            ..Default::default()
        })
        .await?,
    );

    let shutdown = CancellationToken::new();
    let drain = tokio::spawn(audit::drain_loop(
        trail.clone(),
        audit_store.clone(),
        AUDIT_DRAIN_PERIOD,
        shutdown.clone(),
    ));

    let manager = Arc::new(AgentManager::new(
        config.clone(),
        monitor,
        sandbox,
        snapshots,
        trail.clone(),
    ));
    // Held for the gateway to drive; dropped on shutdown
    let _agreements = AgreementEngine::new(manager.clone(), trail.clone());

    info!(
        agents = manager.agent_count(),
        "Engine ready; waiting for gateway attachment"
    );

    // Graceful shutdown handler
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Received shutdown signal, cleaning up...");

    manager.terminate_all().await;
    shutdown.cancel();
    if let Err(e) = drain.await {
        error!("Audit drain task failed: {}", e);
    }

    let stats = trail.stats();
    info!(
        recorded = stats.recorded,
        dropped = stats.dropped,
        "Engine stopped"
    );
    Ok(())
}
