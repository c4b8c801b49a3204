//! QoS agent - VM quality of service daemon
//!
//! Runs on each virtualization host, throttling low priority VMs when a CPU
//! package overheats and partitioning cache, memory and network bandwidth
//! between priority classes.

use anyhow::{bail, Result};
use qos_lib::{
    collector::{DevMsr, HostTopology, Hypervisor, VirshConnection},
    controller::BwmCli,
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    Backends, ControlLoopBuilder, QosManager,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting qos-agent");

    if !cfg!(target_arch = "x86_64") {
        bail!("qos-agent only runs on x86_64 hosts");
    }

    let config = config::load()?;
    let host_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    info!(
        host = %host_name,
        net_qos = config.net_qos_management,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::TELEMETRY).await;
    health_registry.register(components::CONTROLLER).await;
    health_registry.register(components::HYPERVISOR).await;

    if config.api_port != 0 {
        let state = Arc::new(api::AppState::new(health_registry.clone()));
        let port = config.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, state).await {
                error!(error = %e, "API server stopped");
            }
        });
    }

    let topology = HostTopology::discover(&config.sysfs_root).await?;
    let registers = DevMsr::open(
        &config.msr_dev_root,
        topology.cores().map(|(core, _)| core),
    )
    .await?;
    let hypervisor = Arc::new(
        VirshConnection::connect(&config.virsh_path, &config.hypervisor_uri).await?,
    );
    // Subscribe before any host state is touched; past `start` only the
    // control loop may fail, and it always cleans up
    let events = hypervisor.subscribe_events().await?;
    let backends = Backends {
        hypervisor,
        registers: Arc::new(registers),
        bandwidth: Arc::new(BwmCli::new(&config.bwmcli_path)),
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let logger = StructuredLogger::new(&host_name);
    let manager = QosManager::start(&config, backends, health_registry.clone(), logger).await?;

    let control_loop = ControlLoopBuilder::new()
        .manager(manager)
        .events(events)
        .power_interval(config.power_interval())
        .resctrl_interval(config.resctrl_interval())
        .build()
        .await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        }
        let _ = shutdown_tx.send(());
    });

    if let Err(e) = control_loop.run(shutdown_rx).await {
        error!(error = %e, class = ?e.class(), "qos-agent exiting after fatal error");
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}
