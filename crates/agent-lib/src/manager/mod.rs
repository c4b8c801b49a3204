//! QoS manager context
//!
//! [`QosManager`] owns every piece of mutable state: host telemetry, the
//! guest registry, the analyzer and the three controllers. It is built once
//! at startup and driven by the [`ControlLoop`], which guarantees that a tick
//! and an event handler never run at the same time.

mod r#loop;

pub use r#loop::{ControlLoop, ControlLoopBuilder};

use crate::analyzer::PowerAnalyzer;
use crate::collector::{GuestRegistry, HostInfo, HostTopology, Hypervisor, RegisterAccess};
use crate::config::QosConfig;
use crate::controller::{
    BandwidthManager, CacheMbwController, CpuController, NetController, ResctrlInfo,
};
use crate::error::{QosError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::DomainEvent;
use crate::observability::{QosMetrics, StructuredLogger};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// External services the manager drives
pub struct Backends {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub registers: Arc<dyn RegisterAccess>,
    pub bandwidth: Arc<dyn BandwidthManager>,
}

/// What one power tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Hotspot packages found this tick
    pub hotspots: Vec<u32>,
    /// Domains blamed this tick
    pub blamed: Vec<u32>,
    /// Domains whose quota was limited
    pub throttled: Vec<u32>,
    /// Domains whose quota was restored
    pub recovered: Vec<u32>,
    /// Set when no rates were available and analysis was skipped
    pub skipped: bool,
}

/// Single owned controller context
pub struct QosManager {
    hypervisor: Arc<dyn Hypervisor>,
    host: HostInfo,
    guests: GuestRegistry,
    analyzer: PowerAnalyzer,
    cpu: CpuController,
    cache: CacheMbwController,
    net: NetController,
    metrics: QosMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
}

impl QosManager {
    /// Probe the host, initialize every controller and take the first baseline
    pub async fn start(
        config: &QosConfig,
        backends: Backends,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Result<Self> {
        config.validate()?;

        let topology = HostTopology::discover(&config.sysfs_root).await?;
        let host = HostInfo::init(topology, backends.registers, &config.sysfs_root).await?;
        let analyzer = PowerAnalyzer::new(config, host.facts())?;

        let mut guests = GuestRegistry::new(&config.cgroup_root);
        guests
            .refresh(backends.hypervisor.as_ref(), host.topology())
            .await?;

        let cpu = CpuController::new(config);
        cpu.init().await.map_err(|e| {
            QosError::Unsupported(format!("cannot set low priority cpu class: {}", e))
        })?;

        ResctrlInfo::ensure_mounted(&config.resctrl_root).await?;
        let resctrl = ResctrlInfo::probe(&config.resctrl_root).await?;
        let cache = CacheMbwController::new(config, &resctrl)?;
        cache.init().await?;

        let mut net = NetController::new(config, backends.bandwidth);
        if let Err(e) = net.init().await {
            if let Err(teardown) = net.teardown().await {
                warn!(error = %teardown, "Failed to remove partial bandwidth manager configuration");
            }
            return Err(e);
        }

        logger.log_startup(
            AGENT_VERSION,
            host.topology().core_count(),
            host.topology().package_count(),
        );

        Ok(Self {
            hypervisor: backends.hypervisor,
            host,
            guests,
            analyzer,
            cpu,
            cache,
            net,
            metrics: QosMetrics::new(),
            logger,
            health,
        })
    }

    pub fn guests(&self) -> &GuestRegistry {
        &self.guests
    }

    pub fn cpu(&self) -> &CpuController {
        &self.cpu
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Start delivering hypervisor events
    pub async fn subscribe_events(&self) -> Result<tokio::sync::mpsc::Receiver<DomainEvent>> {
        self.hypervisor.subscribe_events().await
    }

    /// One power management pass
    ///
    /// A transient sample failure skips analysis and enforcement but the
    /// ledger still advances and recoveries still happen.
    pub async fn power_tick(&mut self) -> Result<TickReport> {
        let started = Instant::now();
        let mut report = TickReport::default();

        self.guests
            .refresh(self.hypervisor.as_ref(), self.host.topology())
            .await?;
        self.metrics.set_domains(
            self.guests.len(),
            self.guests.low_priority_ids().count(),
        );

        let ledger = self.cpu.ledger_mut();
        ledger.purge(&self.guests);
        ledger.advance();

        match self.host.update() {
            Ok(true) => {
                self.health.set_healthy(components::TELEMETRY).await;
                self.analyze(&mut report);
                report.throttled = self.cpu.limit_bandwidth(&self.guests).await?;
            }
            Ok(false) => {
                debug!("Recorded baseline snapshot");
                report.skipped = true;
            }
            Err(e) if e.class().is_recoverable() => {
                warn!(error = %e, "Telemetry sample skipped");
                self.metrics.inc_recoverable_errors(e.class().as_str());
                self.health.record_error(components::TELEMETRY, &e).await;
                report.skipped = true;
            }
            Err(e) => return Err(e),
        }

        report.recovered = self.cpu.recover_bandwidth(&self.guests).await?;

        if !report.throttled.is_empty() {
            self.metrics.inc_throttles(report.throttled.len());
            self.logger.log_throttle(&report.throttled);
        }
        if !report.recovered.is_empty() {
            self.metrics.inc_recoveries(report.recovered.len());
            self.logger.log_recovery(&report.recovered);
        }
        self.metrics.set_throttled_domains(self.cpu.ledger().len());
        self.metrics
            .observe_tick_latency(started.elapsed().as_secs_f64());
        Ok(report)
    }

    fn analyze(&mut self, report: &mut TickReport) {
        let Some(status) = self.host.snapshot() else {
            return;
        };
        for (package, sample) in &status.packages {
            self.metrics.set_package_power(*package, sample.power_watts);
        }

        let hotspots = self.analyzer.analyze_power(status);
        self.metrics.set_hotspot_packages(hotspots.len());

        for package in hotspots.hotspots() {
            self.logger.log_hotspot(
                package,
                status.power_of(package).unwrap_or_default(),
                hotspots.underclocked(package),
            );
            let blamed = self.analyzer.select_victims(
                &hotspots,
                package,
                self.host.topology(),
                &self.guests,
                self.cpu.ledger_mut(),
            );
            report.hotspots.push(package);
            report.blamed.extend(blamed);
        }
    }

    /// Re-apply resctrl task membership of the low priority tree
    pub async fn resctrl_tick(&mut self) -> Result<usize> {
        let moved = self.cache.resync().await?;
        debug!(tasks = moved, "Resctrl membership resynchronized");
        Ok(moved)
    }

    /// Discard collected telemetry and start over from a fresh baseline
    ///
    /// The current registry is only replaced once the rebuild succeeded, so
    /// a failed reset still leaves every throttled domain restorable.
    pub async fn reset_telemetry(&mut self) -> Result<()> {
        let mut guests = self.guests.fresh();
        guests
            .refresh(self.hypervisor.as_ref(), self.host.topology())
            .await?;
        self.guests = guests;
        self.host.rebaseline()?;
        self.metrics.inc_telemetry_resets();
        Ok(())
    }

    /// React to a hypervisor event, returning whether telemetry was reset
    pub async fn handle_event(&mut self, event: &DomainEvent) -> Result<bool> {
        if !event.requires_reset() {
            debug!(domain = %event.domain, kind = ?event.kind, "Ignoring domain event");
            return Ok(false);
        }

        self.reset_telemetry().await?;
        self.logger
            .log_reset(&event.domain, &format!("{:?}", event.kind));

        if event.adds_tasks() {
            match self.guests.find_by_name(&event.domain) {
                Some(record) => {
                    let moved = self.cache.domain_updated(record).await?;
                    self.net.domain_updated(record).await?;
                    debug!(domain = %record.domain_ref(), tasks = moved, "Domain tasks placed");
                }
                None => warn!(domain = %event.domain, "Event for a domain that is not tracked"),
            }
        }
        Ok(true)
    }

    /// Restore every throttled domain and remove the network configuration
    pub async fn shutdown(&mut self, reason: &str) {
        let restored = self.cpu.reset_all(&self.guests).await;
        info!(domains = restored, "Restored cpu quotas");

        if let Err(e) = self.net.teardown().await {
            warn!(error = %e, "Failed to remove bandwidth manager configuration");
        }
        self.health.set_ready(false).await;
        self.logger.log_shutdown(reason);
    }
}
