//! Control loop
//!
//! Runs the power tick, the resctrl resync tick and hypervisor event
//! handling on one task, so they are mutually exclusive by construction.

use super::QosManager;
use crate::error::{HypervisorError, QosError, Result};
use crate::health::components;
use crate::models::DomainEvent;
use crate::observability::QosMetrics;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Drives a [`QosManager`] until shutdown or a fatal error
pub struct ControlLoop {
    manager: QosManager,
    events: mpsc::Receiver<DomainEvent>,
    power_interval: Duration,
    resctrl_interval: Duration,
    metrics: QosMetrics,
}

impl ControlLoop {
    pub fn new(
        manager: QosManager,
        events: mpsc::Receiver<DomainEvent>,
        power_interval: Duration,
        resctrl_interval: Duration,
    ) -> Self {
        Self {
            manager,
            events,
            power_interval,
            resctrl_interval,
            metrics: QosMetrics::new(),
        }
    }

    /// Run until `shutdown` fires or an unrecoverable error occurs
    ///
    /// Throttled domains are restored on every exit path.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(
            power_interval_ms = self.power_interval.as_millis() as u64,
            resctrl_interval_ms = self.resctrl_interval.as_millis() as u64,
            "Starting QoS control loop"
        );
        self.manager.health().set_ready(true).await;

        let result = self.drive(&mut shutdown).await;
        let reason = match &result {
            Ok(()) => "shutdown requested".to_string(),
            Err(e) => {
                error!(error = %e, class = ?e.class(), "Control loop failed");
                format!("fatal error: {}", e)
            }
        };
        self.manager.shutdown(&reason).await;
        result
    }

    async fn drive(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<()> {
        let mut power = interval(self.power_interval);
        power.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resctrl = interval(self.resctrl_interval);
        resctrl.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick completes immediately; the baseline was just taken
        power.tick().await;
        resctrl.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down QoS control loop");
                    return Ok(());
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        let err = QosError::from(HypervisorError::Other(
                            "hypervisor event stream closed".to_string(),
                        ));
                        self.manager
                            .health()
                            .record_error(components::HYPERVISOR, &err)
                            .await;
                        return Err(err);
                    };
                    let reset = self.manager.handle_event(&event).await;
                    if matches!(reset, Ok(true)) {
                        // Restart the power period from the new baseline
                        power.reset();
                    }
                    self.settle(reset.map(|_| ()), components::HYPERVISOR).await?;
                }
                _ = power.tick() => {
                    let result = self.manager.power_tick().await;
                    self.settle(result.map(|_| ()), components::CONTROLLER).await?;
                }
                _ = resctrl.tick() => {
                    let result = self.manager.resctrl_tick().await;
                    self.settle(result.map(|_| ()), components::CONTROLLER).await?;
                }
            }
        }
    }

    /// Swallow recoverable errors, propagate fatal ones
    async fn settle(&self, result: Result<()>, component: &str) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.class().is_recoverable() => {
                warn!(error = %e, component = component, "Recoverable error, continuing");
                self.metrics.inc_recoverable_errors(e.class().as_str());
                self.manager.health().record_error(component, &e).await;
                Ok(())
            }
            Err(e) => {
                self.manager.health().record_error(component, &e).await;
                Err(e)
            }
        }
    }
}

/// Builder for creating the control loop
pub struct ControlLoopBuilder {
    manager: Option<QosManager>,
    events: Option<mpsc::Receiver<DomainEvent>>,
    power_interval: Duration,
    resctrl_interval: Duration,
}

impl ControlLoopBuilder {
    pub fn new() -> Self {
        Self {
            manager: None,
            events: None,
            power_interval: Duration::from_secs(1),
            resctrl_interval: Duration::from_millis(500),
        }
    }

    pub fn manager(mut self, manager: QosManager) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Use an already subscribed event stream
    pub fn events(mut self, events: mpsc::Receiver<DomainEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn power_interval(mut self, interval: Duration) -> Self {
        self.power_interval = interval;
        self
    }

    pub fn resctrl_interval(mut self, interval: Duration) -> Self {
        self.resctrl_interval = interval;
        self
    }

    /// Build the loop, subscribing to hypervisor events if no stream was given
    pub async fn build(self) -> Result<ControlLoop> {
        let manager = self
            .manager
            .ok_or_else(|| QosError::Unsupported("control loop needs a manager".to_string()))?;
        let events = match self.events {
            Some(events) => events,
            None => manager.subscribe_events().await?,
        };
        Ok(ControlLoop::new(
            manager,
            events,
            self.power_interval,
            self.resctrl_interval,
        ))
    }
}

impl Default for ControlLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
