//! Observability infrastructure for the QoS agent
//!
//! Provides:
//! - Prometheus metrics (tick latency, package power, throttling activity)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance, `None` if registration failed
static GLOBAL_METRICS: OnceLock<Option<QosMetricsInner>> = OnceLock::new();

struct QosMetricsInner {
    tick_latency_seconds: Histogram,
    package_power_watts: GaugeVec,
    hotspot_packages: IntGauge,
    domains_monitored: IntGauge,
    low_priority_domains: IntGauge,
    throttled_domains: IntGauge,
    throttles: IntCounter,
    recoveries: IntCounter,
    telemetry_resets: IntCounter,
    recoverable_errors: IntCounterVec,
}

impl QosMetricsInner {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            tick_latency_seconds: register_histogram!(
                "qos_agent_tick_latency_seconds",
                "Time spent in one power management tick",
                LATENCY_BUCKETS.to_vec()
            )?,
            package_power_watts: register_gauge_vec!(
                "qos_agent_package_power_watts",
                "Power drawn by each CPU package over the last tick",
                &["package"]
            )?,
            hotspot_packages: register_int_gauge!(
                "qos_agent_hotspot_packages",
                "Number of packages above their TDP threshold"
            )?,
            domains_monitored: register_int_gauge!(
                "qos_agent_domains_monitored",
                "Number of active domains being tracked"
            )?,
            low_priority_domains: register_int_gauge!(
                "qos_agent_low_priority_domains",
                "Number of active low priority domains"
            )?,
            throttled_domains: register_int_gauge!(
                "qos_agent_throttled_domains",
                "Number of domains held in the adjustment ledger"
            )?,
            throttles: register_int_counter!(
                "qos_agent_throttles_total",
                "Total number of CPU quota limits applied"
            )?,
            recoveries: register_int_counter!(
                "qos_agent_recoveries_total",
                "Total number of CPU quotas restored"
            )?,
            telemetry_resets: register_int_counter!(
                "qos_agent_telemetry_resets_total",
                "Total number of event driven telemetry resets"
            )?,
            recoverable_errors: register_int_counter_vec!(
                "qos_agent_recoverable_errors_total",
                "Errors that skipped a tick or dropped a domain",
                &["class"]
            )?,
        })
    }
}

/// QoS metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct QosMetrics {
    _private: (),
}

impl Default for QosMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl QosMetrics {
    /// Create a new metrics handle (registers global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match QosMetricsInner::register() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register metrics, metrics disabled");
                None
            }
        });
        Self { _private: () }
    }

    fn inner(&self) -> Option<&QosMetricsInner> {
        GLOBAL_METRICS.get().and_then(Option::as_ref)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.tick_latency_seconds.observe(duration_secs);
        }
    }

    pub fn set_package_power(&self, package: u32, watts: f64) {
        if let Some(m) = self.inner() {
            let label = package.to_string();
            m.package_power_watts
                .with_label_values(&[label.as_str()])
                .set(watts);
        }
    }

    pub fn set_hotspot_packages(&self, count: usize) {
        if let Some(m) = self.inner() {
            m.hotspot_packages.set(count as i64);
        }
    }

    /// Update domain gauges after a registry refresh
    pub fn set_domains(&self, total: usize, low_priority: usize) {
        if let Some(m) = self.inner() {
            m.domains_monitored.set(total as i64);
            m.low_priority_domains.set(low_priority as i64);
        }
    }

    pub fn set_throttled_domains(&self, count: usize) {
        if let Some(m) = self.inner() {
            m.throttled_domains.set(count as i64);
        }
    }

    pub fn inc_throttles(&self, count: usize) {
        if let Some(m) = self.inner() {
            m.throttles.inc_by(count as u64);
        }
    }

    pub fn inc_recoveries(&self, count: usize) {
        if let Some(m) = self.inner() {
            m.recoveries.inc_by(count as u64);
        }
    }

    pub fn inc_telemetry_resets(&self) {
        if let Some(m) = self.inner() {
            m.telemetry_resets.inc();
        }
    }

    /// Count a recoverable error by its class label
    pub fn inc_recoverable_errors(&self, class: &str) {
        if let Some(m) = self.inner() {
            m.recoverable_errors.with_label_values(&[class]).inc();
        }
    }
}

/// Structured logger for agent events
///
/// Emits stable `event = "..."` records for the actions an operator audits.
#[derive(Clone)]
pub struct StructuredLogger {
    host_name: String,
}

impl StructuredLogger {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, cores: usize, packages: usize) {
        info!(
            event = "agent_started",
            host = %self.host_name,
            agent_version = %version,
            cores = cores,
            packages = packages,
            "QoS agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            host = %self.host_name,
            reason = %reason,
            "QoS agent shutting down"
        );
    }

    /// Log a package above its power threshold
    pub fn log_hotspot(&self, package: u32, power_watts: f64, underclocked: &[usize]) {
        warn!(
            event = "hotspot_detected",
            host = %self.host_name,
            package = package,
            power_watts = power_watts,
            underclocked_cores = ?underclocked,
            "Package power hotspot detected"
        );
    }

    pub fn log_throttle(&self, ids: &[u32]) {
        info!(
            event = "domains_throttled",
            host = %self.host_name,
            domains = ?ids,
            "Low priority domains throttled"
        );
    }

    pub fn log_recovery(&self, ids: &[u32]) {
        info!(
            event = "domains_recovered",
            host = %self.host_name,
            domains = ?ids,
            "Low priority domains recovered"
        );
    }

    /// Log a telemetry reset triggered by a hypervisor event
    pub fn log_reset(&self, domain: &str, cause: &str) {
        info!(
            event = "telemetry_reset",
            host = %self.host_name,
            domain = %domain,
            cause = %cause,
            "Telemetry reset after domain event"
        );
    }
}
