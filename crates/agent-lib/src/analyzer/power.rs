//! Power hotspot detection and victim selection
//!
//! A package is a hotspot when its power exceeds `tdp_threshold × TDP`.
//! Inside a hotspot, cores below `freq_threshold × turbo` are underclocked;
//! the busiest low priority domain of each underclocked core is blamed. A
//! hotspot without underclocking blames the [`PACKAGE_VICTIM_COUNT`] low
//! priority domains using the package the most.

use crate::collector::{GuestRegistry, HostFacts, HostStatusSnapshot, HostTopology};
use crate::config::QosConfig;
use crate::controller::AdjustmentLedger;
use crate::error::Result;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Domains blamed for a hotspot without underclocked cores
pub const PACKAGE_VICTIM_COUNT: usize = 3;

/// Outcome of one power analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HotspotReport {
    /// Hotspot package → its underclocked cores
    packages: BTreeMap<u32, Vec<usize>>,
}

impl HotspotReport {
    pub fn hotspots(&self) -> impl Iterator<Item = u32> + '_ {
        self.packages.keys().copied()
    }

    pub fn is_hotspot(&self, package: u32) -> bool {
        self.packages.contains_key(&package)
    }

    /// Underclocked cores of `package`, empty if it is not a hotspot
    pub fn underclocked(&self, package: u32) -> &[usize] {
        self.packages
            .get(&package)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }
}

/// Compares host telemetry against the configured thresholds
#[derive(Debug, Clone)]
pub struct PowerAnalyzer {
    /// Absolute power threshold per package, in watts
    package_tdp_threshold: BTreeMap<u32, f64>,
    /// Absolute frequency threshold, in MHz
    freq_threshold_mhz: f64,
}

impl PowerAnalyzer {
    /// Validate the thresholds and scale them by the host facts
    pub fn new(config: &QosConfig, facts: &HostFacts) -> Result<Self> {
        config.validate()?;

        let freq_threshold_mhz = config.freq_threshold * facts.turbo_freq_mhz;
        let package_tdp_threshold: BTreeMap<u32, f64> = facts
            .tdp_watts
            .iter()
            .map(|(package, tdp)| (*package, config.tdp_threshold * tdp))
            .collect();

        for (package, threshold) in &package_tdp_threshold {
            info!(
                package = package,
                threshold_watts = threshold,
                "Package power threshold"
            );
        }
        info!(
            freq_threshold_mhz = freq_threshold_mhz,
            abnormal_threshold = config.abnormal_threshold,
            quota_threshold = config.quota_threshold,
            "Hotspot thresholds"
        );

        Ok(Self {
            package_tdp_threshold,
            freq_threshold_mhz,
        })
    }

    pub fn freq_threshold_mhz(&self) -> f64 {
        self.freq_threshold_mhz
    }

    pub fn tdp_threshold(&self, package: u32) -> Option<f64> {
        self.package_tdp_threshold.get(&package).copied()
    }

    /// Find hotspot packages and their underclocked cores
    pub fn analyze_power(&self, status: &HostStatusSnapshot) -> HotspotReport {
        let mut report = HotspotReport::default();

        for (package, sample) in &status.packages {
            let Some(threshold) = self.tdp_threshold(*package) else {
                warn!(package = package, "No TDP known for package");
                continue;
            };
            if sample.power_watts <= threshold {
                continue;
            }

            let underclocked: Vec<usize> = status
                .cpus
                .iter()
                .filter(|cpu| cpu.package == *package && cpu.freq_mhz < self.freq_threshold_mhz)
                .map(|cpu| cpu.cpu)
                .collect();
            info!(
                package = package,
                power_watts = sample.power_watts,
                threshold_watts = threshold,
                underclocked = ?underclocked,
                "Package power hotspot"
            );
            report.packages.insert(*package, underclocked);
        }

        report
    }

    /// Blame low priority domains for the hotspot on `package`
    ///
    /// Returns the blamed ids in the order they were chosen.
    pub fn select_victims(
        &self,
        report: &HotspotReport,
        package: u32,
        topology: &HostTopology,
        registry: &GuestRegistry,
        ledger: &mut AdjustmentLedger,
    ) -> Vec<u32> {
        let underclocked = report.underclocked(package);
        let victims = if underclocked.is_empty() {
            Self::package_victims(package, topology, registry)
        } else {
            Self::core_victims(underclocked, registry)
        };

        for id in &victims {
            ledger.blame(*id);
        }
        debug!(package = package, victims = ?victims, "Selected victims");
        victims
    }

    /// Busiest nonzero low priority domain of every underclocked core
    fn core_victims(underclocked: &[usize], registry: &GuestRegistry) -> Vec<u32> {
        let mut victims = Vec::new();
        for cpu in underclocked {
            let top = registry
                .occupants(*cpu)
                .iter()
                .find(|o| o.priority.is_low() && o.usage > 0.0);
            if let Some(occupant) = top {
                debug!(
                    cpu = cpu,
                    domain = %occupant.name,
                    id = occupant.id,
                    usage = occupant.usage,
                    "Top low priority domain on underclocked core"
                );
                if !victims.contains(&occupant.id) {
                    victims.push(occupant.id);
                }
            }
        }
        victims
    }

    /// Low priority domains ranked by usage across the package
    fn package_victims(package: u32, topology: &HostTopology, registry: &GuestRegistry) -> Vec<u32> {
        let candidates: BTreeSet<u32> = topology
            .cores_in(package)
            .flat_map(|cpu| registry.occupants(cpu).iter())
            .filter(|o| o.priority.is_low() && o.usage > 0.0)
            .map(|o| o.id)
            .collect();

        let mut ranked: Vec<(u32, f64)> = candidates
            .into_iter()
            .filter_map(|id| registry.get(id).map(|r| (id, r.usage_in(package))))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        ranked
            .into_iter()
            .take(PACKAGE_VICTIM_COUNT)
            .map(|(id, _)| id)
            .collect()
    }
}
