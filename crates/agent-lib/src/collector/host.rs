//! Host telemetry: static hardware facts and per-tick counter snapshots
//!
//! Frequency is derived from the APERF/MPERF cycle counters of every core,
//! package power from the RAPL energy counter read on one representative
//! core per package. Both need two time-separated snapshots; [`HostInfo`]
//! keeps exactly the most recent one.

use super::cpu_model::{intel, CpuModel};
use super::msr::{regs, RegisterAccess};
use super::topology::HostTopology;
use crate::error::{QosError, Result};
use crate::sysfs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, warn};

const NANOS_PER_SEC: f64 = 1e9;
const MICROWATTS_PER_WATT: f64 = 1e6;

/// PKG_ENERGY_STATUS only carries 32 significant bits
const ENERGY_COUNTER_MASK: u64 = 0xFFFF_FFFF;

/// Core used for package-independent registers
const BASE_CPU: usize = 0;

/// Nanoseconds on a process-local monotonic clock
pub fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Cycle counters of one core
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuSample {
    pub cpu: usize,
    pub package: u32,
    /// Active cycles, already scaled by the acceleration multiplier
    pub aperf: u64,
    /// Reference cycles, already scaled by the acceleration multiplier
    pub mperf: u64,
    pub timestamp_ns: u64,
    /// Derived against the previous snapshot, 0 until then
    pub freq_mhz: f64,
}

/// Energy counter of one package
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageSample {
    pub package: u32,
    /// Representative core the counter was read on
    pub cpu: usize,
    pub energy: u64,
    pub timestamp_ns: u64,
    /// Derived against the previous snapshot, 0 until then
    pub power_watts: f64,
}

/// One reading of every core and package counter
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostStatusSnapshot {
    pub cpus: Vec<CpuSample>,
    pub packages: BTreeMap<u32, PackageSample>,
}

impl HostStatusSnapshot {
    /// Read all counters
    ///
    /// A jittering counter pair or a core reporting zero for both counters
    /// fails the whole snapshot with a transient error.
    pub fn sample(
        topology: &HostTopology,
        regs: &dyn RegisterAccess,
        multiplier: u64,
    ) -> Result<Self> {
        let mut snapshot = Self {
            cpus: Vec::with_capacity(topology.core_count()),
            packages: BTreeMap::new(),
        };

        for (cpu, package) in topology.cores() {
            let (aperf, mperf) = regs.read_perf_counters(cpu)?;
            let timestamp_ns = monotonic_ns();
            if aperf == 0 && mperf == 0 {
                return Err(QosError::EmptyCounters { cpu });
            }
            snapshot.cpus.push(CpuSample {
                cpu,
                package,
                aperf: aperf.wrapping_mul(multiplier),
                mperf: mperf.wrapping_mul(multiplier),
                timestamp_ns,
                freq_mhz: 0.0,
            });
        }

        for (package, cpu) in topology.first_cores() {
            let energy = regs.read_msr(cpu, regs::PKG_ENERGY_STATUS)? & ENERGY_COUNTER_MASK;
            snapshot.packages.insert(
                package,
                PackageSample {
                    package,
                    cpu,
                    energy,
                    timestamp_ns: monotonic_ns(),
                    power_watts: 0.0,
                },
            );
        }

        Ok(snapshot)
    }

    /// Derive per-core frequency and per-package power relative to `old`
    pub fn derive_rates(
        &mut self,
        old: &HostStatusSnapshot,
        base_freq_mhz: f64,
        energy_unit: f64,
    ) -> Result<()> {
        for (current, previous) in self.cpus.iter_mut().zip(old.cpus.iter()) {
            let reference = current.mperf.wrapping_sub(previous.mperf);
            if reference == 0 {
                return Err(QosError::ZeroDelta {
                    what: "reference cycle",
                    index: current.cpu,
                });
            }
            let active = current.aperf.wrapping_sub(previous.aperf);
            current.freq_mhz = base_freq_mhz * active as f64 / reference as f64;

            debug!(
                cpu = current.cpu,
                aperf_delta = active,
                mperf_delta = reference,
                freq_mhz = current.freq_mhz,
                "Derived core frequency"
            );
        }

        for (package, current) in self.packages.iter_mut() {
            let Some(previous) = old.packages.get(package) else {
                continue;
            };
            let interval = current.timestamp_ns.saturating_sub(previous.timestamp_ns);
            if interval == 0 {
                return Err(QosError::ZeroDelta {
                    what: "sample time",
                    index: *package as usize,
                });
            }
            let energy = current.energy.wrapping_sub(previous.energy) & ENERGY_COUNTER_MASK;
            current.power_watts = energy as f64 * energy_unit / interval as f64 * NANOS_PER_SEC;

            debug!(
                package = package,
                energy_delta = energy,
                interval_ns = interval,
                power_watts = current.power_watts,
                "Derived package power"
            );
        }

        Ok(())
    }

    pub fn power_of(&self, package: u32) -> Option<f64> {
        self.packages.get(&package).map(|p| p.power_watts)
    }
}

/// Hardware facts determined once at startup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostFacts {
    #[serde(skip)]
    pub model: CpuModel,
    pub base_freq_mhz: f64,
    pub turbo_freq_mhz: f64,
    /// Thermal design power per package, in watts
    pub tdp_watts: BTreeMap<u32, f64>,
    /// Joules per energy counter increment
    pub energy_unit: f64,
    /// Scale applied to both cycle counters
    pub multiplier: u64,
}

impl HostFacts {
    /// Probe frequencies, TDP and energy unit
    pub async fn probe(
        topology: &HostTopology,
        regs: &dyn RegisterAccess,
        sysfs_root: &Path,
    ) -> Result<Self> {
        if !regs.is_genuine_intel() {
            return Err(QosError::Unsupported(
                "only GenuineIntel processors are supported".to_string(),
            ));
        }
        if !regs.has_aperf() {
            return Err(QosError::Unsupported(
                "cpu lacks APERF/MPERF, core frequency cannot be measured".to_string(),
            ));
        }
        let model = CpuModel::from_signature(regs.cpu_signature());
        info!(family = model.family, model = model.model, "Detected cpu model");

        let bclk = model.bclk_mhz(regs, BASE_CPU)?;
        let base_ratio = (regs.read_msr(BASE_CPU, regs::PLATFORM_INFO)? >> 8) & 0xFF;
        let base_freq_mhz = base_ratio as f64 * bclk;
        if base_freq_mhz <= 0.0 {
            return Err(QosError::Unsupported(
                "platform info reports a zero base ratio".to_string(),
            ));
        }
        info!(base_freq_mhz = base_freq_mhz, "Base frequency");

        let turbo_freq_mhz = if Self::turbo_enabled(sysfs_root).await {
            let ratio = (regs.read_msr(BASE_CPU, regs::TURBO_RATIO_LIMIT)? >> 56) & 0xFF;
            let turbo = ratio as f64 * bclk;
            info!(turbo_freq_mhz = turbo, "Turbo frequency");
            turbo
        } else {
            info!("Turbo boost disabled, using base frequency as turbo frequency");
            base_freq_mhz
        };

        let mut tdp_watts = BTreeMap::new();
        for package in topology.packages() {
            let path = sysfs_root.join(format!(
                "class/powercap/intel-rapl/intel-rapl:{}/constraint_0_max_power_uw",
                package
            ));
            let microwatts: u64 = sysfs::read_value(&path).await.map_err(|e| {
                QosError::Unsupported(format!("package {} TDP unreadable: {}", package, e))
            })?;
            let tdp = microwatts as f64 / MICROWATTS_PER_WATT;
            info!(package = package, tdp_watts = tdp, "Package TDP");
            tdp_watts.insert(package, tdp);
        }

        let unit_shift = (regs.read_msr(BASE_CPU, regs::RAPL_POWER_UNIT)? >> 8) & 0x1F;
        let mut energy_unit = 1.0 / (1u64 << unit_shift) as f64;
        if model.model == intel::ATOM_SILVERMONT {
            energy_unit /= 100_000.0;
        }
        info!(energy_unit_joules = energy_unit, "RAPL energy unit");

        let multiplier = model.aperf_mperf_multiplier();
        info!(multiplier = multiplier, "APERF/MPERF multiplier");

        Ok(Self {
            model,
            base_freq_mhz,
            turbo_freq_mhz,
            tdp_watts,
            energy_unit,
            multiplier,
        })
    }

    async fn turbo_enabled(sysfs_root: &Path) -> bool {
        let path = sysfs_root.join("devices/system/cpu/intel_pstate/no_turbo");
        match sysfs::read_first_line(&path).await {
            Ok(value) => value == "0",
            Err(e) => {
                debug!(error = %e, "intel_pstate no_turbo unavailable");
                false
            }
        }
    }
}

/// Host telemetry state: topology, facts and the most recent snapshot
pub struct HostInfo {
    topology: HostTopology,
    facts: HostFacts,
    regs: Arc<dyn RegisterAccess>,
    status: Option<HostStatusSnapshot>,
    /// Whether `status` carries rates derived from a predecessor
    rates_ready: bool,
}

impl HostInfo {
    pub fn new(topology: HostTopology, facts: HostFacts, regs: Arc<dyn RegisterAccess>) -> Self {
        Self {
            topology,
            facts,
            regs,
            status: None,
            rates_ready: false,
        }
    }

    /// Probe the host facts and take the first baseline snapshot
    pub async fn init(
        topology: HostTopology,
        regs: Arc<dyn RegisterAccess>,
        sysfs_root: &Path,
    ) -> Result<Self> {
        let facts = HostFacts::probe(&topology, regs.as_ref(), sysfs_root).await?;
        let mut host = Self::new(topology, facts, regs);
        host.rebaseline()?;
        Ok(host)
    }

    /// Replace the retained snapshot with a fresh one without deriving rates
    ///
    /// A transient sample failure leaves no baseline; the next update then
    /// only records one.
    pub fn rebaseline(&mut self) -> Result<()> {
        self.status = None;
        self.rates_ready = false;
        match self.sample() {
            Ok(snapshot) => {
                self.status = Some(snapshot);
                Ok(())
            }
            Err(e) if e.class().is_recoverable() => {
                warn!(error = %e, "Baseline sample failed, deferring to next tick");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Sample the counters and derive rates against the retained snapshot
    ///
    /// Returns whether fresh rates are available. On error the previous
    /// snapshot is kept, so the next derivation spans a longer interval.
    pub fn update(&mut self) -> Result<bool> {
        let mut current = self.sample()?;
        let ready = match &self.status {
            Some(previous) => {
                current.derive_rates(
                    previous,
                    self.facts.base_freq_mhz,
                    self.facts.energy_unit,
                )?;
                true
            }
            None => false,
        };
        self.status = Some(current);
        self.rates_ready = ready;
        Ok(ready)
    }

    fn sample(&self) -> Result<HostStatusSnapshot> {
        HostStatusSnapshot::sample(&self.topology, self.regs.as_ref(), self.facts.multiplier)
    }

    /// Most recent snapshot, if it carries derived rates
    pub fn snapshot(&self) -> Option<&HostStatusSnapshot> {
        if self.rates_ready {
            self.status.as_ref()
        } else {
            None
        }
    }

    pub fn topology(&self) -> &HostTopology {
        &self.topology
    }

    pub fn facts(&self) -> &HostFacts {
        &self.facts
    }
}
