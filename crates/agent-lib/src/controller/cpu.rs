//! CPU bandwidth control with hysteresis
//!
//! A blamed domain is throttled through its CFS quota and stays in the
//! [`AdjustmentLedger`] for `abnormal_threshold` further ticks. Once its
//! count runs out it spends exactly one tick on the recovery list, during
//! which its configured quota is written back.

use crate::collector::GuestRegistry;
use crate::config::QosConfig;
use crate::error::Result;
use crate::models::partitions;
use crate::sysfs;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Value written to `cpu.qos_level` of the low priority slice
const LOW_PRIORITY_QOS_LEVEL: &str = "-1";

/// Fraction of the period above which throttling is skipped
const MAX_QUOTA_FRACTION: f64 = 0.9;

/// Smallest quota the kernel accepts, in microseconds
const MIN_CFS_QUOTA_US: i64 = 1000;

/// Blamed domain id → remaining hysteresis count
#[derive(Debug, Clone, Default)]
pub struct AdjustmentLedger {
    threshold: u32,
    counts: BTreeMap<u32, u32>,
    recovery: BTreeSet<u32>,
}

impl AdjustmentLedger {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            counts: BTreeMap::new(),
            recovery: BTreeSet::new(),
        }
    }

    /// Reset the domain's count to the full threshold
    pub fn blame(&mut self, id: u32) {
        self.counts.insert(id, self.threshold);
        self.recovery.remove(&id);
    }

    /// Drop entries whose domain is no longer known, returning their ids
    pub fn purge(&mut self, registry: &GuestRegistry) -> Vec<u32> {
        let stale: Vec<u32> = self
            .counts
            .keys()
            .chain(self.recovery.iter())
            .copied()
            .filter(|id| !registry.contains(*id))
            .collect();
        for id in &stale {
            self.counts.remove(id);
            self.recovery.remove(id);
        }
        if !stale.is_empty() {
            debug!(ids = ?stale, "Purged stale ledger entries");
        }
        stale
    }

    /// Move exhausted entries to the recovery list and count down the rest
    pub fn advance(&mut self) {
        let exhausted: Vec<u32> = self
            .counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in exhausted {
            self.counts.remove(&id);
            self.recovery.insert(id);
        }
        for count in self.counts.values_mut() {
            *count -= 1;
        }
        debug!(
            adjusting = ?self.counts,
            recovering = ?self.recovery,
            "Advanced adjustment ledger"
        );
    }

    /// Domains blamed during the current tick
    pub fn freshly_blamed(&self) -> impl Iterator<Item = u32> + '_ {
        let threshold = self.threshold;
        self.counts
            .iter()
            .filter(move |(_, count)| **count == threshold)
            .map(|(id, _)| *id)
    }

    /// Hand out the recovery list, leaving it empty
    pub fn take_recovery(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.recovery).into_iter().collect()
    }

    pub fn count(&self, id: u32) -> Option<u32> {
        self.counts.get(&id).copied()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.counts.contains_key(&id)
    }

    pub fn is_recovering(&self, id: u32) -> bool {
        self.recovery.contains(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.counts.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.recovery.clear();
    }
}

/// Applies and restores CFS quotas of low priority domains
pub struct CpuController {
    /// `<cgroup>/cpu/low_prio_machine.slice`
    slice: PathBuf,
    quota_threshold: f64,
    ledger: AdjustmentLedger,
}

impl CpuController {
    pub fn new(config: &QosConfig) -> Self {
        Self {
            slice: config
                .cgroup_root
                .join(format!("cpu/{}.slice", partitions::LOW)),
            quota_threshold: config.quota_threshold,
            ledger: AdjustmentLedger::new(config.abnormal_threshold),
        }
    }

    /// Mark the low priority slice as offline-class where the kernel supports it
    pub async fn init(&self) -> Result<()> {
        let qos_level = self.slice.join("cpu.qos_level");
        if !tokio::fs::try_exists(&qos_level).await.unwrap_or(false) {
            info!(
                path = %qos_level.display(),
                "Kernel has no cpu.qos_level, skipping low priority cpu class"
            );
            return Ok(());
        }
        sysfs::write_value(&qos_level, LOW_PRIORITY_QOS_LEVEL).await?;
        info!("Low priority cpu qos level set");
        Ok(())
    }

    pub fn ledger(&self) -> &AdjustmentLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut AdjustmentLedger {
        &mut self.ledger
    }

    fn quota_path(&self, cgroup_name: &str) -> PathBuf {
        self.slice.join(cgroup_name).join("cpu.cfs_quota_us")
    }

    /// Throttle every domain blamed this tick, returning the throttled ids
    pub async fn limit_bandwidth(&self, registry: &GuestRegistry) -> Result<Vec<u32>> {
        let blamed: Vec<u32> = self.ledger.freshly_blamed().collect();
        if blamed.is_empty() {
            return Ok(Vec::new());
        }

        let period: i64 = sysfs::read_value(&self.slice.join("cpu.cfs_period_us")).await?;
        let max_quota = MAX_QUOTA_FRACTION * period as f64;

        let mut throttled = Vec::new();
        for id in blamed {
            let Some(record) = registry.get(id).filter(|r| r.priority.is_low()) else {
                debug!(id = id, "Blamed domain is not a known low priority domain");
                continue;
            };

            let quota = (record.usage * period as f64 * self.quota_threshold) as i64;
            if quota as f64 >= max_quota {
                debug!(
                    domain = %record.domain_ref(),
                    quota = quota,
                    period = period,
                    "Domain already uses most of its share, not throttling"
                );
                continue;
            }
            let quota = quota.max(MIN_CFS_QUOTA_US);

            if write_quota(&self.quota_path(&record.cgroup_name), quota).await? {
                info!(
                    domain = %record.domain_ref(),
                    quota = quota,
                    usage = record.usage,
                    "Domain cpu bandwidth limited"
                );
                throttled.push(id);
            }
        }
        Ok(throttled)
    }

    /// Restore the configured quota of every domain on the recovery list
    pub async fn recover_bandwidth(&mut self, registry: &GuestRegistry) -> Result<Vec<u32>> {
        let mut recovered = Vec::new();
        for id in self.ledger.take_recovery() {
            let Some(record) = registry.get(id) else {
                debug!(id = id, "Recovering domain is gone");
                continue;
            };
            if write_quota(&self.quota_path(&record.cgroup_name), record.quota_config).await? {
                info!(
                    domain = %record.domain_ref(),
                    quota = record.quota_config,
                    "Domain cpu bandwidth recovered"
                );
                recovered.push(id);
            }
        }
        Ok(recovered)
    }

    /// Restore every low priority domain unconditionally, returning how many were written
    pub async fn reset_all(&mut self, registry: &GuestRegistry) -> usize {
        self.ledger.clear();
        let mut restored = 0;
        for record in registry.low_priority_domains() {
            match write_quota(&self.quota_path(&record.cgroup_name), record.quota_config).await {
                Ok(true) => {
                    restored += 1;
                    info!(
                        domain = %record.domain_ref(),
                        quota = record.quota_config,
                        "Domain cpu bandwidth reset"
                    );
                }
                Ok(false) => {}
                Err(e) => warn!(
                    domain = %record.domain_ref(),
                    error = %e,
                    "Failed to reset domain cpu bandwidth"
                ),
            }
        }
        restored
    }
}

/// Write a quota, returning false if the cgroup has already disappeared
async fn write_quota(path: &Path, quota: i64) -> Result<bool> {
    match sysfs::write_value(path, &quota.to_string()).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => {
            warn!(path = %path.display(), "Quota target vanished, domain stopped concurrently");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
