//! QoS configuration
//!
//! Resolved once at startup and passed by reference afterwards; nothing in
//! the control loop re-reads the environment.

use crate::error::{QosError, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const TDP_THRESHOLD_RANGE: (f64, f64) = (0.8, 1.0);
pub const FREQ_THRESHOLD_RANGE: (f64, f64) = (0.9, 1.0);
pub const QUOTA_THRESHOLD_RANGE: (f64, f64) = (0.8, 1.0);
pub const ABNORMAL_THRESHOLD_RANGE: (u32, u32) = (1, 5);
pub const MIN_LLC_WAYS_RANGE: (u32, u32) = (1, 3);
pub const MIN_MBW_RANGE: (f64, f64) = (0.1, 0.2);

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QosConfig {
    /// Package power above this fraction of TDP marks a hotspot
    #[serde(default = "default_tdp_threshold")]
    pub tdp_threshold: f64,

    /// Cores below this fraction of turbo frequency count as underclocked
    #[serde(default = "default_freq_threshold")]
    pub freq_threshold: f64,

    /// Fraction of observed usage granted as quota to a throttled VM
    #[serde(default = "default_quota_threshold")]
    pub quota_threshold: f64,

    /// Number of ticks a blamed VM stays throttled
    #[serde(default = "default_abnormal_threshold")]
    pub abnormal_threshold: u32,

    /// LLC ways reserved for low priority VMs
    #[serde(default = "default_min_llc_ways")]
    pub min_llc_ways_low_vms: u32,

    /// Memory bandwidth fraction reserved for low priority VMs
    #[serde(default = "default_min_mbw")]
    pub min_mbw_low_vms: f64,

    #[serde(default)]
    pub net_qos_management: bool,

    #[serde(default = "default_bandwidth_low")]
    pub net_qos_bandwidth_low: String,

    #[serde(default = "default_bandwidth_high")]
    pub net_qos_bandwidth_high: String,

    #[serde(default = "default_water_line")]
    pub net_qos_water_line: String,

    #[serde(default = "default_power_interval")]
    pub power_interval_ms: u64,

    #[serde(default = "default_resctrl_interval")]
    pub resctrl_interval_ms: u64,

    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    #[serde(default = "default_resctrl_root")]
    pub resctrl_root: PathBuf,

    #[serde(default = "default_msr_dev_root")]
    pub msr_dev_root: PathBuf,

    #[serde(default = "default_bwmcli_path")]
    pub bwmcli_path: PathBuf,

    #[serde(default = "default_virsh_path")]
    pub virsh_path: PathBuf,

    #[serde(default = "default_hypervisor_uri")]
    pub hypervisor_uri: String,

    /// Port for the health/metrics endpoint, 0 disables it
    #[serde(default)]
    pub api_port: u16,
}

fn default_tdp_threshold() -> f64 {
    0.98
}

fn default_freq_threshold() -> f64 {
    0.98
}

fn default_quota_threshold() -> f64 {
    0.9
}

fn default_abnormal_threshold() -> u32 {
    3
}

fn default_min_llc_ways() -> u32 {
    2
}

fn default_min_mbw() -> f64 {
    0.1
}

fn default_bandwidth_low() -> String {
    "20mb".to_string()
}

fn default_bandwidth_high() -> String {
    "1gb".to_string()
}

fn default_water_line() -> String {
    "20mb".to_string()
}

fn default_power_interval() -> u64 {
    1000
}

fn default_resctrl_interval() -> u64 {
    500
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_resctrl_root() -> PathBuf {
    PathBuf::from("/sys/fs/resctrl")
}

fn default_msr_dev_root() -> PathBuf {
    PathBuf::from("/dev/cpu")
}

fn default_bwmcli_path() -> PathBuf {
    PathBuf::from("/usr/bin/bwmcli")
}

fn default_virsh_path() -> PathBuf {
    PathBuf::from("/usr/bin/virsh")
}

fn default_hypervisor_uri() -> String {
    "qemu:///system".to_string()
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            tdp_threshold: default_tdp_threshold(),
            freq_threshold: default_freq_threshold(),
            quota_threshold: default_quota_threshold(),
            abnormal_threshold: default_abnormal_threshold(),
            min_llc_ways_low_vms: default_min_llc_ways(),
            min_mbw_low_vms: default_min_mbw(),
            net_qos_management: false,
            net_qos_bandwidth_low: default_bandwidth_low(),
            net_qos_bandwidth_high: default_bandwidth_high(),
            net_qos_water_line: default_water_line(),
            power_interval_ms: default_power_interval(),
            resctrl_interval_ms: default_resctrl_interval(),
            sysfs_root: default_sysfs_root(),
            cgroup_root: default_cgroup_root(),
            resctrl_root: default_resctrl_root(),
            msr_dev_root: default_msr_dev_root(),
            bwmcli_path: default_bwmcli_path(),
            virsh_path: default_virsh_path(),
            hypervisor_uri: default_hypervisor_uri(),
            api_port: 0,
        }
    }
}

fn check_range(name: &'static str, value: f64, (min, max): (f64, f64)) -> Result<()> {
    if value.is_nan() || value < min || value > max {
        return Err(QosError::InvalidThreshold {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl QosConfig {
    /// Validate every threshold against its closed range
    pub fn validate(&self) -> Result<()> {
        check_range("tdp_threshold", self.tdp_threshold, TDP_THRESHOLD_RANGE)?;
        check_range("freq_threshold", self.freq_threshold, FREQ_THRESHOLD_RANGE)?;
        check_range("quota_threshold", self.quota_threshold, QUOTA_THRESHOLD_RANGE)?;
        check_range(
            "abnormal_threshold",
            self.abnormal_threshold as f64,
            (
                ABNORMAL_THRESHOLD_RANGE.0 as f64,
                ABNORMAL_THRESHOLD_RANGE.1 as f64,
            ),
        )?;
        check_range(
            "min_llc_ways_low_vms",
            self.min_llc_ways_low_vms as f64,
            (MIN_LLC_WAYS_RANGE.0 as f64, MIN_LLC_WAYS_RANGE.1 as f64),
        )?;
        check_range("min_mbw_low_vms", self.min_mbw_low_vms, MIN_MBW_RANGE)?;

        if self.power_interval_ms == 0 || self.resctrl_interval_ms == 0 {
            return Err(QosError::Unsupported(
                "tick intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Lower-case the bandwidth strings the way the bandwidth manager expects
    pub fn normalized(mut self) -> Self {
        self.net_qos_bandwidth_low = self.net_qos_bandwidth_low.to_lowercase();
        self.net_qos_bandwidth_high = self.net_qos_bandwidth_high.to_lowercase();
        self.net_qos_water_line = self.net_qos_water_line.to_lowercase();
        self
    }

    pub fn power_interval(&self) -> Duration {
        Duration::from_millis(self.power_interval_ms)
    }

    pub fn resctrl_interval(&self) -> Duration {
        Duration::from_millis(self.resctrl_interval_ms)
    }
}
