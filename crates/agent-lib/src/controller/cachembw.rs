//! Cache way and memory bandwidth reservation through resctrl
//!
//! Low priority domains share one resctrl group whose schemata caps them at
//! a minimum number of LLC ways and a minimum memory bandwidth percentage.
//! The controller only keeps the group's task membership current.

use crate::collector::DomainRecord;
use crate::config::QosConfig;
use crate::error::{QosError, Result};
use crate::models::partitions;
use crate::sysfs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const MOUNT_TIMEOUT: Duration = Duration::from_secs(5);

/// No such process
const ESRCH: i32 = 3;
/// No space left on device, resctrl is out of CLOSIDs or RMIDs
const ENOSPC: i32 = 28;

/// Hardware allocation limits read from `<resctrl>/info`
#[derive(Debug, Clone, PartialEq)]
pub struct ResctrlInfo {
    pub max_cache_ways: u32,
    pub min_cbm_bits: u32,
    pub min_bandwidth: u32,
    pub bandwidth_gran: u32,
    /// Number of cache/memory domains listed by the root schemata
    pub domain_count: usize,
}

impl ResctrlInfo {
    /// Mount resctrl at `root` unless it is already mounted
    pub async fn ensure_mounted(root: &Path) -> Result<()> {
        if tokio::fs::try_exists(root.join("tasks")).await.unwrap_or(false) {
            return Ok(());
        }

        info!(path = %root.display(), "Mounting resctrl");
        let status = tokio::time::timeout(
            MOUNT_TIMEOUT,
            Command::new("mount")
                .args(["-t", "resctrl", "resctrl"])
                .arg(root)
                .kill_on_drop(true)
                .status(),
        )
        .await
        .map_err(|_| QosError::Timeout {
            what: "mount resctrl".to_string(),
            timeout: MOUNT_TIMEOUT,
        })?
        .map_err(|e| QosError::Resctrl(format!("failed to run mount: {}", e)))?;

        if !status.success() || !tokio::fs::try_exists(root.join("tasks")).await.unwrap_or(false)
        {
            return Err(QosError::Resctrl(format!(
                "resctrl could not be mounted at {} ({})",
                root.display(),
                status
            )));
        }
        Ok(())
    }

    /// Read the cache and bandwidth allocation limits
    pub async fn probe(root: &Path) -> Result<Self> {
        let info = root.join("info");
        for resource in ["L3", "MB"] {
            if !tokio::fs::try_exists(info.join(resource)).await.unwrap_or(false) {
                return Err(QosError::Resctrl(format!(
                    "{} allocation is not enabled",
                    resource
                )));
            }
        }

        let cbm_mask = read_info(&info.join("L3/cbm_mask")).await?;
        let mask = u64::from_str_radix(&cbm_mask, 16)
            .map_err(|e| QosError::Resctrl(format!("bad cbm_mask {:?}: {}", cbm_mask, e)))?;

        let schemata = read_info(&root.join("schemata")).await?;
        let domain_count = schemata.split(';').filter(|d| !d.trim().is_empty()).count();

        let info = Self {
            max_cache_ways: mask.count_ones(),
            min_cbm_bits: parse_info(&info.join("L3/min_cbm_bits")).await?,
            min_bandwidth: parse_info(&info.join("MB/min_bandwidth")).await?,
            bandwidth_gran: parse_info(&info.join("MB/bandwidth_gran")).await?,
            domain_count,
        };
        debug!(info = ?info, "Probed resctrl limits");
        Ok(info)
    }
}

async fn read_info(path: &Path) -> Result<String> {
    sysfs::read_first_line(path)
        .await
        .map_err(|e| QosError::Resctrl(e.to_string()))
}

async fn parse_info(path: &Path) -> Result<u32> {
    let value = read_info(path).await?;
    value
        .parse()
        .map_err(|e| QosError::Resctrl(format!("bad value {:?} in {}: {}", value, path.display(), e)))
}

/// Hex bitmask with the `ways` lowest bits set
pub fn cache_way_mask(ways: u32, max_ways: u32, min_cbm_bits: u32) -> Result<String> {
    if ways >= max_ways {
        return Err(QosError::Resctrl(format!(
            "min_llc_ways_low_vms {} must be less than the {} available ways",
            ways, max_ways
        )));
    }
    if ways < min_cbm_bits {
        return Err(QosError::Resctrl(format!(
            "min_llc_ways_low_vms {} is below min_cbm_bits {}",
            ways, min_cbm_bits
        )));
    }
    Ok(format!("{:x}", (1u64 << ways) - 1))
}

/// Bandwidth percentage rounded down to `gran`, never below `min_bandwidth`
pub fn min_bandwidth_percent(fraction: f64, gran: u32, min_bandwidth: u32) -> Result<u32> {
    if gran == 0 {
        return Err(QosError::Resctrl("bandwidth_gran is zero".to_string()));
    }
    // Nudge so that e.g. 0.29 * 100 does not land just below 29
    let steps = ((fraction * 100.0 + 1e-9) / gran as f64).floor() as u32;
    Ok((steps * gran).max(min_bandwidth))
}

fn schema_line(resource: &str, value: &str, domains: usize) -> String {
    let entries: Vec<String> = (0..domains).map(|d| format!("{}={}", d, value)).collect();
    format!("{}:{}\n", resource, entries.join(";"))
}

/// Keeps low priority domain tasks inside the reserved resctrl group
pub struct CacheMbwController {
    /// `<resctrl>/low_prio_machine`
    group: PathBuf,
    /// `<cgroup>/pids/low_prio_machine.slice`
    pids_slice: PathBuf,
    cache_mask: String,
    mbw_percent: u32,
    domain_count: usize,
}

impl CacheMbwController {
    pub fn new(config: &QosConfig, info: &ResctrlInfo) -> Result<Self> {
        let cache_mask = cache_way_mask(
            config.min_llc_ways_low_vms,
            info.max_cache_ways,
            info.min_cbm_bits,
        )?;
        let mbw_percent = min_bandwidth_percent(
            config.min_mbw_low_vms,
            info.bandwidth_gran,
            info.min_bandwidth,
        )?;

        Ok(Self {
            group: config.resctrl_root.join(partitions::LOW),
            pids_slice: config
                .cgroup_root
                .join(format!("pids/{}.slice", partitions::LOW)),
            cache_mask,
            mbw_percent,
            domain_count: info.domain_count,
        })
    }

    pub fn cache_mask(&self) -> &str {
        &self.cache_mask
    }

    pub fn mbw_percent(&self) -> u32 {
        self.mbw_percent
    }

    /// Create the group, write its schemata and adopt running low priority domains
    pub async fn init(&self) -> Result<()> {
        match tokio::fs::create_dir_all(&self.group).await {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(ENOSPC) => {
                return Err(QosError::Resctrl(format!(
                    "cannot create {}: out of CLOSIDs/RMIDs",
                    self.group.display()
                )));
            }
            Err(e) => {
                return Err(QosError::Resctrl(format!(
                    "cannot create {}: {}",
                    self.group.display(),
                    e
                )))
            }
        }

        let schemata = self.group.join("schemata");
        for line in [
            schema_line("L3", &self.cache_mask, self.domain_count),
            schema_line("MB", &self.mbw_percent.to_string(), self.domain_count),
        ] {
            sysfs::append_value(&schemata, &line)
                .await
                .map_err(|e| QosError::Resctrl(e.to_string()))?;
        }
        info!(
            group = %self.group.display(),
            cache_mask = %self.cache_mask,
            mbw_percent = self.mbw_percent,
            "Low priority cache and memory bandwidth reserved"
        );

        let moved = self.resync().await?;
        info!(tasks = moved, "Adopted tasks of running low priority domains");
        Ok(())
    }

    /// Move a domain's tasks into the group if it is low priority
    pub async fn domain_updated(&self, record: &DomainRecord) -> Result<usize> {
        if !record.priority.is_low() {
            return Ok(0);
        }
        self.add_vm_tasks(&record.cgroup_name).await
    }

    /// Re-scan the low priority pids tree and re-apply task membership
    pub async fn resync(&self) -> Result<usize> {
        let cgroups = match sysfs::list_subdirs(&self.pids_slice).await {
            Ok(cgroups) => cgroups,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut moved = 0;
        for cgroup in cgroups {
            moved += self.add_vm_tasks(&cgroup).await?;
        }
        Ok(moved)
    }

    async fn add_vm_tasks(&self, cgroup_name: &str) -> Result<usize> {
        let vm_tasks = self.pids_slice.join(cgroup_name).join("tasks");
        let content = match sysfs::read_to_string(&vm_tasks).await {
            Ok(content) => content,
            Err(e) => {
                warn!(cgroup = cgroup_name, error = %e, "Unreadable task list, skipping");
                return Ok(0);
            }
        };

        let group_tasks = self.group.join("tasks");
        let mut moved = 0;
        for task in content.lines().map(str::trim).filter(|t| !t.is_empty()) {
            match sysfs::append_value(&group_tasks, task).await {
                Ok(()) => moved += 1,
                Err(QosError::Io { source, .. }) if source.raw_os_error() == Some(ESRCH) => {
                    debug!(task = task, "Task exited before it could be moved");
                }
                Err(e) => {
                    if tokio::fs::try_exists(&vm_tasks).await.unwrap_or(false) {
                        return Err(e);
                    }
                    warn!(cgroup = cgroup_name, "Domain stopped while its tasks were moved");
                    return Ok(moved);
                }
            }
        }
        debug!(cgroup = cgroup_name, tasks = moved, "Moved tasks into resctrl group");
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{HostTopology, QUOTA_UNSET};
    use crate::error::ErrorClass;
    use crate::models::{DomainRef, Priority};
    use tempfile::TempDir;
    use tokio::fs;

    async fn mock_resctrl(temp_dir: &TempDir, with_mb: bool) -> PathBuf {
        let root = temp_dir.path().join("resctrl");
        fs::create_dir_all(root.join("info/L3")).await.unwrap();
        fs::write(root.join("tasks"), "").await.unwrap();
        fs::write(root.join("info/L3/cbm_mask"), "7ff\n").await.unwrap();
        fs::write(root.join("info/L3/min_cbm_bits"), "1\n").await.unwrap();
        fs::write(root.join("schemata"), "    L3:0=7ff;1=7ff\n    MB:0=100;1=100\n")
            .await
            .unwrap();
        if with_mb {
            fs::create_dir_all(root.join("info/MB")).await.unwrap();
            fs::write(root.join("info/MB/min_bandwidth"), "10\n").await.unwrap();
            fs::write(root.join("info/MB/bandwidth_gran"), "10\n").await.unwrap();
        }
        root
    }

    async fn mock_low_vm(temp_dir: &TempDir, cgroup: &str, tasks: Option<&str>) {
        let dir = temp_dir
            .path()
            .join("cgroup/pids/low_prio_machine.slice")
            .join(cgroup);
        fs::create_dir_all(&dir).await.unwrap();
        if let Some(tasks) = tasks {
            fs::write(dir.join("tasks"), tasks).await.unwrap();
        }
    }

    fn config_for(temp_dir: &TempDir) -> QosConfig {
        QosConfig {
            resctrl_root: temp_dir.path().join("resctrl"),
            cgroup_root: temp_dir.path().join("cgroup"),
            ..QosConfig::default()
        }
    }

    fn record(id: u32, priority: Priority, cgroup: &str) -> DomainRecord {
        let partition = match priority {
            Priority::High => partitions::HIGH,
            Priority::Low => partitions::LOW,
        };
        DomainRecord::new(
            &DomainRef::new(id, format!("vm{}", id)),
            priority,
            partition,
            QUOTA_UNSET,
            cgroup.to_string(),
            &HostTopology::from_core_packages(vec![0]),
        )
    }

    #[test]
    fn test_cache_way_mask() {
        assert_eq!(cache_way_mask(2, 10, 1).unwrap(), "3");
        assert_eq!(cache_way_mask(3, 11, 1).unwrap(), "7");
        assert_eq!(cache_way_mask(1, 11, 1).unwrap(), "1");

        let err = cache_way_mask(10, 10, 1).unwrap_err();
        assert_eq!(err.class(), ErrorClass::FatalStartup);
        assert!(cache_way_mask(1, 11, 2).is_err());
    }

    #[test]
    fn test_min_bandwidth_percent() {
        assert_eq!(min_bandwidth_percent(0.1, 10, 10).unwrap(), 10);
        assert_eq!(min_bandwidth_percent(0.15, 10, 10).unwrap(), 10);
        assert_eq!(min_bandwidth_percent(0.2, 10, 10).unwrap(), 20);
        assert_eq!(min_bandwidth_percent(0.29, 1, 10).unwrap(), 29);
        // Floored at the hardware minimum
        assert_eq!(min_bandwidth_percent(0.1, 10, 20).unwrap(), 20);

        let err = min_bandwidth_percent(0.1, 0, 10).unwrap_err();
        assert_eq!(err.class(), ErrorClass::FatalStartup);
    }

    #[tokio::test]
    async fn test_probe_reads_limits() {
        let temp_dir = TempDir::new().unwrap();
        let root = mock_resctrl(&temp_dir, true).await;

        ResctrlInfo::ensure_mounted(&root).await.unwrap();
        let info = ResctrlInfo::probe(&root).await.unwrap();
        assert_eq!(
            info,
            ResctrlInfo {
                max_cache_ways: 11,
                min_cbm_bits: 1,
                min_bandwidth: 10,
                bandwidth_gran: 10,
                domain_count: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_probe_without_mba_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let root = mock_resctrl(&temp_dir, false).await;

        let err = ResctrlInfo::probe(&root).await.unwrap_err();
        assert!(matches!(err, QosError::Resctrl(_)));
        assert_eq!(err.class(), ErrorClass::FatalStartup);
    }

    #[tokio::test]
    async fn test_init_writes_schemata_and_adopts_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let root = mock_resctrl(&temp_dir, true).await;
        mock_low_vm(&temp_dir, "machine-qemu\\x2d1\\x2dvm1.scope", Some("101\n102\n")).await;
        mock_low_vm(&temp_dir, "machine-qemu\\x2d2\\x2dvm2.scope", None).await;

        let info = ResctrlInfo::probe(&root).await.unwrap();
        let controller = CacheMbwController::new(&config_for(&temp_dir), &info).unwrap();
        controller.init().await.unwrap();

        let group = root.join("low_prio_machine");
        assert_eq!(
            fs::read_to_string(group.join("schemata")).await.unwrap(),
            "L3:0=3;1=3\nMB:0=10;1=10\n"
        );
        // vm2 has no readable task list and is skipped
        assert_eq!(
            fs::read_to_string(group.join("tasks")).await.unwrap(),
            "101102"
        );
    }

    #[tokio::test]
    async fn test_init_without_pids_slice() {
        let temp_dir = TempDir::new().unwrap();
        let root = mock_resctrl(&temp_dir, true).await;

        let info = ResctrlInfo::probe(&root).await.unwrap();
        let controller = CacheMbwController::new(&config_for(&temp_dir), &info).unwrap();
        controller.init().await.unwrap();
        assert_eq!(controller.resync().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_domain_updated_moves_only_low_priority_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let root = mock_resctrl(&temp_dir, true).await;
        fs::create_dir_all(root.join("low_prio_machine")).await.unwrap();
        mock_low_vm(&temp_dir, "vm5.scope", Some("501\n")).await;

        let info = ResctrlInfo::probe(&root).await.unwrap();
        let controller = CacheMbwController::new(&config_for(&temp_dir), &info).unwrap();

        let high = record(4, Priority::High, "vm5.scope");
        assert_eq!(controller.domain_updated(&high).await.unwrap(), 0);

        let low = record(5, Priority::Low, "vm5.scope");
        assert_eq!(controller.domain_updated(&low).await.unwrap(), 1);
        assert_eq!(
            fs::read_to_string(root.join("low_prio_machine/tasks"))
                .await
                .unwrap(),
            "501"
        );

        // Already stopped, its task list is gone
        let gone = record(6, Priority::Low, "vm6.scope");
        assert_eq!(controller.domain_updated(&gone).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_controller_rejects_too_many_ways() {
        let info = ResctrlInfo {
            max_cache_ways: 2,
            min_cbm_bits: 1,
            min_bandwidth: 10,
            bandwidth_gran: 10,
            domain_count: 1,
        };
        let config = QosConfig::default();
        assert!(CacheMbwController::new(&config, &info).is_err());

        let info = ResctrlInfo {
            max_cache_ways: 11,
            ..info
        };
        let controller = CacheMbwController::new(&config, &info).unwrap();
        assert_eq!(controller.cache_mask(), "3");
        assert_eq!(controller.mbw_percent(), 10);
    }
}
