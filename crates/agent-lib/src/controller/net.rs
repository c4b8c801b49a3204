//! Network bandwidth reservation through an external bandwidth manager
//!
//! The manager (`bwmcli`) enforces a floor/ceiling for the low priority
//! net_cls cgroup and a water line that protects high priority traffic.

use crate::collector::DomainRecord;
use crate::config::QosConfig;
use crate::error::{QosError, Result};
use crate::models::partitions;
use crate::sysfs;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const BWM_TIMEOUT: Duration = Duration::from_secs(5);

/// Relative priority assigned to low priority cgroups
const LOWEST_NET_PRIORITY: &str = "-1";

/// Command surface of the bandwidth manager
#[async_trait]
pub trait BandwidthManager: Send + Sync {
    /// Run the manager with `args`, failing on a nonzero exit
    async fn run(&self, args: &[&str]) -> Result<()>;
}

/// [`BandwidthManager`] backed by the `bwmcli` executable
#[derive(Debug, Clone)]
pub struct BwmCli {
    path: PathBuf,
}

impl BwmCli {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn failure(&self, args: &[&str], reason: impl Into<String>) -> QosError {
        QosError::ExternalTool {
            tool: self.path.display().to_string(),
            args: args.join(" "),
            reason: reason.into(),
        }
    }

    async fn check_executable(&self, args: &[&str]) -> Result<()> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o111 != 0 => Ok(()),
            Ok(_) => Err(self.failure(args, "not executable")),
            Err(e) => Err(self.failure(args, format!("not found: {}", e))),
        }
    }
}

#[async_trait]
impl BandwidthManager for BwmCli {
    async fn run(&self, args: &[&str]) -> Result<()> {
        self.check_executable(args).await?;

        let output = tokio::time::timeout(
            BWM_TIMEOUT,
            Command::new(&self.path)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| QosError::Timeout {
            what: format!("bwmcli {}", args.join(" ")),
            timeout: BWM_TIMEOUT,
        })?
        .map_err(|e| self.failure(args, format!("failed to start: {}", e)))?;

        if !output.status.success() {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            error!(
                args = %args.join(" "),
                status = %output.status,
                output = %combined.trim(),
                "Bandwidth manager failed"
            );
            return Err(self.failure(args, format!("exited with {}", output.status)));
        }
        debug!(args = %args.join(" "), "Bandwidth manager command succeeded");
        Ok(())
    }
}

/// Physical network interfaces: everything in `class/net` that is not virtual
pub async fn physical_interfaces(sysfs_root: &Path) -> Result<Vec<String>> {
    let all = sysfs::list_entries(&sysfs_root.join("class/net")).await?;
    let virtual_ifaces: BTreeSet<String> =
        match sysfs::list_entries(&sysfs_root.join("devices/virtual/net")).await {
            Ok(names) => names.into_iter().collect(),
            Err(e) if e.is_not_found() => BTreeSet::new(),
            Err(e) => return Err(e),
        };
    Ok(all
        .into_iter()
        .filter(|name| !virtual_ifaces.contains(name))
        .collect())
}

/// Configures the bandwidth manager for the low priority class
pub struct NetController {
    enabled: bool,
    manager: Arc<dyn BandwidthManager>,
    sysfs_root: PathBuf,
    /// `<cgroup>/net_cls/low_prio_machine.slice`
    slice: PathBuf,
    bandwidth: String,
    water_line: String,
    initialized: bool,
}

impl NetController {
    pub fn new(config: &QosConfig, manager: Arc<dyn BandwidthManager>) -> Self {
        Self {
            enabled: config.net_qos_management,
            manager,
            sysfs_root: config.sysfs_root.clone(),
            slice: config
                .cgroup_root
                .join(format!("net_cls/{}.slice", partitions::LOW)),
            bandwidth: format!(
                "{},{}",
                config.net_qos_bandwidth_low, config.net_qos_bandwidth_high
            ),
            water_line: config.net_qos_water_line.clone(),
            initialized: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable management on every NIC and configure the low priority class
    pub async fn init(&mut self) -> Result<()> {
        if !self.enabled {
            info!("Network QoS management disabled");
            return Ok(());
        }

        let interfaces = physical_interfaces(&self.sysfs_root)
            .await
            .map_err(|e| QosError::Unsupported(format!("cannot list interfaces: {}", e)))?;
        if interfaces.is_empty() {
            return Err(QosError::Unsupported(
                "no physical network interface found".to_string(),
            ));
        }
        // From here on the manager may hold partial configuration
        self.initialized = true;
        for iface in &interfaces {
            self.manager.run(&["-e", iface]).await?;
        }
        info!(interfaces = ?interfaces, "Bandwidth management enabled");

        tokio::fs::create_dir_all(&self.slice)
            .await
            .map_err(|e| QosError::io(&self.slice, e))?;
        let cgroups = self.walk_slice().await?;
        for dir in &cgroups {
            self.set_lowest_priority(dir).await?;
        }

        self.manager
            .run(&["-s", "bandwidth", &self.bandwidth])
            .await?;
        self.manager
            .run(&["-s", "waterline", &self.water_line])
            .await?;

        info!(
            cgroups = cgroups.len(),
            bandwidth = %self.bandwidth,
            water_line = %self.water_line,
            "Low priority network bandwidth reserved"
        );
        Ok(())
    }

    /// Every directory of the low priority net_cls tree, the slice included
    async fn walk_slice(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut pending = vec![self.slice.clone()];
        while let Some(dir) = pending.pop() {
            for name in sysfs::list_subdirs(&dir).await? {
                pending.push(dir.join(name));
            }
            found.push(dir);
        }
        Ok(found)
    }

    async fn set_lowest_priority(&self, dir: &Path) -> Result<()> {
        let dir = dir.to_string_lossy();
        self.manager.run(&["-s", &dir, LOWEST_NET_PRIORITY]).await
    }

    /// Put a newly started or resized low priority domain at the lowest priority
    pub async fn domain_updated(&self, record: &DomainRecord) -> Result<bool> {
        if !self.enabled || !record.priority.is_low() {
            return Ok(false);
        }
        let dir = self.slice.join(&record.cgroup_name);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            warn!(
                domain = %record.domain_ref(),
                path = %dir.display(),
                "Domain has no net_cls cgroup"
            );
            return Ok(false);
        }
        self.set_lowest_priority(&dir).await?;
        debug!(domain = %record.domain_ref(), "Domain network priority lowered");
        Ok(true)
    }

    /// Remove the bandwidth manager configuration
    pub async fn teardown(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;
        self.manager.run(&["-d"]).await?;
        info!("Bandwidth management disabled");
        Ok(())
    }
}
