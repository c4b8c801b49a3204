//! CPU and package topology discovery
//!
//! Reads the present-CPU range and each core's physical package id from
//! sysfs. The topology is immutable once discovered.

use crate::error::{QosError, Result};
use crate::sysfs;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

/// Mapping of cores to packages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTopology {
    /// Package id of every core slot, indexed by core id; `None` for cores
    /// missing from a sparse present list
    core_package: Vec<Option<u32>>,
    packages: BTreeSet<u32>,
    /// Representative core of each package, used for package-scoped registers
    first_cores: BTreeMap<u32, usize>,
}

impl HostTopology {
    /// Build a topology from a core → package table, picking the lowest
    /// core of each package as its representative
    pub fn from_core_packages(core_package: Vec<u32>) -> Self {
        Self::from_slots(core_package.into_iter().map(Some).collect())
    }

    /// Like [`Self::from_core_packages`], with holes for absent cores
    pub fn from_slots(core_package: Vec<Option<u32>>) -> Self {
        let mut first_cores = BTreeMap::new();
        for (core, package) in core_package.iter().enumerate() {
            if let Some(package) = package {
                first_cores.entry(*package).or_insert(core);
            }
        }
        let packages = core_package.iter().flatten().copied().collect();
        Self {
            core_package,
            packages,
            first_cores,
        }
    }

    /// Discover the host topology below `sysfs_root` (normally `/sys`)
    pub async fn discover(sysfs_root: &Path) -> Result<Self> {
        let cpu_dir = sysfs_root.join("devices/system/cpu");

        let present = sysfs::read_first_line(&cpu_dir.join("present"))
            .await
            .map_err(|e| QosError::Unsupported(format!("cpu topology unreadable: {}", e)))?;
        let present_cores = sysfs::parse_cpu_list(&present)
            .filter(|cpus| !cpus.is_empty())
            .ok_or_else(|| QosError::Unsupported(format!("invalid present cpu list {:?}", present)))?;
        let slots = present_cores.iter().max().map_or(0, |max| max + 1);
        info!(cores = present_cores.len(), slots = slots, "Discovered present cpus");

        let mut core_package = vec![None; slots];
        let mut first_cores = BTreeMap::new();

        for core in present_cores {
            let topo_dir = cpu_dir.join(format!("cpu{}/topology", core));

            let package: u32 = sysfs::read_value(&topo_dir.join("physical_package_id"))
                .await
                .map_err(|e| QosError::Unsupported(format!("cpu topology unreadable: {}", e)))?;

            let siblings = sysfs::read_first_line(&topo_dir.join("core_siblings_list"))
                .await
                .map_err(|e| QosError::Unsupported(format!("cpu topology unreadable: {}", e)))?;
            let first_sibling = sysfs::parse_cpu_list(&siblings).and_then(|s| s.into_iter().min());

            if first_sibling == Some(core) {
                first_cores.entry(package).or_insert(core);
            }
            core_package[core] = Some(package);
        }

        let packages: BTreeSet<u32> = core_package.iter().flatten().copied().collect();
        for package in &packages {
            if !first_cores.contains_key(package) {
                let fallback = core_package
                    .iter()
                    .position(|p| *p == Some(*package))
                    .unwrap_or_default();
                warn!(
                    package = package,
                    core = fallback,
                    "No core matched its sibling list head, using lowest core"
                );
                first_cores.insert(*package, fallback);
            }
        }
        info!(packages = packages.len(), "Discovered cpu packages");

        Ok(Self {
            core_package,
            packages,
            first_cores,
        })
    }

    /// Number of core slots, one past the highest present core id
    pub fn core_count(&self) -> usize {
        self.core_package.len()
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn packages(&self) -> impl Iterator<Item = u32> + '_ {
        self.packages.iter().copied()
    }

    /// Every present core with its package, in core order
    pub fn cores(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.core_package
            .iter()
            .enumerate()
            .filter_map(|(core, package)| package.map(|p| (core, p)))
    }

    pub fn package_of(&self, core: usize) -> Option<u32> {
        self.core_package.get(core).copied().flatten()
    }

    /// Cores belonging to `package`, in ascending order
    pub fn cores_in(&self, package: u32) -> impl Iterator<Item = usize> + '_ {
        self.core_package
            .iter()
            .enumerate()
            .filter(move |(_, p)| **p == Some(package))
            .map(|(core, _)| core)
    }

    /// Whether `core` is the representative core of its package
    pub fn is_first_core(&self, core: usize) -> bool {
        self.package_of(core)
            .and_then(|package| self.first_cores.get(&package))
            .map(|first| *first == core)
            .unwrap_or(false)
    }

    /// Representative core of each package
    pub fn first_cores(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.first_cores.iter().map(|(p, c)| (*p, *c))
    }
}
