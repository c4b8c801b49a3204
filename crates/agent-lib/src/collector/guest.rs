//! Guest telemetry: per-domain CPU usage, priority and cgroup identity
//!
//! The registry is refreshed once per tick. Records are created on the first
//! observation of a domain, updated while it runs and dropped as soon as it
//! is no longer listed or fails attribution. The low-priority subset and the
//! per-core occupancy lists are recomputed from scratch after every refresh.

use super::hypervisor::Hypervisor;
use super::topology::HostTopology;
use crate::error::{ErrorClass, QosError, Result};
use crate::models::{CoreOccupant, DomainRef, Priority};
use crate::sysfs;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Quota value meaning "no limit configured"
pub const QUOTA_UNSET: i64 = -1;

/// Extract the text between `<tag>` and `</tag>`
fn xml_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}

/// One active VM
#[derive(Debug, Clone, Serialize)]
pub struct DomainRecord {
    pub id: u32,
    pub name: String,
    pub priority: Priority,
    /// Partition name without the leading slash
    pub partition: String,
    /// Usage fraction per host core since the previous observation
    pub cpu_usage: Vec<f64>,
    /// Sum of `cpu_usage`
    pub usage: f64,
    /// Sum of `cpu_usage` over the cores of each package
    pub package_usage: BTreeMap<u32, f64>,
    /// Configured CFS quota, [`QUOTA_UNSET`] if absent
    pub quota_config: i64,
    /// Directory name of the VM below its partition slice
    pub cgroup_name: String,
    #[serde(skip)]
    cpu_time: Vec<u64>,
    #[serde(skip)]
    last_update_ns: u64,
}

impl DomainRecord {
    pub fn new(
        domain: &DomainRef,
        priority: Priority,
        partition: impl Into<String>,
        quota_config: i64,
        cgroup_name: impl Into<String>,
        topology: &HostTopology,
    ) -> Self {
        Self {
            id: domain.id,
            name: domain.name.clone(),
            priority,
            partition: partition.into(),
            cpu_usage: vec![0.0; topology.core_count()],
            usage: 0.0,
            package_usage: topology.packages().map(|p| (p, 0.0)).collect(),
            quota_config,
            cgroup_name: cgroup_name.into(),
            cpu_time: Vec::new(),
            last_update_ns: 0,
        }
    }

    /// Probe a newly seen domain: quota, partition, priority and cgroup
    async fn attribute(
        hypervisor: &dyn Hypervisor,
        domain: &DomainRef,
        topology: &HostTopology,
        cgroup_root: &Path,
        now_ns: u64,
    ) -> Result<Self> {
        let attribute_error = |reason: String| QosError::DomainAttribute {
            id: domain.id,
            name: domain.name.clone(),
            reason,
        };

        let xml = hypervisor.descriptor_xml(domain).await?;

        let quota_config = match xml_tag(&xml, "global_quota") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| attribute_error(format!("invalid global_quota {:?}", value)))?,
            None => QUOTA_UNSET,
        };

        let partition = xml_tag(&xml, "partition")
            .map(|p| p.trim().trim_start_matches('/'))
            .ok_or_else(|| attribute_error("descriptor has no partition".to_string()))?;
        let priority = Priority::from_partition(partition)
            .ok_or_else(|| attribute_error(format!("unrecognized partition {:?}", partition)))?;

        let cpu_time = hypervisor.cpu_time_per_core(domain).await?;
        let cgroup_name = find_cgroup(cgroup_root, partition, domain.id)
            .await
            .map_err(attribute_error)?;

        debug!(
            domain = %domain,
            priority = ?priority,
            quota = quota_config,
            cgroup = %cgroup_name,
            "Attributed new domain"
        );

        let mut record = Self::new(
            domain,
            priority,
            partition,
            quota_config,
            cgroup_name,
            topology,
        );
        record.cpu_time = cpu_time;
        record.last_update_ns = now_ns;
        Ok(record)
    }

    /// Fold a new cumulative CPU time observation into the usage figures
    fn observe(&mut self, cpu_time: Vec<u64>, now_ns: u64, topology: &HostTopology) {
        let wall = now_ns.saturating_sub(self.last_update_ns);
        let usage = cpu_time
            .iter()
            .enumerate()
            .map(|(cpu, time)| {
                let previous = self.cpu_time.get(cpu).copied().unwrap_or(*time);
                if wall == 0 {
                    0.0
                } else {
                    time.saturating_sub(previous) as f64 / wall as f64
                }
            })
            .collect();

        self.set_usage(usage, topology);
        self.cpu_time = cpu_time;
        self.last_update_ns = now_ns;
    }

    /// Replace the per-core usage and recompute the aggregates
    pub fn set_usage(&mut self, cpu_usage: Vec<f64>, topology: &HostTopology) {
        for usage in self.package_usage.values_mut() {
            *usage = 0.0;
        }
        for (cpu, usage) in cpu_usage.iter().enumerate() {
            if let Some(package) = topology.package_of(cpu) {
                *self.package_usage.entry(package).or_insert(0.0) += usage;
            }
        }
        self.usage = cpu_usage.iter().sum();
        self.cpu_usage = cpu_usage;
    }

    pub fn usage_on(&self, cpu: usize) -> f64 {
        self.cpu_usage.get(cpu).copied().unwrap_or(0.0)
    }

    pub fn usage_in(&self, package: u32) -> f64 {
        self.package_usage.get(&package).copied().unwrap_or(0.0)
    }

    pub fn domain_ref(&self) -> DomainRef {
        DomainRef::new(self.id, self.name.clone())
    }
}

/// Find the VM's cgroup directory below `<cgroup_root>/pids/<partition>.slice`
async fn find_cgroup(
    cgroup_root: &Path,
    partition: &str,
    id: u32,
) -> std::result::Result<String, String> {
    let slice = cgroup_root.join(format!("pids/{}.slice", partition));
    let pattern = format!("machine-qemu\\x2d{}\\x2d", id);

    let entries = sysfs::list_entries(&slice)
        .await
        .map_err(|e| format!("partition cgroup unreadable: {}", e))?;
    entries
        .into_iter()
        .find(|entry| entry.contains(&pattern))
        .ok_or_else(|| format!("no cgroup matching {} in {}", pattern, slice.display()))
}

/// All active domains and the views derived from them
pub struct GuestRegistry {
    cgroup_root: PathBuf,
    domains: BTreeMap<u32, DomainRecord>,
    low_priority: BTreeSet<u32>,
    /// Per core, occupants ranked by usage then id, both descending
    core_occupants: Vec<Vec<CoreOccupant>>,
}

impl GuestRegistry {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            domains: BTreeMap::new(),
            low_priority: BTreeSet::new(),
            core_occupants: Vec::new(),
        }
    }

    /// Refresh every domain against the hypervisor
    pub async fn refresh(
        &mut self,
        hypervisor: &dyn Hypervisor,
        topology: &HostTopology,
    ) -> Result<()> {
        self.refresh_at(hypervisor, topology, super::host::monotonic_ns())
            .await
    }

    /// Refresh with an explicit observation time
    pub async fn refresh_at(
        &mut self,
        hypervisor: &dyn Hypervisor,
        topology: &HostTopology,
        now_ns: u64,
    ) -> Result<()> {
        let online = hypervisor.list_active_domains().await?;
        let online_ids: HashSet<u32> = online.iter().map(|d| d.id).collect();

        let before = self.domains.len();
        self.domains.retain(|id, _| online_ids.contains(id));
        if self.domains.len() != before {
            info!(
                removed = before - self.domains.len(),
                "Dropped domains that are no longer running"
            );
        }

        for domain in &online {
            let result = match self.domains.get_mut(&domain.id) {
                Some(record) => match hypervisor.cpu_time_per_core(domain).await {
                    Ok(cpu_time) => {
                        record.observe(cpu_time, now_ns, topology);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                None => DomainRecord::attribute(
                    hypervisor,
                    domain,
                    topology,
                    &self.cgroup_root,
                    now_ns,
                )
                .await
                .map(|record| {
                    self.domains.insert(domain.id, record);
                }),
            };

            if let Err(e) = result {
                if e.class() != ErrorClass::TransientVm {
                    return Err(e);
                }
                warn!(domain = %domain, error = %e, "Dropping domain");
                self.domains.remove(&domain.id);
            }
        }

        self.rebuild_views(topology);
        debug!(
            domains = self.domains.len(),
            low_priority = self.low_priority.len(),
            "Guest registry refreshed"
        );
        Ok(())
    }

    /// Recompute the low-priority subset and per-core occupancy lists
    pub fn rebuild_views(&mut self, topology: &HostTopology) {
        self.low_priority.clear();
        self.core_occupants.clear();
        self.core_occupants
            .resize_with(topology.core_count(), Vec::new);

        for record in self.domains.values() {
            if record.priority.is_low() {
                self.low_priority.insert(record.id);
            }
            for (cpu, occupants) in self.core_occupants.iter_mut().enumerate() {
                occupants.push(CoreOccupant {
                    usage: record.usage_on(cpu),
                    id: record.id,
                    name: record.name.clone(),
                    priority: record.priority,
                });
            }
        }

        for occupants in &mut self.core_occupants {
            occupants.sort_by(|a, b| {
                b.usage
                    .partial_cmp(&a.usage)
                    .unwrap_or(Ordering::Equal)
                    .then(b.id.cmp(&a.id))
            });
        }
    }

    /// Insert or replace a record; views are stale until [`Self::rebuild_views`]
    pub fn insert(&mut self, record: DomainRecord) {
        self.domains.insert(record.id, record);
    }

    /// Empty registry over the same cgroup tree
    pub fn fresh(&self) -> Self {
        Self::new(self.cgroup_root.clone())
    }

    pub fn get(&self, id: u32) -> Option<&DomainRecord> {
        self.domains.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.domains.contains_key(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&DomainRecord> {
        self.domains.values().find(|r| r.name == name)
    }

    pub fn domains(&self) -> impl Iterator<Item = &DomainRecord> {
        self.domains.values()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn is_low_priority(&self, id: u32) -> bool {
        self.low_priority.contains(&id)
    }

    pub fn low_priority_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.low_priority.iter().copied()
    }

    pub fn low_priority_domains(&self) -> impl Iterator<Item = &DomainRecord> {
        self.low_priority.iter().filter_map(|id| self.domains.get(id))
    }

    /// Ranked occupants of `cpu`, empty for an unknown core
    pub fn occupants(&self, cpu: usize) -> &[CoreOccupant] {
        self.core_occupants
            .get(cpu)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
