//! Core data models for the QoS agent

use serde::{Deserialize, Serialize};

/// Priority class of a VM, derived from its cgroup partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High = 0,
    Low = 1,
}

/// Partition names understood by the agent
pub mod partitions {
    pub const DEFAULT: &str = "machine";
    pub const HIGH: &str = "high_prio_machine";
    pub const LOW: &str = "low_prio_machine";
}

impl Priority {
    /// Map a partition name (without the leading slash) to a priority
    pub fn from_partition(partition: &str) -> Option<Self> {
        match partition {
            partitions::DEFAULT | partitions::HIGH => Some(Priority::High),
            partitions::LOW => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn is_low(&self) -> bool {
        *self == Priority::Low
    }
}

/// Identity of an active domain as reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainRef {
    pub id: u32,
    pub name: String,
}

impl DomainRef {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DomainRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// One entry of a per-core occupancy list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreOccupant {
    pub usage: f64,
    pub id: u32,
    pub name: String,
    pub priority: Priority,
}

/// Hypervisor event kinds the agent reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEventKind {
    Started,
    Stopped,
    /// Any other lifecycle transition (suspended, resumed, crashed...)
    Lifecycle(String),
    DeviceAdded { alias: String },
    DeviceRemoved { alias: String },
}

/// Domain lifecycle or device hotplug event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    pub domain: String,
    pub kind: DomainEventKind,
}

impl DomainEvent {
    fn is_vcpu(alias: &str) -> bool {
        alias.starts_with("vcpu")
    }

    /// Whether this event invalidates the collected telemetry
    pub fn requires_reset(&self) -> bool {
        match &self.kind {
            DomainEventKind::Started | DomainEventKind::Stopped => true,
            DomainEventKind::DeviceAdded { alias } | DomainEventKind::DeviceRemoved { alias } => {
                Self::is_vcpu(alias)
            }
            DomainEventKind::Lifecycle(_) => false,
        }
    }

    /// Whether the domain gained tasks that must join the low priority groups
    pub fn adds_tasks(&self) -> bool {
        match &self.kind {
            DomainEventKind::Started => true,
            DomainEventKind::DeviceAdded { alias } => Self::is_vcpu(alias),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_from_partition() {
        assert_eq!(Priority::from_partition("machine"), Some(Priority::High));
        assert_eq!(
            Priority::from_partition("high_prio_machine"),
            Some(Priority::High)
        );
        assert_eq!(
            Priority::from_partition("low_prio_machine"),
            Some(Priority::Low)
        );
        assert_eq!(Priority::from_partition("batch"), None);
        assert!(Priority::Low > Priority::High);
    }

    #[test]
    fn test_event_classification() {
        let started = DomainEvent {
            domain: "vm1".into(),
            kind: DomainEventKind::Started,
        };
        assert!(started.requires_reset());
        assert!(started.adds_tasks());

        let stopped = DomainEvent {
            domain: "vm1".into(),
            kind: DomainEventKind::Stopped,
        };
        assert!(stopped.requires_reset());
        assert!(!stopped.adds_tasks());

        let vcpu_added = DomainEvent {
            domain: "vm1".into(),
            kind: DomainEventKind::DeviceAdded {
                alias: "vcpu3".into(),
            },
        };
        assert!(vcpu_added.requires_reset());
        assert!(vcpu_added.adds_tasks());

        let disk_added = DomainEvent {
            domain: "vm1".into(),
            kind: DomainEventKind::DeviceAdded {
                alias: "virtio-disk1".into(),
            },
        };
        assert!(!disk_added.requires_reset());

        let vcpu_removed = DomainEvent {
            domain: "vm1".into(),
            kind: DomainEventKind::DeviceRemoved {
                alias: "vcpu3".into(),
            },
        };
        assert!(vcpu_removed.requires_reset());
        assert!(!vcpu_removed.adds_tasks());

        let suspended = DomainEvent {
            domain: "vm1".into(),
            kind: DomainEventKind::Lifecycle("Suspended".into()),
        };
        assert!(!suspended.requires_reset());
    }
}
