//! Host and guest telemetry collection
//!
//! This module discovers the CPU topology, reads hardware counters through
//! the [`RegisterAccess`] capability and tracks per-VM CPU usage through the
//! [`Hypervisor`] connection. Concrete backends are [`DevMsr`] for the msr
//! character devices and [`VirshConnection`] for libvirt.

mod cpu_model;
mod guest;
mod host;
mod hypervisor;
mod msr;
mod topology;
mod virsh;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;

pub use cpu_model::{intel, CpuModel};
pub use guest::{DomainRecord, GuestRegistry, QUOTA_UNSET};
pub use host::{
    monotonic_ns, CpuSample, HostFacts, HostInfo, HostStatusSnapshot, PackageSample,
};
pub use hypervisor::Hypervisor;
pub use msr::{regs, DevMsr, RegisterAccess};
pub use topology::HostTopology;
pub use virsh::VirshConnection;
