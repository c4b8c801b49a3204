//! Hypervisor management connection

use crate::error::Result;
use crate::models::{DomainEvent, DomainRef};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Domain enumeration, attribute queries and lifecycle events
///
/// Queries against a domain that stopped concurrently must fail with
/// [`crate::error::HypervisorError::DomainGone`] so callers can drop it
/// quietly.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Currently running domains
    async fn list_active_domains(&self) -> Result<Vec<DomainRef>>;

    /// Domain XML descriptor
    async fn descriptor_xml(&self, domain: &DomainRef) -> Result<String>;

    /// Cumulative CPU time in nanoseconds, indexed by host core
    async fn cpu_time_per_core(&self, domain: &DomainRef) -> Result<Vec<u64>>;

    /// Start delivering lifecycle and device hotplug events
    ///
    /// The channel closes when the connection is lost.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<DomainEvent>>;
}
