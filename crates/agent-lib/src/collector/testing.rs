//! Fake register and hypervisor backends for unit tests

use super::hypervisor::Hypervisor;
use super::msr::RegisterAccess;
use crate::error::{HypervisorError, RegisterError};
use crate::models::{DomainEvent, DomainRef};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// In-memory register file with settable counters
pub struct FakeRegisters {
    msrs: Mutex<HashMap<(usize, u64), u64>>,
    perf: Mutex<Vec<(u64, u64)>>,
    jitter: Mutex<HashSet<usize>>,
    pub signature: u32,
    pub intel: bool,
    pub aperf: bool,
}

impl FakeRegisters {
    pub fn new(cores: usize) -> Self {
        Self {
            msrs: Mutex::new(HashMap::new()),
            perf: Mutex::new(vec![(0, 0); cores]),
            jitter: Mutex::new(HashSet::new()),
            // Skylake-X
            signature: 0x0005_0654,
            intel: true,
            aperf: true,
        }
    }

    pub fn set_msr(&self, cpu: usize, offset: u64, value: u64) {
        self.msrs.lock().unwrap().insert((cpu, offset), value);
    }

    pub fn set_perf(&self, cpu: usize, aperf: u64, mperf: u64) {
        self.perf.lock().unwrap()[cpu] = (aperf, mperf);
    }

    /// Advance the counters of every core by the same amounts
    pub fn advance_perf(&self, aperf: u64, mperf: u64) {
        for counters in self.perf.lock().unwrap().iter_mut() {
            counters.0 += aperf;
            counters.1 += mperf;
        }
    }

    pub fn set_jitter(&self, cpu: usize, jitter: bool) {
        let mut set = self.jitter.lock().unwrap();
        if jitter {
            set.insert(cpu);
        } else {
            set.remove(&cpu);
        }
    }
}

impl RegisterAccess for FakeRegisters {
    fn read_msr(&self, cpu: usize, offset: u64) -> Result<u64, RegisterError> {
        if cpu >= self.perf.lock().unwrap().len() {
            return Err(RegisterError::Read {
                cpu,
                offset,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(self
            .msrs
            .lock()
            .unwrap()
            .get(&(cpu, offset))
            .copied()
            .unwrap_or(0))
    }

    fn read_perf_counters(&self, cpu: usize) -> Result<(u64, u64), RegisterError> {
        if self.jitter.lock().unwrap().contains(&cpu) {
            return Err(RegisterError::Jitter { cpu });
        }
        self.perf
            .lock()
            .unwrap()
            .get(cpu)
            .copied()
            .ok_or(RegisterError::Read {
                cpu,
                offset: 0,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }

    fn cpu_signature(&self) -> u32 {
        self.signature
    }

    fn is_genuine_intel(&self) -> bool {
        self.intel
    }

    fn has_aperf(&self) -> bool {
        self.aperf
    }
}

/// Scripted hypervisor
pub struct FakeHypervisor {
    domains: Mutex<Vec<DomainRef>>,
    xml: Mutex<HashMap<u32, String>>,
    cpu_time: Mutex<HashMap<u32, Vec<u64>>>,
    /// Domains whose attribute queries report that they stopped
    gone: Mutex<HashSet<u32>>,
    broken: Mutex<bool>,
    events_tx: mpsc::Sender<DomainEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DomainEvent>>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(16);
        Self {
            domains: Mutex::new(Vec::new()),
            xml: Mutex::new(HashMap::new()),
            cpu_time: Mutex::new(HashMap::new()),
            gone: Mutex::new(HashSet::new()),
            broken: Mutex::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Register a running domain with the given partition and optional quota
    pub fn add_domain(&self, id: u32, partition: &str, quota: Option<i64>, cpu_time: Vec<u64>) {
        let quota = quota
            .map(|q| format!("<global_quota>{}</global_quota>", q))
            .unwrap_or_default();
        let xml = format!(
            "<domain type='kvm' id='{id}'><name>vm{id}</name>\
             <cputune>{quota}</cputune>\
             <resource><partition>/{partition}</partition></resource></domain>"
        );
        self.domains
            .lock()
            .unwrap()
            .push(DomainRef::new(id, format!("vm{}", id)));
        self.xml.lock().unwrap().insert(id, xml);
        self.cpu_time.lock().unwrap().insert(id, cpu_time);
    }

    pub fn remove_domain(&self, id: u32) {
        self.domains.lock().unwrap().retain(|d| d.id != id);
    }

    pub fn set_cpu_time(&self, id: u32, cpu_time: Vec<u64>) {
        self.cpu_time.lock().unwrap().insert(id, cpu_time);
    }

    /// Still listed, but stopped before any attribute query
    pub fn stop_after_listing(&self, id: u32) {
        self.gone.lock().unwrap().insert(id);
    }

    /// Make every query fail with an unexpected error
    pub fn break_connection(&self) {
        *self.broken.lock().unwrap() = true;
    }

    pub fn event_sender(&self) -> mpsc::Sender<DomainEvent> {
        self.events_tx.clone()
    }

    fn check(&self, domain: &DomainRef) -> crate::error::Result<()> {
        if *self.broken.lock().unwrap() {
            return Err(HypervisorError::Other("connection reset".to_string()).into());
        }
        if self.gone.lock().unwrap().contains(&domain.id) {
            return Err(HypervisorError::DomainGone {
                domain: domain.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn list_active_domains(&self) -> crate::error::Result<Vec<DomainRef>> {
        if *self.broken.lock().unwrap() {
            return Err(HypervisorError::Other("connection reset".to_string()).into());
        }
        Ok(self.domains.lock().unwrap().clone())
    }

    async fn descriptor_xml(&self, domain: &DomainRef) -> crate::error::Result<String> {
        self.check(domain)?;
        Ok(self
            .xml
            .lock()
            .unwrap()
            .get(&domain.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn cpu_time_per_core(&self, domain: &DomainRef) -> crate::error::Result<Vec<u64>> {
        self.check(domain)?;
        Ok(self
            .cpu_time
            .lock()
            .unwrap()
            .get(&domain.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe_events(&self) -> crate::error::Result<mpsc::Receiver<DomainEvent>> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| HypervisorError::Other("already subscribed".to_string()).into())
    }
}
