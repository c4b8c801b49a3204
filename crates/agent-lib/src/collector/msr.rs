//! Model specific register access
//!
//! The control logic only sees the [`RegisterAccess`] trait; [`DevMsr`] is
//! the production backend reading `/dev/cpu/<n>/msr`.

use crate::error::{QosError, RegisterError, Result};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

/// Register offsets
pub mod regs {
    pub const IA32_MPERF: u64 = 0xE7;
    pub const IA32_APERF: u64 = 0xE8;
    pub const FSB_FREQ: u64 = 0xCD;
    pub const PLATFORM_INFO: u64 = 0xCE;
    pub const TURBO_RATIO_LIMIT: u64 = 0x1AD;
    pub const RAPL_POWER_UNIT: u64 = 0x606;
    pub const PKG_ENERGY_STATUS: u64 = 0x611;
}

/// Attempts before a jittering APERF/MPERF pair is reported
const PERF_READ_ATTEMPTS: usize = 5;

/// One read may take at most this many times as long as the other
const PERF_READ_SKEW: u32 = 2;

const MODPROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hardware register and CPU identification capability
pub trait RegisterAccess: Send + Sync {
    /// Read a 64-bit model specific register on `cpu`
    fn read_msr(&self, cpu: usize, offset: u64) -> std::result::Result<u64, RegisterError>;

    /// Read the (active, reference) cycle counters of `cpu` as a consistent pair
    fn read_perf_counters(&self, cpu: usize) -> std::result::Result<(u64, u64), RegisterError>;

    /// CPUID leaf 1 EAX signature
    fn cpu_signature(&self) -> u32;

    /// CPUID vendor check
    fn is_genuine_intel(&self) -> bool;

    /// CPUID leaf 6 APERF/MPERF support
    fn has_aperf(&self) -> bool;
}

/// Register access through the msr character devices
pub struct DevMsr {
    /// Indexed by core id, `None` for cores that are not present
    devices: Vec<Option<File>>,
}

impl DevMsr {
    /// Open the msr device of every listed core below `dev_root` (normally
    /// `/dev/cpu`), loading the msr module when the devices are missing
    pub async fn open(dev_root: &Path, cores: impl IntoIterator<Item = usize>) -> Result<Self> {
        let cores: Vec<usize> = cores.into_iter().collect();
        let Some(&first) = cores.first() else {
            return Err(QosError::Unsupported("no cpu to read registers from".to_string()));
        };
        if !Self::device_path(dev_root, first).exists() {
            Self::load_module().await?;
        }

        let mut devices: Vec<Option<File>> = Vec::new();
        for &cpu in &cores {
            let path = Self::device_path(dev_root, cpu);
            let file = File::open(&path).map_err(|e| {
                QosError::Unsupported(format!(
                    "{} unreadable ({}), run as root or grant read access to /dev/cpu/*/msr",
                    path.display(),
                    e
                ))
            })?;
            if devices.len() <= cpu {
                devices.resize_with(cpu + 1, || None);
            }
            devices[cpu] = Some(file);
        }
        info!(cores = cores.len(), "Opened msr devices");

        Ok(Self { devices })
    }

    fn device_path(dev_root: &Path, cpu: usize) -> PathBuf {
        dev_root.join(format!("{}/msr", cpu))
    }

    async fn load_module() -> Result<()> {
        warn!("msr devices missing, loading msr module");
        let status = tokio::time::timeout(
            MODPROBE_TIMEOUT,
            Command::new("/sbin/modprobe")
                .arg("msr")
                .kill_on_drop(true)
                .status(),
        )
        .await
        .map_err(|_| QosError::Timeout {
            what: "modprobe msr".to_string(),
            timeout: MODPROBE_TIMEOUT,
        })?
        .map_err(|e| QosError::Unsupported(format!("modprobe msr failed: {}", e)))?;

        if !status.success() {
            return Err(QosError::Unsupported(format!(
                "modprobe msr exited with {}",
                status
            )));
        }
        Ok(())
    }
}

impl RegisterAccess for DevMsr {
    fn read_msr(&self, cpu: usize, offset: u64) -> std::result::Result<u64, RegisterError> {
        let device = self.devices.get(cpu).and_then(Option::as_ref).ok_or_else(|| RegisterError::Read {
            cpu,
            offset,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no msr device for cpu"),
        })?;

        let mut buf = [0u8; 8];
        device
            .read_exact_at(&mut buf, offset)
            .map_err(|source| RegisterError::Read {
                cpu,
                offset,
                source,
            })?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn read_perf_counters(&self, cpu: usize) -> std::result::Result<(u64, u64), RegisterError> {
        for _ in 0..PERF_READ_ATTEMPTS {
            // Warm the device path so the timed reads are comparable
            self.read_msr(cpu, regs::IA32_APERF)?;

            let before = Instant::now();
            let aperf = self.read_msr(cpu, regs::IA32_APERF)?;
            let between = Instant::now();
            let mperf = self.read_msr(cpu, regs::IA32_MPERF)?;
            let after = Instant::now();

            let aperf_time = between - before;
            let mperf_time = after - between;
            if aperf_time > mperf_time * PERF_READ_SKEW || mperf_time > aperf_time * PERF_READ_SKEW
            {
                continue;
            }
            return Ok((aperf, mperf));
        }
        Err(RegisterError::Jitter { cpu })
    }

    fn cpu_signature(&self) -> u32 {
        cpuid(1).0
    }

    fn is_genuine_intel(&self) -> bool {
        let (_, ebx, ecx, edx) = cpuid(0);
        // "Genu" "ineI" "ntel"
        ebx == 0x756e_6547 && edx == 0x4965_6e69 && ecx == 0x6c65_746e
    }

    fn has_aperf(&self) -> bool {
        cpuid(6).2 & 1 == 1
    }
}

#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    // SAFETY: cpuid is available on every x86_64 processor
    let r = unsafe { std::arch::x86_64::__cpuid(leaf) };
    (r.eax, r.ebx, r.ecx, r.edx)
}

#[cfg(not(target_arch = "x86_64"))]
fn cpuid(_leaf: u32) -> (u32, u32, u32, u32) {
    (0, 0, 0, 0)
}
