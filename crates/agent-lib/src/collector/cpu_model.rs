//! CPU family/model decoding and base clock tables

use super::msr::{regs, RegisterAccess};
use crate::error::Result;
use tracing::{info, warn};

/// Intel family 6 model numbers
pub mod intel {
    pub const SANDYBRIDGE: u32 = 0x2A;
    pub const SANDYBRIDGE_X: u32 = 0x2D;
    pub const IVYBRIDGE: u32 = 0x3A;
    pub const IVYBRIDGE_X: u32 = 0x3E;
    pub const HASWELL: u32 = 0x3C;
    pub const HASWELL_X: u32 = 0x3F;
    pub const HASWELL_L: u32 = 0x45;
    pub const HASWELL_G: u32 = 0x46;
    pub const BROADWELL: u32 = 0x3D;
    pub const BROADWELL_G: u32 = 0x47;
    pub const BROADWELL_X: u32 = 0x4F;
    pub const BROADWELL_D: u32 = 0x56;
    pub const SKYLAKE_L: u32 = 0x4E;
    pub const SKYLAKE: u32 = 0x5E;
    pub const SKYLAKE_X: u32 = 0x55;
    pub const KABYLAKE_L: u32 = 0x8E;
    pub const KABYLAKE: u32 = 0x9E;
    pub const CANNONLAKE_L: u32 = 0x66;
    pub const ICELAKE_X: u32 = 0x6A;
    pub const ICELAKE_D: u32 = 0x6C;
    pub const SAPPHIRERAPIDS_X: u32 = 0x8F;
    pub const EMERALDRAPIDS_X: u32 = 0xCF;
    pub const ATOM_SILVERMONT: u32 = 0x37;
    pub const ATOM_SILVERMONT_D: u32 = 0x4D;
    pub const ATOM_GOLDMONT: u32 = 0x5C;
    pub const ATOM_GOLDMONT_D: u32 = 0x5F;
    pub const ATOM_GOLDMONT_PLUS: u32 = 0x7A;
    pub const ATOM_TREMONT_D: u32 = 0x86;
    pub const ATOM_TREMONT: u32 = 0x96;
    pub const XEON_PHI_KNL: u32 = 0x57;
}

/// Models whose bus clock is a fixed 100 MHz
const SNB_MSR_MODELS: &[u32] = &[
    intel::SANDYBRIDGE,
    intel::SANDYBRIDGE_X,
    intel::IVYBRIDGE,
    intel::IVYBRIDGE_X,
    intel::HASWELL,
    intel::HASWELL_X,
    intel::HASWELL_L,
    intel::HASWELL_G,
    intel::BROADWELL,
    intel::BROADWELL_G,
    intel::BROADWELL_X,
    intel::BROADWELL_D,
    intel::SKYLAKE_L,
    intel::SKYLAKE,
    intel::SKYLAKE_X,
    intel::KABYLAKE_L,
    intel::KABYLAKE,
    intel::CANNONLAKE_L,
    intel::ICELAKE_X,
    intel::ICELAKE_D,
    intel::SAPPHIRERAPIDS_X,
    intel::EMERALDRAPIDS_X,
    intel::ATOM_GOLDMONT,
    intel::ATOM_GOLDMONT_PLUS,
    intel::ATOM_GOLDMONT_D,
    intel::ATOM_TREMONT,
    intel::ATOM_TREMONT_D,
];

/// Silvermont bus clock table, indexed by the low nibble of FSB_FREQ
const SLM_BCLK_MHZ: [f64; 5] = [83.3, 100.0, 133.3, 116.7, 80.0];

const SLM_BCLK_FALLBACK_INDEX: usize = 3;

const LEGACY_BCLK_MHZ: f64 = 133.33;

const SNB_BCLK_MHZ: f64 = 100.0;

/// Decoded CPU family and model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuModel {
    pub family: u32,
    pub model: u32,
}

impl CpuModel {
    /// Decode a CPUID leaf 1 signature
    pub fn from_signature(signature: u32) -> Self {
        let mut family = (signature >> 8) & 0xF;
        let mut model = (signature >> 4) & 0xF;
        if family == 0xF {
            family += (signature >> 20) & 0xFF;
        }
        if family >= 6 {
            model += ((signature >> 16) & 0xF) << 4;
        }
        Self { family, model }
    }

    fn is_known(&self) -> bool {
        SNB_MSR_MODELS.contains(&self.model)
            || self.is_knights_landing()
            || self.is_silvermont()
    }

    pub fn has_snb_msrs(&self) -> bool {
        SNB_MSR_MODELS.contains(&self.model)
    }

    pub fn is_knights_landing(&self) -> bool {
        self.model == intel::XEON_PHI_KNL
    }

    pub fn is_silvermont(&self) -> bool {
        matches!(self.model, intel::ATOM_SILVERMONT | intel::ATOM_SILVERMONT_D)
    }

    /// Multiplier applied to APERF/MPERF, which tick slower on many-core parts
    pub fn aperf_mperf_multiplier(&self) -> u64 {
        if self.is_knights_landing() {
            1024
        } else {
            1
        }
    }

    /// Bus clock in MHz
    pub fn bclk_mhz(&self, regs: &dyn RegisterAccess, cpu: usize) -> Result<f64> {
        if !self.is_known() {
            warn!(model = self.model, "Unknown cpu model, assuming legacy bus clock");
        }
        if self.has_snb_msrs() || self.is_knights_landing() {
            return Ok(SNB_BCLK_MHZ);
        }
        if self.is_silvermont() {
            let mut index = (regs.read_msr(cpu, regs::FSB_FREQ)? & 0xF) as usize;
            if index >= SLM_BCLK_MHZ.len() {
                info!(index = index, "Invalid Silvermont bus clock index");
                index = SLM_BCLK_FALLBACK_INDEX;
            }
            return Ok(SLM_BCLK_MHZ[index]);
        }
        Ok(LEGACY_BCLK_MHZ)
    }
}
