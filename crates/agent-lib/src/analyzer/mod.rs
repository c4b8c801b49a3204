//! Hotspot analysis
//!
//! Turns host telemetry into a [`HotspotReport`] and blames low priority
//! domains in the CPU controller's adjustment ledger.

mod power;

pub use power::{HotspotReport, PowerAnalyzer, PACKAGE_VICTIM_COUNT};
