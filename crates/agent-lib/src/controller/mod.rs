//! Resource controllers
//!
//! [`CpuController`] throttles blamed domains with hysteresis,
//! [`CacheMbwController`] and [`NetController`] hold static reservations for
//! the low priority class and keep its membership current.

mod cachembw;
mod cpu;
mod net;

pub use cachembw::{cache_way_mask, min_bandwidth_percent, CacheMbwController, ResctrlInfo};
pub use cpu::{AdjustmentLedger, CpuController};
pub use net::{physical_interfaces, BandwidthManager, BwmCli, NetController};
