//! Library for the VM QoS agent
//!
//! This crate provides the core functionality for:
//! - Host telemetry from model specific registers and per-VM CPU accounting
//! - Package power hotspot analysis and victim selection
//! - CPU quota, cache/memory bandwidth and network bandwidth control
//! - Health checks and observability

pub mod analyzer;
pub mod collector;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod manager;
pub mod models;
pub mod observability;
pub mod sysfs;

pub use config::QosConfig;
pub use error::{ErrorClass, QosError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use manager::{Backends, ControlLoop, ControlLoopBuilder, QosManager, TickReport};
pub use models::*;
pub use observability::{QosMetrics, StructuredLogger};
