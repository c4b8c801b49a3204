//! Error types for the QoS agent
//!
//! Every failure raised by a component carries a [`ErrorClass`] so the
//! control loop can decide between skipping the current tick and exiting.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for QoS operations
pub type Result<T> = std::result::Result<T, QosError>;

/// How far an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing hardware capability or invalid configuration, raised before the loop starts
    FatalStartup,
    /// Broken invariant or failed external dependency while the loop runs
    FatalRuntime,
    /// A single VM vanished or misbehaved; it is dropped and the loop continues
    TransientVm,
    /// A single telemetry sample was unusable; only the current tick is skipped
    TransientSample,
}

impl ErrorClass {
    /// Returns true if the control loop may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorClass::TransientVm | ErrorClass::TransientSample)
    }

    /// Metric label for this class
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::FatalStartup => "fatal_startup",
            ErrorClass::FatalRuntime => "fatal_runtime",
            ErrorClass::TransientVm => "transient_vm",
            ErrorClass::TransientSample => "transient_sample",
        }
    }
}

/// Register access failures reported by a [`crate::collector::RegisterAccess`] backend
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("cpu {cpu}: register {offset:#x} read failed: {source}")]
    Read {
        cpu: usize,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("cpu {cpu}: aperf/mperf reads kept jittering")]
    Jitter { cpu: usize },
}

/// Hypervisor failures, split by whether the domain simply went away
#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("domain {domain} is no longer running")]
    DomainGone { domain: String },

    #[error("hypervisor request failed: {0}")]
    Other(String),
}

/// Main error type for the QoS agent
#[derive(Error, Debug)]
pub enum QosError {
    #[error("invalid threshold {name}={value}, expected {min}..={max}")]
    InvalidThreshold {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("unsupported host: {0}")]
    Unsupported(String),

    #[error("resctrl setup failed: {0}")]
    Resctrl(String),

    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("zero {what} delta on {index}, samples are not temporally distinct")]
    ZeroDelta { what: &'static str, index: usize },

    #[error("cpu {cpu}: active and reference counters both read zero")]
    EmptyCounters { cpu: usize },

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("domain {name}({id}): {reason}")]
    DomainAttribute { id: u32, name: String, reason: String },

    #[error("{tool} {args}: {reason}")]
    ExternalTool {
        tool: String,
        args: String,
        reason: String,
    },

    #[error("{what} timed out after {timeout:?}")]
    Timeout { what: String, timeout: Duration },
}

impl QosError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QosError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        QosError::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error for the control loop
    pub fn class(&self) -> ErrorClass {
        match self {
            QosError::InvalidThreshold { .. }
            | QosError::Unsupported(_)
            | QosError::Resctrl(_) => ErrorClass::FatalStartup,
            QosError::EmptyCounters { .. } => ErrorClass::TransientSample,
            QosError::Register(RegisterError::Jitter { .. }) => ErrorClass::TransientSample,
            QosError::Hypervisor(HypervisorError::DomainGone { .. }) => ErrorClass::TransientVm,
            QosError::DomainAttribute { .. } => ErrorClass::TransientVm,
            QosError::Io { .. }
            | QosError::Parse { .. }
            | QosError::ZeroDelta { .. }
            | QosError::Register(RegisterError::Read { .. })
            | QosError::Hypervisor(HypervisorError::Other(_))
            | QosError::ExternalTool { .. }
            | QosError::Timeout { .. } => ErrorClass::FatalRuntime,
        }
    }

    /// True when the underlying I/O error means the target file or directory is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            QosError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
