//! Error types for VM orchestration.

use thiserror::Error;
use vmlab_hypervisor::HypervisorError;

/// Errors raised by the orchestration layer.
#[derive(Error, Debug)]
pub enum LabError {
    /// A strictly executed command exited non-zero.
    #[error("cmd failed: {command}")]
    CommandFailed { command: String },

    /// A command did not finish within the configured timeout.
    #[error("cmd timed out after {secs}s: {command}")]
    CommandTimedOut { command: String, secs: u64 },

    /// An argument referenced something that does not exist.
    #[error("{0}")]
    ArgumentError(String),

    /// The VM is not part of the inventory.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// The VM has no address on the lab network right now.
    #[error("VM {0} has no known IP address")]
    NoIpAddress(String),

    /// The VM is in the wrong state for the requested operation.
    #[error("Invalid VM state: {0}")]
    InvalidState(String),

    /// A remote session could not be opened or used.
    #[error("Session error: {0}")]
    Session(String),

    /// Error reported by the domain directory.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    /// Local process or filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabError {
    /// Short machine-readable name of the error variant.
    pub fn kind(&self) -> &'static str {
        match self {
            LabError::CommandFailed { .. } => "command_failed",
            LabError::CommandTimedOut { .. } => "command_timed_out",
            LabError::ArgumentError(_) => "argument_error",
            LabError::VmNotFound(_) => "vm_not_found",
            LabError::NoIpAddress(_) => "no_ip_address",
            LabError::InvalidState(_) => "invalid_state",
            LabError::Session(_) => "session",
            LabError::Hypervisor(_) => "hypervisor",
            LabError::Io(_) => "io",
        }
    }
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, LabError>;
