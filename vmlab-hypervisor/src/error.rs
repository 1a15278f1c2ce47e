//! Error types for the domain directory layer.

use thiserror::Error;

/// Errors that can occur while talking to the hypervisor.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Domain was not found.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Failed to start a domain.
    #[error("Failed to start domain: {0}")]
    StartFailed(String),

    /// Failed to shut down or destroy a domain.
    #[error("Failed to stop domain: {0}")]
    StopFailed(String),

    /// Failed to undefine a domain.
    #[error("Failed to delete domain: {0}")]
    DeleteFailed(String),

    /// Snapshot operation failed.
    #[error("Snapshot operation failed: {0}")]
    SnapshotFailed(String),

    /// Snapshot not found.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Query failed.
    #[error("Failed to query: {0}")]
    QueryFailed(String),

    /// Domain is in an invalid state for the requested operation.
    #[error("Invalid domain state for operation: {0}")]
    InvalidState(String),

    /// XML parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for domain directory operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
