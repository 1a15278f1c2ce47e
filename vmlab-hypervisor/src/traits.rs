//! Core domain directory abstraction trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// The hypervisor management surface vmlab orchestrates.
///
/// Domains are addressed by name. Everything here is a thin pass-through to
/// the hypervisor; waiting, probing and snapshot chain bookkeeping live in the
/// layers above.
#[async_trait]
pub trait DomainDirectory: Send + Sync {
    /// Connection URI, handed to external tools that need to reach the same
    /// hypervisor (e.g. `virt-clone --connect`).
    fn uri(&self) -> &str;

    // =========================================================================
    // Enumeration & Descriptors
    // =========================================================================

    /// Names of domains that are defined but not active.
    async fn list_defined_domains(&self) -> Result<Vec<String>>;

    /// Names of active domains.
    async fn list_running_domains(&self) -> Result<Vec<String>>;

    /// Full XML descriptor of a domain.
    async fn domain_xml(&self, name: &str) -> Result<String>;

    /// Current power state of a domain.
    async fn domain_state(&self, name: &str) -> Result<DomainState>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Boot a defined domain.
    async fn start_domain(&self, name: &str) -> Result<()>;

    /// Request a graceful (ACPI) shutdown. Returns without waiting.
    async fn shutdown_domain(&self, name: &str) -> Result<()>;

    /// Immediately terminate a domain.
    async fn destroy_domain(&self, name: &str) -> Result<()>;

    /// Remove a domain definition.
    async fn undefine_domain(&self, name: &str) -> Result<()>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot names of a domain, oldest first.
    async fn list_snapshots(&self, name: &str) -> Result<Vec<String>>;

    /// Create a snapshot (metadata plus disk state) and make it current.
    async fn create_snapshot(&self, name: &str, snapshot: &Snapshot) -> Result<()>;

    /// Revert a domain to a snapshot.
    async fn revert_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    /// Delete a single snapshot. Children are not touched.
    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    /// XML descriptor of the current snapshot, `None` if there is none.
    async fn current_snapshot_xml(&self, name: &str) -> Result<Option<String>>;
}
