//! Libvirt backend implementation.

use async_trait::async_trait;
use std::io::Write;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::descriptor::snapshot_xml;
use crate::error::{HypervisorError, Result};
use crate::traits::DomainDirectory;
use crate::types::*;

/// Snapshot metadata goes with the domain; plain undefine refuses domains
/// that have snapshots.
const UNDEFINE_FLAGS: sys::virDomainUndefineFlagsValues =
    sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA;

/// Libvirt/QEMU domain directory.
///
/// Domain calls go through the `virt` bindings. The `virt` crate v0.4 does not
/// expose the snapshot API, so snapshot calls shell out to `virsh` against the
/// same connection URI.
pub struct LibvirtDirectory {
    uri: String,
    connection: Connect,
}

impl LibvirtDirectory {
    /// Create a new directory connected to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn new(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection,
        })
    }

    /// Get a domain by name.
    fn get_domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, name)
            .map_err(|e| HypervisorError::DomainNotFound(format!("{}: {}", name, e)))
    }

    /// Convert libvirt domain state to DomainState.
    fn state_from_libvirt(state: sys::virDomainState) -> DomainState {
        match state {
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
            sys::VIR_DOMAIN_PAUSED | sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
            _ => DomainState::NoState,
        }
    }

    /// Run `virsh` against this directory's connection.
    async fn virsh(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, "Running virsh");
        Command::new("virsh")
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .await
            .map_err(|e| HypervisorError::Internal(format!("virsh command failed: {}", e)))
    }

    /// Run `virsh`, turning a non-zero exit into a snapshot error.
    async fn virsh_snapshot(&self, args: &[&str]) -> Result<Output> {
        let output = self.virsh(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::SnapshotFailed(format!(
                "virsh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl DomainDirectory for LibvirtDirectory {
    fn uri(&self) -> &str {
        &self.uri
    }

    #[instrument(skip(self))]
    async fn list_defined_domains(&self) -> Result<Vec<String>> {
        let names = self
            .connection
            .list_defined_domains()
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

        debug!(count = names.len(), "Listed defined domains");
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn list_running_domains(&self) -> Result<Vec<String>> {
        let ids = self
            .connection
            .list_domains()
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

        let mut names = Vec::with_capacity(ids.len());
        for id in ids {
            // A domain may vanish between listing and lookup
            match Domain::lookup_by_id(&self.connection, id) {
                Ok(domain) => names.push(
                    domain
                        .get_name()
                        .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?,
                ),
                Err(e) => warn!(id = id, error = %e, "Running domain disappeared"),
            }
        }

        debug!(count = names.len(), "Listed running domains");
        Ok(names)
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn domain_xml(&self, name: &str) -> Result<String> {
        let domain = self.get_domain(name)?;
        domain
            .get_xml_desc(0)
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        let domain = self.get_domain(name)?;
        let (state, _) = domain
            .get_state()
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;
        Ok(Self::state_from_libvirt(state))
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn start_domain(&self, name: &str) -> Result<()> {
        info!("Starting domain");

        let domain = self.get_domain(name)?;
        domain
            .create()
            .map_err(|e| HypervisorError::StartFailed(e.to_string()))?;

        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        info!("Requesting graceful shutdown");

        let domain = self.get_domain(name)?;
        domain
            .shutdown()
            .map_err(|e| HypervisorError::StopFailed(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn destroy_domain(&self, name: &str) -> Result<()> {
        info!("Destroying domain");

        let domain = self.get_domain(name)?;
        domain
            .destroy()
            .map_err(|e| HypervisorError::StopFailed(e.to_string()))?;

        info!("Domain destroyed");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn undefine_domain(&self, name: &str) -> Result<()> {
        info!("Undefining domain");

        let domain = self.get_domain(name)?;
        domain
            .undefine_flags(UNDEFINE_FLAGS)
            .map_err(|e| HypervisorError::DeleteFailed(e.to_string()))?;

        info!("Domain undefined");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn list_snapshots(&self, name: &str) -> Result<Vec<String>> {
        // Topological order puts every parent before its children, which for
        // a linear chain is oldest first.
        let output = self
            .virsh(&["snapshot-list", name, "--name", "--topological"])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::QueryFailed(format!(
                "virsh snapshot-list failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    #[instrument(skip(self, snapshot), fields(domain = %name, snapshot = %snapshot.name))]
    async fn create_snapshot(&self, name: &str, snapshot: &Snapshot) -> Result<()> {
        info!(parent = ?snapshot.parent, "Creating snapshot");

        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        file.write_all(snapshot_xml(snapshot).as_bytes())
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;

        let path = file.path().to_string_lossy().into_owned();
        self.virsh_snapshot(&["snapshot-create", name, &path]).await?;

        info!("Snapshot created via virsh");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name, snapshot = %snapshot))]
    async fn revert_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        info!("Reverting to snapshot");

        self.virsh_snapshot(&["snapshot-revert", name, snapshot]).await?;

        info!("Reverted to snapshot via virsh");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name, snapshot = %snapshot))]
    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        info!("Deleting snapshot");

        self.virsh_snapshot(&["snapshot-delete", name, snapshot]).await?;

        info!("Snapshot deleted via virsh");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn current_snapshot_xml(&self, name: &str) -> Result<Option<String>> {
        let output = self.virsh(&["snapshot-current", name]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no current snapshot") {
                return Ok(None);
            }
            return Err(HypervisorError::QueryFailed(format!(
                "virsh snapshot-current failed: {}",
                stderr.trim()
            )));
        }

        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}
