//! Mock domain directory for testing and development.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::descriptor::DomainDescriptor;
use crate::error::{HypervisorError, Result};
use crate::traits::DomainDirectory;
use crate::types::*;

/// In-memory domain directory.
///
/// Simulates libvirt's behaviour closely enough to drive the orchestration
/// layer end to end:
/// - Unit and integration testing
/// - Development without libvirt installed (`--dev`)
pub struct MockDirectory {
    uri: String,
    domains: RwLock<BTreeMap<String, MockDomain>>,
}

struct MockDomain {
    xml: String,
    state: DomainState,
    snapshots: Vec<MockSnapshot>,
    current_snapshot: Option<String>,
    /// Guest ignores ACPI shutdown requests
    ignores_shutdown: bool,
    /// Current snapshot lookups fail with a query error
    current_snapshot_broken: bool,
}

struct MockSnapshot {
    snapshot: Snapshot,
    state: DomainState,
}

impl MockDirectory {
    /// Create a new, empty mock directory.
    pub fn new() -> Self {
        info!("Creating mock domain directory");
        Self {
            uri: "test:///default".to_string(),
            domains: RwLock::new(BTreeMap::new()),
        }
    }

    /// Define a domain from a descriptor. The domain starts shut off.
    pub fn define(&self, descriptor: &DomainDescriptor) -> Result<()> {
        self.define_xml(&descriptor.to_xml())
    }

    /// Define a domain with a random MAC on the lab network.
    pub fn define_with_random_mac(&self, name: &str, description: &str) -> Result<String> {
        let mac = generate_mac_address();
        self.define(
            &DomainDescriptor::new(name)
                .with_description(description)
                .with_network_mac(mac.clone()),
        )?;
        Ok(mac)
    }

    /// Define a domain from raw XML. The domain starts shut off.
    pub fn define_xml(&self, xml: &str) -> Result<()> {
        let name = DomainDescriptor::parse(xml)?.name;
        let mut domains = self.write()?;

        if domains.contains_key(&name) {
            return Err(HypervisorError::InvalidState(format!(
                "domain {} already exists",
                name
            )));
        }

        debug!(domain = %name, "Mock domain defined");
        domains.insert(
            name,
            MockDomain {
                xml: xml.to_string(),
                state: DomainState::Shutoff,
                snapshots: Vec::new(),
                current_snapshot: None,
                ignores_shutdown: false,
                current_snapshot_broken: false,
            },
        );
        Ok(())
    }

    /// Force a domain into a state, as if the guest changed it on its own.
    pub fn set_state(&self, name: &str, state: DomainState) -> Result<()> {
        self.with_domain(name, |dom| {
            dom.state = state;
            Ok(())
        })
    }

    /// Make the guest ignore graceful shutdown requests.
    pub fn set_ignores_shutdown(&self, name: &str, ignores: bool) -> Result<()> {
        self.with_domain(name, |dom| {
            dom.ignores_shutdown = ignores;
            Ok(())
        })
    }

    /// Make current-snapshot lookups fail.
    pub fn set_current_snapshot_broken(&self, name: &str, broken: bool) -> Result<()> {
        self.with_domain(name, |dom| {
            dom.current_snapshot_broken = broken;
            Ok(())
        })
    }

    /// Whether a domain is defined.
    pub fn contains(&self, name: &str) -> bool {
        self.domains
            .read()
            .map(|domains| domains.contains_key(name))
            .unwrap_or(false)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, MockDomain>>> {
        self.domains
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn with_domain<T>(&self, name: &str, f: impl FnOnce(&mut MockDomain) -> Result<T>) -> Result<T> {
        let mut domains = self.write()?;
        let dom = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
        f(dom)
    }
}

impl Default for MockDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainDirectory for MockDirectory {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn list_defined_domains(&self) -> Result<Vec<String>> {
        let domains = self.domains.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        Ok(domains
            .iter()
            .filter(|(_, dom)| !dom.state.is_active())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn list_running_domains(&self) -> Result<Vec<String>> {
        let domains = self.domains.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        Ok(domains
            .iter()
            .filter(|(_, dom)| dom.state.is_active())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        self.with_domain(name, |dom| Ok(dom.xml.clone()))
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        self.with_domain(name, |dom| Ok(dom.state))
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn start_domain(&self, name: &str) -> Result<()> {
        self.with_domain(name, |dom| {
            if dom.state.is_active() {
                return Err(HypervisorError::InvalidState(
                    "domain is already active".to_string(),
                ));
            }
            dom.state = DomainState::Running;
            info!("Mock domain started");
            Ok(())
        })
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.with_domain(name, |dom| {
            if !dom.state.is_active() {
                return Err(HypervisorError::InvalidState(
                    "domain is not running".to_string(),
                ));
            }
            if dom.ignores_shutdown {
                info!("Mock guest ignored shutdown request");
            } else {
                dom.state = DomainState::Shutoff;
                info!("Mock domain shut down");
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn destroy_domain(&self, name: &str) -> Result<()> {
        self.with_domain(name, |dom| {
            if !dom.state.is_active() {
                return Err(HypervisorError::InvalidState(
                    "domain is not running".to_string(),
                ));
            }
            dom.state = DomainState::Shutoff;
            info!("Mock domain destroyed");
            Ok(())
        })
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn undefine_domain(&self, name: &str) -> Result<()> {
        let mut domains = self.write()?;
        let dom = domains
            .get(name)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;

        if dom.state.is_active() {
            return Err(HypervisorError::DeleteFailed(
                "domain must be stopped before deletion".to_string(),
            ));
        }

        domains.remove(name);
        info!("Mock domain undefined");
        Ok(())
    }

    async fn list_snapshots(&self, name: &str) -> Result<Vec<String>> {
        self.with_domain(name, |dom| {
            Ok(dom
                .snapshots
                .iter()
                .map(|s| s.snapshot.name.clone())
                .collect())
        })
    }

    #[instrument(skip(self, snapshot), fields(domain = %name, snapshot = %snapshot.name))]
    async fn create_snapshot(&self, name: &str, snapshot: &Snapshot) -> Result<()> {
        self.with_domain(name, |dom| {
            if dom.snapshots.iter().any(|s| s.snapshot.name == snapshot.name) {
                return Err(HypervisorError::SnapshotFailed(format!(
                    "snapshot {} already exists",
                    snapshot.name
                )));
            }
            dom.snapshots.push(MockSnapshot {
                snapshot: snapshot.clone(),
                state: dom.state,
            });
            dom.current_snapshot = Some(snapshot.name.clone());
            info!("Mock snapshot created");
            Ok(())
        })
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn revert_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        self.with_domain(name, |dom| {
            let state = dom
                .snapshots
                .iter()
                .find(|s| s.snapshot.name == snapshot)
                .map(|s| s.state)
                .ok_or_else(|| HypervisorError::SnapshotNotFound(snapshot.to_string()))?;
            dom.state = state;
            dom.current_snapshot = Some(snapshot.to_string());
            info!(snapshot = %snapshot, "Mock domain reverted");
            Ok(())
        })
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        self.with_domain(name, |dom| {
            let idx = dom
                .snapshots
                .iter()
                .position(|s| s.snapshot.name == snapshot)
                .ok_or_else(|| HypervisorError::SnapshotNotFound(snapshot.to_string()))?;
            let removed = dom.snapshots.remove(idx);

            // libvirt moves the current pointer to the parent
            if dom.current_snapshot.as_deref() == Some(snapshot) {
                dom.current_snapshot = removed.snapshot.parent;
            }
            info!(snapshot = %snapshot, "Mock snapshot deleted");
            Ok(())
        })
    }

    async fn current_snapshot_xml(&self, name: &str) -> Result<Option<String>> {
        self.with_domain(name, |dom| {
            if dom.current_snapshot_broken {
                return Err(HypervisorError::QueryFailed(
                    "current snapshot metadata unavailable".to_string(),
                ));
            }
            Ok(dom.current_snapshot.as_ref().and_then(|current| {
                dom.snapshots
                    .iter()
                    .find(|s| &s.snapshot.name == current)
                    .map(|s| crate::descriptor::snapshot_xml(&s.snapshot))
            }))
        })
    }
}

/// Generate a random MAC address in the QEMU/KVM OUI.
pub fn generate_mac_address() -> String {
    let bytes: [u8; 3] = rand::random();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[0] & 0x3f,
        bytes[1],
        bytes[2]
    )
}
