//! The lab context: one domain directory and everything built on it.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};
use vmlab_hypervisor::DomainDirectory;

use crate::config::Config;
use crate::discovery::NetworkDiscovery;
use crate::error::Result;
use crate::executor::RemoteExecutor;
use crate::inventory::{render_table, DomainInventory, TableRow};
use crate::session::{OpensshConnector, SessionConnector, SessionManager};
use crate::shell::{HostShell, LocalShell};
use crate::status::{NetworkProbe, ReachabilityProbe, StatusOracle, VmStatus};
use crate::vm::Vm;

/// Shared handle to the lab. Cloning is cheap.
#[derive(Clone)]
pub struct Lab {
    config: Arc<Config>,
    directory: Arc<dyn DomainDirectory>,
    shell: Arc<dyn HostShell>,
    inventory: Arc<DomainInventory>,
    executor: Arc<RemoteExecutor>,
    oracle: Arc<StatusOracle>,
}

impl Lab {
    pub fn builder(config: Config, directory: Arc<dyn DomainDirectory>) -> LabBuilder {
        LabBuilder {
            config,
            directory,
            shell: None,
            connector: None,
            probe: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> &Arc<dyn DomainDirectory> {
        &self.directory
    }

    pub fn shell(&self) -> &Arc<dyn HostShell> {
        &self.shell
    }

    pub fn inventory(&self) -> &Arc<DomainInventory> {
        &self.inventory
    }

    pub fn executor(&self) -> &Arc<RemoteExecutor> {
        &self.executor
    }

    pub fn oracle(&self) -> &Arc<StatusOracle> {
        &self.oracle
    }

    /// Full inventory reload.
    pub async fn reload(&self) -> Result<()> {
        self.inventory.reload().await
    }

    /// Handle for a VM in the inventory.
    pub fn vm(&self, name: &str) -> Result<Vm> {
        self.inventory.attributes_of(name)?;
        Ok(Vm::new(name, self.clone()))
    }

    /// Handles for every VM in the inventory, sorted by name.
    pub fn vms(&self) -> Vec<Vm> {
        self.inventory
            .vm_names()
            .into_iter()
            .map(|name| Vm::new(&name, self.clone()))
            .collect()
    }

    /// Inventory table with a freshly computed status per VM.
    pub async fn table(&self) -> Result<String> {
        let attributes = self.inventory.attributes();
        let statuses = join_all(
            attributes
                .keys()
                .map(|name| self.oracle.status(name)),
        )
        .await;

        let rows = attributes
            .values()
            .zip(statuses)
            .map(|(attrs, status)| {
                let status = status.unwrap_or_else(|e| {
                    warn!(vm = %attrs.name, error = %e, "Could not determine status");
                    VmStatus::Unknown
                });
                TableRow::new(attrs, status)
            })
            .collect();

        Ok(render_table(rows))
    }

    /// Close every open session.
    pub async fn close_all(&self) {
        self.executor.close_all().await;
    }
}

/// Wires a [`Lab`] together, defaulting to the real host shell, OpenSSH
/// sessions and network probes.
pub struct LabBuilder {
    config: Config,
    directory: Arc<dyn DomainDirectory>,
    shell: Option<Arc<dyn HostShell>>,
    connector: Option<Arc<dyn SessionConnector>>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
}

impl LabBuilder {
    pub fn shell(mut self, shell: Arc<dyn HostShell>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Lab {
        let config = Arc::new(self.config);
        let shell = self
            .shell
            .unwrap_or_else(|| Arc::new(LocalShell::new()));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(OpensshConnector::new(&config.ssh)));
        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(NetworkProbe::new(
                Arc::clone(&shell),
                config.ssh.port,
                config.timeouts.probe(),
            ))
        });

        let inventory = Arc::new(DomainInventory::new(
            Arc::clone(&self.directory),
            NetworkDiscovery::new(Arc::clone(&shell), config.network.clone()),
        ));
        let executor = Arc::new(RemoteExecutor::new(
            Arc::clone(&inventory),
            SessionManager::new(connector),
            config.ssh.command_timeout(),
        ));
        let oracle = Arc::new(StatusOracle::new(
            Arc::clone(&self.directory),
            Arc::clone(&inventory),
            probe,
            config.timeouts.poll_interval(),
        ));

        info!(uri = %self.directory.uri(), "Lab initialized");

        Lab {
            config,
            directory: self.directory,
            shell,
            inventory,
            executor,
            oracle,
        }
    }
}
