//! Domain inventory: every known domain joined with its lab network address.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use vmlab_hypervisor::{DomainDescriptor, DomainDirectory, HypervisorError};

use crate::discovery::{normalize_mac, NetworkDiscovery};
use crate::error::{LabError, Result};
use crate::status::VmStatus;

/// MAC placeholder for domains without a `network` interface.
pub const UNKNOWN_MAC: &str = "unknown";

/// Attributes of one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainAttributes {
    /// Domain name, unique within the inventory
    pub name: String,
    /// Guest OS label taken from the descriptor's description
    pub guest_os: String,
    /// Normalized MAC on the lab network, or [`UNKNOWN_MAC`]
    pub mac: String,
    /// Address answering the last scan for `mac`; empty when none did
    pub ip: String,
}

impl DomainAttributes {
    /// Derive attributes from a descriptor and the latest scan.
    pub fn derive(descriptor: &DomainDescriptor, mac_ip_map: &HashMap<String, String>) -> Self {
        let mac = descriptor
            .network_mac
            .as_deref()
            .map(normalize_mac)
            .unwrap_or_else(|| UNKNOWN_MAC.to_string());
        let ip = mac_ip_map.get(&mac).cloned().unwrap_or_default();

        Self {
            name: descriptor.name.clone(),
            guest_os: descriptor.description.clone(),
            mac,
            ip,
        }
    }

    pub fn has_ip(&self) -> bool {
        !self.ip.is_empty()
    }
}

/// A domain's descriptor as fetched from the directory.
#[derive(Debug, Clone)]
pub struct RawDescriptor {
    xml: String,
}

impl RawDescriptor {
    pub fn new(xml: impl Into<String>) -> Self {
        Self { xml: xml.into() }
    }

    pub fn parse(&self) -> Result<DomainDescriptor> {
        Ok(DomainDescriptor::parse(&self.xml)?)
    }
}

type AttributeMap = BTreeMap<String, DomainAttributes>;
type DescriptorMap = BTreeMap<String, RawDescriptor>;

/// Attribute table of every defined or running domain.
///
/// Both maps are immutable snapshots behind an `Arc`; reloads build a fresh
/// map and swap it in, so readers always see one complete generation.
pub struct DomainInventory {
    directory: Arc<dyn DomainDirectory>,
    discovery: NetworkDiscovery,
    descriptors: RwLock<Arc<DescriptorMap>>,
    attributes: RwLock<Arc<AttributeMap>>,
}

impl DomainInventory {
    /// Create an empty inventory. Call [`DomainInventory::reload`] to fill it.
    pub fn new(directory: Arc<dyn DomainDirectory>, discovery: NetworkDiscovery) -> Self {
        Self {
            directory,
            discovery,
            descriptors: RwLock::new(Arc::new(BTreeMap::new())),
            attributes: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    /// Re-read every domain descriptor from the directory, then re-derive
    /// attributes.
    pub async fn reload(&self) -> Result<()> {
        let mut names: BTreeSet<String> = BTreeSet::new();
        names.extend(self.directory.list_defined_domains().await?);
        names.extend(self.directory.list_running_domains().await?);

        let mut descriptors = DescriptorMap::new();
        for name in &names {
            let xml = match self.directory.domain_xml(name).await {
                Ok(xml) => xml,
                // Undefined between listing and lookup
                Err(HypervisorError::DomainNotFound(_)) => {
                    warn!(domain = %name, "Domain vanished during reload");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let raw = RawDescriptor::new(xml);
            let descriptor_name = raw.parse()?.name;
            descriptors.insert(descriptor_name, raw);
        }

        info!(domains = descriptors.len(), "Domain descriptors reloaded");
        *self.write_descriptors()? = Arc::new(descriptors);

        self.reload_attributes().await
    }

    /// Re-derive attributes from the cached descriptors and a fresh scan.
    pub async fn reload_attributes(&self) -> Result<()> {
        let mac_ip_map = self.discovery.scan().await;
        let descriptors = self.descriptors();

        let mut attributes = AttributeMap::new();
        for raw in descriptors.values() {
            let attrs = DomainAttributes::derive(&raw.parse()?, &mac_ip_map);
            attributes.insert(attrs.name.clone(), attrs);
        }

        debug!(
            domains = attributes.len(),
            addressed = attributes.values().filter(|a| a.has_ip()).count(),
            "Domain attributes reloaded"
        );
        *self.write_attributes()? = Arc::new(attributes);
        Ok(())
    }

    /// Current attribute table.
    pub fn attributes(&self) -> Arc<AttributeMap> {
        match self.attributes.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Attributes of one VM.
    pub fn attributes_of(&self, name: &str) -> Result<DomainAttributes> {
        self.attributes()
            .get(name)
            .cloned()
            .ok_or_else(|| LabError::VmNotFound(name.to_string()))
    }

    /// Names of all known VMs, sorted.
    pub fn vm_names(&self) -> Vec<String> {
        self.attributes().keys().cloned().collect()
    }

    /// Cached raw descriptors.
    pub fn descriptors(&self) -> Arc<DescriptorMap> {
        match self.descriptors.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn write_descriptors(&self) -> Result<std::sync::RwLockWriteGuard<'_, Arc<DescriptorMap>>> {
        self.descriptors
            .write()
            .map_err(|_| LabError::InvalidState("inventory lock poisoned".to_string()))
    }

    fn write_attributes(&self) -> Result<std::sync::RwLockWriteGuard<'_, Arc<AttributeMap>>> {
        self.attributes
            .write()
            .map_err(|_| LabError::InvalidState("inventory lock poisoned".to_string()))
    }
}

/// One row of the inventory table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRow {
    pub name: String,
    pub ip: String,
    pub status: VmStatus,
    pub guest_os: String,
}

impl TableRow {
    pub fn new(attributes: &DomainAttributes, status: VmStatus) -> Self {
        Self {
            name: attributes.name.clone(),
            ip: attributes.ip.clone(),
            status,
            guest_os: attributes.guest_os.clone(),
        }
    }
}

/// Render the operator-facing inventory table, sorted by status then name.
pub fn render_table(mut rows: Vec<TableRow>) -> String {
    const NAME: usize = 30;
    const IP: usize = 15;
    const STATUS: usize = 13;
    const OS: usize = 20;

    rows.sort_by(|a, b| {
        (a.status.as_str(), a.name.as_str()).cmp(&(b.status.as_str(), b.name.as_str()))
    });

    let delimiter = format!(
        "{}  {}  {}  {}\n",
        "-".repeat(NAME),
        "-".repeat(IP),
        "-".repeat(STATUS),
        "-".repeat(OS)
    );
    let line = |name: &str, ip: &str, status: &str, os: &str| {
        format!("{:<NAME$}  {:>IP$}  {:>STATUS$}  {:>OS$}\n", name, ip, status, os)
    };

    let mut table = delimiter.clone();
    table.push_str(&line("name", "ip", "status", "os"));
    table.push_str(&delimiter);
    for row in &rows {
        table.push_str(&line(&row.name, &row.ip, row.status.as_str(), &row.guest_os));
    }
    table.push_str(&delimiter);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::mock::ScriptedShell;
    use vmlab_hypervisor::MockDirectory;

    fn inventory(directory: Arc<MockDirectory>, shell: Arc<ScriptedShell>) -> DomainInventory {
        DomainInventory::new(
            directory,
            NetworkDiscovery::new(shell, NetworkConfig::default()),
        )
    }

    #[test]
    fn test_derive_attributes() {
        let mut map = HashMap::new();
        map.insert("aa:bb:cc:dd:ee:02".to_string(), "10.0.0.5".to_string());

        let desc = DomainDescriptor::new("web2")
            .with_description("Fedora 39")
            .with_network_mac("AA:BB:CC:DD:EE:2");
        let attrs = DomainAttributes::derive(&desc, &map);
        assert_eq!(attrs.mac, "aa:bb:cc:dd:ee:02");
        assert_eq!(attrs.ip, "10.0.0.5");
        assert_eq!(attrs.guest_os, "Fedora 39");

        let attrs = DomainAttributes::derive(&DomainDescriptor::new("bare"), &map);
        assert_eq!(attrs.mac, UNKNOWN_MAC);
        assert_eq!(attrs.ip, "");
        assert!(!attrs.has_ip());
    }

    #[tokio::test]
    async fn test_reload_joins_scan_results() {
        let directory = Arc::new(MockDirectory::new());
        directory
            .define(&DomainDescriptor::new("web1").with_network_mac("aa:bb:cc:dd:ee:01"))
            .unwrap();
        directory
            .define(&DomainDescriptor::new("web2").with_network_mac("aa:bb:cc:dd:ee:02"))
            .unwrap();
        directory.start_domain("web2").await.unwrap();

        let shell = Arc::new(ScriptedShell::new());
        shell.respond("arp-scan", true, "10.0.0.5\taa:bb:cc:dd:ee:02\n");

        let inventory = inventory(directory, shell);
        inventory.reload().await.unwrap();

        let attrs = inventory.attributes();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["web1"].ip, "");
        assert_eq!(attrs["web2"].ip, "10.0.0.5");
        assert_eq!(inventory.vm_names(), vec!["web1", "web2"]);
        assert!(matches!(
            inventory.attributes_of("web3"),
            Err(LabError::VmNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_attributes_reuses_descriptors() {
        let directory = Arc::new(MockDirectory::new());
        directory
            .define(&DomainDescriptor::new("web1").with_network_mac("aa:bb:cc:dd:ee:01"))
            .unwrap();

        let shell = Arc::new(ScriptedShell::new());
        let inventory = inventory(directory.clone(), shell.clone());
        inventory.reload().await.unwrap();
        assert_eq!(inventory.attributes()["web1"].ip, "");

        // Newly defined domains only show up after a full reload
        directory
            .define(&DomainDescriptor::new("web2").with_network_mac("aa:bb:cc:dd:ee:02"))
            .unwrap();
        shell.respond("arp-scan", true, "10.0.0.7\taa:bb:cc:dd:ee:01\n");

        inventory.reload_attributes().await.unwrap();
        assert_eq!(inventory.attributes()["web1"].ip, "10.0.0.7");
        assert!(!inventory.attributes().contains_key("web2"));

        inventory.reload().await.unwrap();
        assert!(inventory.attributes().contains_key("web2"));
    }

    #[tokio::test]
    async fn test_reader_snapshot_is_stable_across_reload() {
        let directory = Arc::new(MockDirectory::new());
        directory
            .define(&DomainDescriptor::new("web1").with_network_mac("aa:bb:cc:dd:ee:01"))
            .unwrap();
        let shell = Arc::new(ScriptedShell::new());
        let inventory = inventory(directory.clone(), shell);
        inventory.reload().await.unwrap();

        let before = inventory.attributes();
        directory
            .define(&DomainDescriptor::new("web2").with_network_mac("aa:bb:cc:dd:ee:02"))
            .unwrap();
        inventory.reload().await.unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(inventory.attributes().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_readers_see_whole_generations() {
        let directory = Arc::new(MockDirectory::new());
        for i in 1..=3 {
            directory
                .define(
                    &DomainDescriptor::new(format!("web{}", i))
                        .with_network_mac(format!("aa:bb:cc:dd:ee:0{}", i)),
                )
                .unwrap();
        }
        let scan = |generation: u32| {
            (1..=3)
                .map(|i| format!("10.{}.0.{}\taa:bb:cc:dd:ee:0{}\n", generation, i, i))
                .collect::<String>()
        };

        let shell = Arc::new(ScriptedShell::new());
        shell.respond("arp-scan", true, &scan(0));
        let inventory = Arc::new(inventory(directory, shell.clone()));
        inventory.reload().await.unwrap();

        let writer = {
            let inventory = Arc::clone(&inventory);
            tokio::spawn(async move {
                for generation in 1..=50 {
                    shell.respond("arp-scan", true, &scan(generation));
                    inventory.reload().await.unwrap();
                }
            })
        };

        let mut seen = 0;
        while !writer.is_finished() || seen == 0 {
            let attrs = inventory.attributes();
            assert_eq!(attrs.len(), 3);
            let generations: BTreeSet<&str> = attrs
                .values()
                .map(|a| a.ip.split('.').nth(1).unwrap())
                .collect();
            assert_eq!(generations.len(), 1, "mixed generations: {:?}", attrs);
            seen += 1;
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(inventory.attributes()["web1"].ip, "10.50.0.1");
    }

    #[test]
    fn test_render_table_sorts_by_status_then_name() {
        let row = |name: &str, ip: &str, status: VmStatus| TableRow {
            name: name.to_string(),
            ip: ip.to_string(),
            status,
            guest_os: "Fedora 39".to_string(),
        };
        let table = render_table(vec![
            row("web2", "10.0.0.5", VmStatus::Running),
            row("db", "", VmStatus::Stopped),
            row("api", "10.0.0.6", VmStatus::Running),
        ]);

        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], lines[2]);
        assert_eq!(lines[0], lines[6]);
        assert_eq!(lines[0].len(), 30 + 15 + 13 + 20 + 6);
        assert!(lines[1].starts_with("name "));
        assert!(lines[3].starts_with("api "));
        assert!(lines[4].starts_with("web2 "));
        assert!(lines[5].starts_with("db "));
        assert!(lines[5].contains("        stopped  "));
        assert_eq!(lines[3].len(), lines[0].len());
    }
}
