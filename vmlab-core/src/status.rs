//! Reachability status of a VM.
//!
//! The hypervisor only knows whether a domain is running. Whether the guest
//! is actually usable is decided by two network probes: an ICMP ping and a
//! TCP connect to the SSH port.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use vmlab_hypervisor::{DomainDirectory, DomainState};

use crate::error::{LabError, Result};
use crate::inventory::DomainInventory;
use crate::shell::{quote, HostShell};

/// Reachability state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Stopped,
    NoConnection,
    NoSshRunning,
    Running,
    Unknown,
}

impl VmStatus {
    /// Combine the three signals into a status.
    pub fn classify(box_running: bool, ping_ok: bool, ssh_ok: bool) -> Self {
        match (box_running, ping_ok, ssh_ok) {
            (false, false, false) => VmStatus::Stopped,
            (true, false, false) => VmStatus::NoConnection,
            (true, true, false) => VmStatus::NoSshRunning,
            (true, true, true) => VmStatus::Running,
            _ => VmStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Stopped => "stopped",
            VmStatus::NoConnection => "no_connection",
            VmStatus::NoSshRunning => "no_ssh_running",
            VmStatus::Running => "running",
            VmStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(VmStatus::Stopped),
            "no_connection" => Ok(VmStatus::NoConnection),
            "no_ssh_running" => Ok(VmStatus::NoSshRunning),
            "running" => Ok(VmStatus::Running),
            "unknown" => Ok(VmStatus::Unknown),
            other => Err(LabError::ArgumentError(format!("unknown status: {}", other))),
        }
    }
}

/// Network-level probes of a guest address.
///
/// Probes never fail: timeouts, refusals and tool errors all read as `false`.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn ping(&self, ip: &str) -> bool;
    async fn ssh_port_open(&self, ip: &str) -> bool;
}

/// Probes through the host's `ping` and a direct TCP connect.
pub struct NetworkProbe {
    shell: Arc<dyn HostShell>,
    ssh_port: u16,
    deadline: Duration,
}

impl NetworkProbe {
    pub fn new(shell: Arc<dyn HostShell>, ssh_port: u16, deadline: Duration) -> Self {
        Self {
            shell,
            ssh_port,
            deadline,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for NetworkProbe {
    async fn ping(&self, ip: &str) -> bool {
        let command = format!("ping -c 1 -W {} {}", self.deadline.as_secs().max(1), quote(ip));
        match self.shell.run(&command).await {
            Ok(result) => result.success,
            Err(e) => {
                debug!(ip = %ip, error = %e, "Ping could not be run");
                false
            }
        }
    }

    async fn ssh_port_open(&self, ip: &str) -> bool {
        match timeout(self.deadline, TcpStream::connect((ip, self.ssh_port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(ip = %ip, port = self.ssh_port, error = %e, "SSH port closed");
                false
            }
            Err(_) => {
                debug!(ip = %ip, port = self.ssh_port, "SSH port probe timed out");
                false
            }
        }
    }
}

/// Computes and waits for VM statuses.
pub struct StatusOracle {
    directory: Arc<dyn DomainDirectory>,
    inventory: Arc<DomainInventory>,
    probe: Arc<dyn ReachabilityProbe>,
    poll_interval: Duration,
}

impl StatusOracle {
    pub fn new(
        directory: Arc<dyn DomainDirectory>,
        inventory: Arc<DomainInventory>,
        probe: Arc<dyn ReachabilityProbe>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            directory,
            inventory,
            probe,
            poll_interval,
        }
    }

    /// Current status of `vm`, from its domain state and the cached address.
    pub async fn status(&self, vm: &str) -> Result<VmStatus> {
        let attributes = self.inventory.attributes_of(vm)?;
        let box_running = self.directory.domain_state(vm).await? == DomainState::Running;

        let (ping_ok, ssh_ok) = if attributes.has_ip() {
            tokio::join!(
                self.probe.ping(&attributes.ip),
                self.probe.ssh_port_open(&attributes.ip)
            )
        } else {
            (false, false)
        };

        let status = VmStatus::classify(box_running, ping_ok, ssh_ok);
        debug!(vm = %vm, box_running, ping_ok, ssh_ok, status = %status, "Status computed");
        Ok(status)
    }

    /// Poll until `vm` reaches `target`, using the configured interval.
    ///
    /// Returns `false` once `timeout` has elapsed; without a timeout this only
    /// returns when the target is reached.
    pub async fn wait_for(
        &self,
        vm: &str,
        target: VmStatus,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.wait_for_with_interval(vm, target, timeout, self.poll_interval)
            .await
    }

    /// [`StatusOracle::wait_for`] with an explicit poll interval.
    pub async fn wait_for_with_interval(
        &self,
        vm: &str,
        target: VmStatus,
        timeout: Option<Duration>,
        interval: Duration,
    ) -> Result<bool> {
        let started = Instant::now();

        loop {
            self.inventory.reload_attributes().await?;
            let current = self.status(vm).await?;
            if current == target {
                info!(vm = %vm, status = %current, "Status reached");
                return Ok(true);
            }

            info!(vm = %vm, "Waiting for: {}, now is: {}", target, current);
            if let Some(limit) = timeout {
                if started.elapsed() > limit {
                    warn!(vm = %vm, target = %target, "Timeout expired");
                    return Ok(false);
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::discovery::NetworkDiscovery;
    use crate::mock::{MockProbe, ScriptedShell};
    use vmlab_hypervisor::{DomainDescriptor, MockDirectory};

    #[test]
    fn test_classification_table() {
        use VmStatus::*;
        let cases = [
            ((false, false, false), Stopped),
            ((true, false, false), NoConnection),
            ((true, true, false), NoSshRunning),
            ((true, true, true), Running),
            ((false, true, false), Unknown),
            ((false, false, true), Unknown),
            ((false, true, true), Unknown),
            ((true, false, true), Unknown),
        ];
        for ((box_running, ping, ssh), expected) in cases {
            assert_eq!(
                VmStatus::classify(box_running, ping, ssh),
                expected,
                "classify({}, {}, {})",
                box_running,
                ping,
                ssh
            );
        }
    }

    #[test]
    fn test_status_strings() {
        for status in [
            VmStatus::Stopped,
            VmStatus::NoConnection,
            VmStatus::NoSshRunning,
            VmStatus::Running,
            VmStatus::Unknown,
        ] {
            assert_eq!(status.to_string().parse::<VmStatus>().unwrap(), status);
        }
        assert!("booting".parse::<VmStatus>().is_err());
    }

    #[tokio::test]
    async fn test_ping_uses_host_shell() {
        let shell = Arc::new(ScriptedShell::new());
        shell.respond("ping -c 1 -W 5 10.0.0.5", true, "");
        let probe = NetworkProbe::new(shell.clone(), 22, Duration::from_secs(5));

        assert!(probe.ping("10.0.0.5").await);
        assert!(!probe.ping("10.0.0.6").await);
    }

    #[tokio::test]
    async fn test_ssh_probe_closed_port_is_false() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = NetworkProbe::new(
            Arc::new(ScriptedShell::new()),
            port,
            Duration::from_secs(1),
        );
        assert!(probe.ssh_port_open("127.0.0.1").await);

        drop(listener);
        assert!(!probe.ssh_port_open("127.0.0.1").await);
    }

    async fn oracle() -> (Arc<MockDirectory>, Arc<MockProbe>, StatusOracle) {
        let directory = Arc::new(MockDirectory::new());
        directory
            .define(&DomainDescriptor::new("web1").with_network_mac("aa:bb:cc:dd:ee:01"))
            .unwrap();
        directory
            .define(&DomainDescriptor::new("bare"))
            .unwrap();

        let shell = Arc::new(ScriptedShell::new());
        shell.respond("arp-scan", true, "10.0.0.5\taa:bb:cc:dd:ee:01\n");
        let inventory = Arc::new(DomainInventory::new(
            directory.clone(),
            NetworkDiscovery::new(shell, NetworkConfig::default()),
        ));
        inventory.reload().await.unwrap();

        let probe = Arc::new(MockProbe::new(directory.clone()));
        probe.bind("10.0.0.5", "web1");

        let oracle = StatusOracle::new(
            directory.clone(),
            inventory,
            probe.clone(),
            Duration::from_millis(10),
        );
        (directory, probe, oracle)
    }

    #[tokio::test]
    async fn test_status_follows_signals() {
        let (directory, probe, oracle) = oracle().await;
        assert_eq!(oracle.status("web1").await.unwrap(), VmStatus::Stopped);

        directory.start_domain("web1").await.unwrap();
        assert_eq!(oracle.status("web1").await.unwrap(), VmStatus::Running);

        probe.set_ssh_down("web1", true);
        assert_eq!(oracle.status("web1").await.unwrap(), VmStatus::NoSshRunning);

        // No address: probes are skipped
        directory.start_domain("bare").await.unwrap();
        assert_eq!(oracle.status("bare").await.unwrap(), VmStatus::NoConnection);

        assert!(matches!(
            oracle.status("ghost").await,
            Err(LabError::VmNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_reached() {
        let (directory, _probe, oracle) = oracle().await;
        directory.start_domain("web1").await.unwrap();
        assert!(oracle
            .wait_for("web1", VmStatus::Running, Some(Duration::from_secs(1)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let (_directory, _probe, oracle) = oracle().await;
        let started = Instant::now();
        let reached = oracle
            .wait_for_with_interval(
                "web1",
                VmStatus::Running,
                Some(Duration::from_secs(1)),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(!reached);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
