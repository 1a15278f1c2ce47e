//! Configuration for the orchestration layer.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmlab/vmlab.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Domain directory backend
    pub hypervisor: HypervisorConfig,
    /// Address scan over the lab network
    pub network: NetworkConfig,
    /// Remote sessions
    pub ssh: SshConfig,
    /// Probe, polling and settle timings
    pub timeouts: TimeoutConfig,
    /// Guest-side behaviour
    pub guest: GuestConfig,
    /// External tools
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the polling loops misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.network.interface.trim().is_empty() {
            bail!("network.interface must not be empty");
        }
        if self.timeouts.poll_interval_secs == 0 {
            bail!("timeouts.poll_interval_secs must be greater than zero");
        }
        if self.timeouts.probe_secs == 0 {
            bail!("timeouts.probe_secs must be greater than zero");
        }
        if self.ssh.command_timeout_secs == Some(0) {
            bail!("ssh.command_timeout_secs must be greater than zero when set");
        }
        Ok(())
    }
}

/// Domain directory backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Libvirt connection URI
    pub libvirt_uri: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Libvirt,
            libvirt_uri: "qemu:///system".to_string(),
        }
    }
}

/// Domain directory backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// In-memory directory for testing/development
    Mock,
    /// Libvirt/QEMU
    Libvirt,
}

impl Default for HypervisorBackend {
    fn default() -> Self {
        Self::Libvirt
    }
}

/// Lab network scanned to map MAC addresses to IPs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host interface attached to the lab network
    pub interface: String,
    /// First address of the scanned range (inclusive)
    pub lower_ip: String,
    /// Last address of the scanned range (inclusive)
    pub upper_ip: String,
    /// Address scan tool
    pub scan_command: String,
    /// Run the scan tool through sudo
    pub use_sudo: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "virbr0".to_string(),
            lower_ip: "192.168.122.2".to_string(),
            upper_ip: "192.168.122.254".to_string(),
            scan_command: "arp-scan".to_string(),
            use_sudo: true,
        }
    }
}

/// Remote session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Port used for sessions and the reachability probe
    pub port: u16,
    /// Timeout for establishing a session
    pub connect_timeout_secs: u64,
    /// Per-command timeout; commands run unbounded when unset
    pub command_timeout_secs: Option<u64>,
    /// Parent directory for control sockets; the system temp dir when unset
    pub control_dir: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout_secs: 10,
            command_timeout_secs: None,
            control_dir: None,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

/// Probe, polling and settle timings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline of each reachability probe (ping, ssh port)
    pub probe_secs: u64,
    /// Sleep between status polls
    pub poll_interval_secs: u64,
    /// How long a graceful stop may take before forcing power off
    pub stop_secs: u64,
    /// How long a start may take to reach `running`; unbounded when unset
    pub start_secs: Option<u64>,
    /// Extra settle time after a VM reports `running`
    pub start_settle_secs: u64,
    /// Settle time after a forced power off
    pub power_off_settle_secs: u64,
    /// Settle time after the pre-shutdown command
    pub pre_shutdown_settle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_secs: 5,
            poll_interval_secs: 5,
            stop_secs: 10 * 60,
            start_secs: None,
            start_settle_secs: 5,
            power_off_settle_secs: 1,
            pre_shutdown_settle_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }

    pub fn start(&self) -> Option<Duration> {
        self.start_secs.map(Duration::from_secs)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_secs(self.start_settle_secs)
    }

    pub fn power_off_settle(&self) -> Duration {
        Duration::from_secs(self.power_off_settle_secs)
    }

    pub fn pre_shutdown_settle(&self) -> Duration {
        Duration::from_secs(self.pre_shutdown_settle_secs)
    }
}

/// Guest-side behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Domain appended to the hostname set on boot
    pub hostname_domain: String,
    /// Command run as root before a graceful shutdown (e.g. stopping
    /// services that must flush state)
    pub pre_shutdown_command: Option<String>,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            hostname_domain: "mydomain".to_string(),
            pre_shutdown_command: None,
        }
    }
}

/// External tools invoked on the host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Domain cloning tool (virt-clone compatible)
    pub clone_command: String,
    /// Domain resource editing tool (virt-xml compatible)
    pub resources_command: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            clone_command: "virt-clone".to_string(),
            resources_command: "virt-xml".to_string(),
        }
    }
}
