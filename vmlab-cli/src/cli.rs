//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use vmlab_core::config::{Config, HypervisorBackend};

/// vmlab - disposable test VM orchestration
#[derive(Parser, Debug)]
#[command(name = "vmlab")]
#[command(about = "vmlab - inventory, status, remote commands and snapshots for test VMs")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Enable development mode (mock directory, scripted network)
    #[arg(long, global = true)]
    pub dev: bool,

    /// Libvirt connection URI (e.g., qemu:///system)
    #[arg(long, global = true)]
    pub libvirt_uri: Option<String>,

    /// Lab network interface to scan
    #[arg(long, global = true)]
    pub interface: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(ref uri) = self.libvirt_uri {
            config.hypervisor.libvirt_uri = uri.clone();
        }

        if let Some(ref interface) = self.interface {
            config.network.interface = interface.clone();
        }

        if self.dev {
            config.hypervisor.backend = HypervisorBackend::Mock;
        }

        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show every VM with its address and status
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the status of a VM
    Status { vm: String },

    /// Start a VM and wait until it is reachable
    Start { vm: String },

    /// Shut a VM down gracefully, forcing power off after the stop timeout
    Stop { vm: String },

    /// Power a VM off immediately
    PowerOff { vm: String },

    /// Clone a VM and snapshot the clone
    Clone {
        source: String,
        name: String,
        /// Name of the initial snapshot on the clone
        #[arg(long, default_value = "base")]
        snapshot: String,
    },

    /// Delete a VM
    Delete { vm: String },

    /// Run a command on a VM
    Exec {
        vm: String,
        /// Command line to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
        #[arg(short, long, default_value = "root")]
        user: String,
        /// Password for the first connection
        #[arg(long, env = "VMLAB_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Start a VM and open an interactive ssh session
    Connect {
        vm: String,
        #[arg(short, long, default_value = "root")]
        user: String,
        /// Forward local port 443 to the VM
        #[arg(long)]
        tunnel: bool,
    },

    /// Change memory and CPU count of a stopped VM
    Resources {
        vm: String,
        /// Memory in MiB
        #[arg(long)]
        ram: u64,
        #[arg(long)]
        cpus: u32,
    },

    /// Manage snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Wait until a VM reaches a status
    Wait {
        vm: String,
        /// stopped, no_connection, no_ssh_running, running or unknown
        status: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotAction {
    /// Stop the VM and take a snapshot
    Take { vm: String, name: String },
    /// Revert to a snapshot, deleting every later one
    Restore { vm: String, name: String },
    /// Revert to the newest snapshot
    RestoreLast { vm: String },
    /// Delete a snapshot
    Delete { vm: String, name: String },
    /// List snapshots, oldest first
    List { vm: String },
    /// Show the current snapshot and its parent
    Current { vm: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec() {
        let args = Args::parse_from([
            "vmlab", "exec", "web1", "--user", "admin", "systemctl", "status", "sshd",
        ]);
        match args.command {
            Command::Exec {
                vm, command, user, ..
            } => {
                assert_eq!(vm, "web1");
                assert_eq!(user, "admin");
                assert_eq!(command, vec!["systemctl", "status", "sshd"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "vmlab",
            "--dev",
            "--interface",
            "br-lab",
            "snapshot",
            "restore-last",
            "web1",
        ]);
        let config = args.apply_overrides(Config::default());
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.network.interface, "br-lab");
        assert!(matches!(
            args.command,
            Command::Snapshot {
                action: SnapshotAction::RestoreLast { .. }
            }
        ));
    }
}
