//! Per-VM operations: power transitions, cloning, hostname and resources.

use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{LabError, Result};
use crate::executor::RunOptions;
use crate::inventory::DomainAttributes;
use crate::lab::Lab;
use crate::shell::{quote, ShellResult};
use crate::snapshot::SnapshotManager;
use crate::status::VmStatus;

/// Longest hostname label handed to a guest.
const SAFE_NAME_MAX: usize = 28;

/// A named domain in the lab.
#[derive(Clone)]
pub struct Vm {
    name: String,
    lab: Lab,
}

impl Vm {
    pub(crate) fn new(name: &str, lab: Lab) -> Self {
        Self {
            name: name.to_string(),
            lab,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lab(&self) -> &Lab {
        &self.lab
    }

    /// Name usable as a hostname label: characters outside `[-a-zA-Z0-9.]`
    /// become `-`, at most 28 characters, one trailing `-` dropped.
    pub fn safe_name(&self) -> String {
        let mut safe: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .take(SAFE_NAME_MAX)
            .collect();
        if safe.ends_with('-') {
            safe.pop();
        }
        safe
    }

    pub fn attributes(&self) -> Result<DomainAttributes> {
        self.lab.inventory().attributes_of(&self.name)
    }

    /// Current address; empty when the VM did not answer the last scan.
    pub fn ip(&self) -> Result<String> {
        Ok(self.attributes()?.ip)
    }

    pub fn mac(&self) -> Result<String> {
        Ok(self.attributes()?.mac)
    }

    pub fn guest_os(&self) -> Result<String> {
        Ok(self.attributes()?.guest_os)
    }

    pub fn is_fedora(&self) -> bool {
        self.guest_os()
            .map(|os| os.contains("Fedora"))
            .unwrap_or(false)
    }

    pub fn is_rhel(&self) -> bool {
        self.guest_os()
            .map(|os| os.contains("Red Hat"))
            .unwrap_or(false)
    }

    pub async fn status(&self) -> Result<VmStatus> {
        self.lab.oracle().status(&self.name).await
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.status().await? == VmStatus::Running)
    }

    /// Poll until the VM reaches `target`; `false` on timeout.
    pub async fn wait_for(&self, target: VmStatus, timeout: Option<Duration>) -> Result<bool> {
        self.lab.oracle().wait_for(&self.name, target, timeout).await
    }

    pub async fn run(&self, user: &str, command: &str, options: &RunOptions) -> Result<ShellResult> {
        self.lab
            .executor()
            .run(&self.name, user, command, options)
            .await
    }

    pub async fn run_strict(
        &self,
        user: &str,
        command: &str,
        options: &RunOptions,
    ) -> Result<ShellResult> {
        self.lab
            .executor()
            .run_strict(&self.name, user, command, options)
            .await
    }

    pub async fn close_sessions(&self) {
        self.lab.executor().close_sessions(&self.name).await;
    }

    pub fn snapshots(&self) -> SnapshotManager<'_> {
        SnapshotManager::new(self)
    }

    async fn domain_active(&self) -> Result<bool> {
        Ok(self
            .lab
            .directory()
            .domain_state(&self.name)
            .await?
            .is_active())
    }

    /// Clone this VM with the external clone tool and take `snapshot` on the
    /// new VM.
    pub async fn clone_vm(&self, new_name: &str, snapshot: &str) -> Result<Vm> {
        let config = self.lab.config();
        let command = format!(
            "{} --connect={} --original={} --name={} --auto-clone",
            config.tools.clone_command,
            quote(self.lab.directory().uri()),
            quote(&self.name),
            quote(new_name),
        );
        info!(vm = %self.name, clone = %new_name, "Cloning");
        self.lab.shell().run_strict(&command).await?;

        self.lab.reload().await?;
        let cloned = self.lab.vm(new_name)?;
        cloned.snapshots().take(snapshot).await?;
        Ok(cloned)
    }

    /// Power off if needed, undefine, reload the inventory.
    pub async fn delete(&self) -> Result<()> {
        if self.domain_active().await? {
            self.power_off().await?;
        }
        self.close_sessions().await;
        self.lab.directory().undefine_domain(&self.name).await?;
        info!(vm = %self.name, "Deleted");
        self.lab.reload().await
    }

    /// Start the domain unless already running and wait until it is reachable.
    pub async fn run_and_wait(&self) -> Result<()> {
        let timeouts = &self.lab.config().timeouts;

        if !self.domain_active().await? {
            info!(vm = %self.name, "Starting");
            self.lab.directory().start_domain(&self.name).await?;
        }

        if !self.wait_for(VmStatus::Running, timeouts.start()).await? {
            return Err(LabError::InvalidState(format!(
                "{} did not reach running",
                self.name
            )));
        }

        if let Err(e) = self.set_hostname().await {
            warn!(
                vm = %self.name,
                kind = e.kind(),
                detail = ?e,
                "hostname setting failed: {}",
                e
            );
        }

        tokio::time::sleep(timeouts.start_settle()).await;
        Ok(())
    }

    /// Graceful shutdown, escalating to a forced power off after the stop
    /// timeout.
    pub async fn stop_and_wait(&self) -> Result<()> {
        let timeouts = &self.lab.config().timeouts;

        self.stop().await?;
        if !self.wait_for(VmStatus::Stopped, Some(timeouts.stop())).await? {
            warn!(vm = %self.name, "Graceful stop timed out, powering off");
            self.power_off().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let status = self.status().await?;
        if status == VmStatus::Stopped {
            return Ok(());
        }

        let config = self.lab.config();
        if status == VmStatus::Running {
            if let Some(command) = &config.guest.pre_shutdown_command {
                match self.run("root", command, &RunOptions::default()).await {
                    Ok(_) => tokio::time::sleep(config.timeouts.pre_shutdown_settle()).await,
                    Err(e) => warn!(vm = %self.name, error = %e, "Pre-shutdown command failed"),
                }
            }
        }

        self.close_sessions().await;
        if self.domain_active().await? {
            info!(vm = %self.name, "Shutting down");
            self.lab.directory().shutdown_domain(&self.name).await?;
        }
        Ok(())
    }

    /// Forced power off.
    pub async fn power_off(&self) -> Result<()> {
        self.close_sessions().await;
        if self.domain_active().await? {
            info!(vm = %self.name, "Powering off");
            self.lab.directory().destroy_domain(&self.name).await?;
        }
        tokio::time::sleep(self.lab.config().timeouts.power_off_settle()).await;
        Ok(())
    }

    /// Set the guest hostname to `<safe_name>.<domain>` and make it resolve
    /// locally.
    pub async fn set_hostname(&self) -> Result<()> {
        let status = self.status().await?;
        if status != VmStatus::Running {
            return Err(LabError::InvalidState(format!(
                "{} is {}, not running",
                self.name, status
            )));
        }

        let safe = self.safe_name();
        let fqdn = format!("{}.{}", safe, self.lab.config().guest.hostname_domain);
        let options = RunOptions::default();

        let steps = [
            format!("hostname {}", quote(&fqdn)),
            format!("echo 127.0.0.1 {} {} >> /etc/hosts", quote(&safe), quote(&fqdn)),
        ];
        // A failing step does not stop the next one; only session errors do
        for command in &steps {
            if !self.run("root", command, &options).await?.success {
                warn!(vm = %self.name, command = %command, "Hostname step failed");
            }
        }
        Ok(())
    }

    /// Command line for an interactive login, optionally tunnelling port 443
    /// (which needs root on the host).
    pub fn connect_command(&self, user: &str, tunnel: bool) -> Result<Vec<String>> {
        let ip = self.ip()?;
        if ip.is_empty() {
            return Err(LabError::NoIpAddress(self.name.clone()));
        }

        let mut argv = Vec::new();
        if tunnel {
            argv.push("sudo".to_string());
        }
        argv.push("ssh".to_string());
        argv.push(format!("{}@{}", user, ip));

        let port = self.lab.config().ssh.port;
        if port != 22 {
            argv.extend(["-p".to_string(), port.to_string()]);
        }
        if tunnel {
            argv.extend(["-L".to_string(), "443:localhost:443".to_string()]);
        }
        argv.extend(
            [
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "StrictHostKeyChecking=no",
            ]
            .map(String::from),
        );
        Ok(argv)
    }

    /// Change memory and CPU count. The VM must not be running.
    pub async fn setup_resources(&self, ram_mib: u64, cpus: u32) -> Result<()> {
        if self.domain_active().await? {
            return Err(LabError::InvalidState(format!(
                "{} must be stopped to change resources",
                self.name
            )));
        }

        let command = format!(
            "{} {} --connect {} --edit --vcpus {} --memory {}",
            self.lab.config().tools.resources_command,
            quote(&self.name),
            quote(self.lab.directory().uri()),
            cpus,
            ram_mib,
        );
        self.lab.shell().run_strict(&command).await?;
        info!(vm = %self.name, ram_mib, cpus, "Resources updated");
        Ok(())
    }
}

impl fmt::Display for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (ip, mac) = match self.attributes() {
            Ok(attrs) => (attrs.ip, attrs.mac),
            Err(_) => (String::new(), String::new()),
        };
        write!(f, "#<VM {} ip:{:?} mac:{:?}>", self.name, ip, mac)
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm").field("name", &self.name).finish()
    }
}
