//! Remote command execution on lab VMs.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{LabError, Result};
use crate::inventory::DomainInventory;
use crate::session::{SessionManager, SessionTarget};
use crate::shell::{OutputCollector, ShellResult};

/// Per-call options for [`RemoteExecutor::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Password for a session that is not open yet
    pub password: Option<String>,
    /// Do not warn when the command fails
    pub no_warn: bool,
}

impl RunOptions {
    pub fn quiet() -> Self {
        Self {
            no_warn: true,
            ..Self::default()
        }
    }
}

/// Runs commands over cached sessions and collects their output.
pub struct RemoteExecutor {
    inventory: Arc<DomainInventory>,
    sessions: SessionManager,
    command_timeout: Option<Duration>,
}

impl RemoteExecutor {
    pub fn new(
        inventory: Arc<DomainInventory>,
        sessions: SessionManager,
        command_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inventory,
            sessions,
            command_timeout,
        }
    }

    /// Run `command` on `vm` as `user`.
    ///
    /// A non-zero exit is reported through [`ShellResult::success`]. Errors
    /// mean the command never ran: unknown VM, no address, session failure or
    /// timeout.
    pub async fn run(
        &self,
        vm: &str,
        user: &str,
        command: &str,
        options: &RunOptions,
    ) -> Result<ShellResult> {
        let attributes = self.inventory.attributes_of(vm)?;
        if !attributes.has_ip() {
            return Err(LabError::NoIpAddress(vm.to_string()));
        }

        let target = SessionTarget::new(vm, user, &attributes.ip)
            .with_password(options.password.clone());
        let session = self.sessions.session(&target).await?;

        info!(vm = %vm, "sh@{}$ {}", user, command);
        let mut collector = OutputCollector::new(vm);

        let exit_code = {
            let mut session = session.lock().await;
            let mut sink = |stream, data: &[u8]| collector.feed(stream, data);
            let exec = session.exec(command, &mut sink);

            match self.command_timeout {
                Some(limit) => match tokio::time::timeout(limit, exec).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                },
                None => Some(exec.await),
            }
        };

        let exit_code = match exit_code {
            Some(result) => result?,
            None => {
                // The session is mid-command; it cannot be reused
                self.sessions.discard(vm, user).await;
                let secs = self.command_timeout.map(|d| d.as_secs()).unwrap_or_default();
                warn!(vm = %vm, secs, "'{}' timed out", command);
                return Err(LabError::CommandTimedOut {
                    command: command.to_string(),
                    secs,
                });
            }
        };

        let result = collector.finish(exit_code);
        if !result.success && !options.no_warn {
            warn!(vm = %vm, exit_code = ?exit_code, "'{}' failed", command);
        }
        Ok(result)
    }

    /// Like [`RemoteExecutor::run`] but a non-zero exit is a
    /// [`LabError::CommandFailed`].
    pub async fn run_strict(
        &self,
        vm: &str,
        user: &str,
        command: &str,
        options: &RunOptions,
    ) -> Result<ShellResult> {
        let result = self.run(vm, user, command, options).await?;
        if !result.success {
            return Err(LabError::CommandFailed {
                command: command.to_string(),
            });
        }
        Ok(result)
    }

    /// Close every session of `vm`.
    pub async fn close_sessions(&self, vm: &str) {
        self.sessions.close_vm(vm).await;
    }

    /// Close every session of every VM.
    pub async fn close_all(&self) {
        self.sessions.close_all().await;
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }
}
