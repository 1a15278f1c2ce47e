//! In-process fakes for the host shell, remote sessions and reachability
//! probes.
//!
//! Together with [`vmlab_hypervisor::MockDirectory`] these let a whole
//! [`Lab`](crate::Lab) run without hypervisor, network or SSH access, both in
//! tests and with `vmlab --dev`.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;
use vmlab_hypervisor::{DomainDirectory, DomainState, MockDirectory};

use crate::error::{LabError, Result};
use crate::session::{OutputSink, RemoteSession, SessionConnector, SessionTarget};
use crate::shell::{HostShell, OutputStream, ShellResult};
use crate::status::ReachabilityProbe;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host shell answering from a table of canned results.
///
/// A command gets the result of the most recently registered fragment it
/// contains; commands matching nothing fail with empty output.
#[derive(Default)]
pub struct ScriptedShell {
    responses: Mutex<Vec<(String, ShellResult)>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `fragment`.
    pub fn respond(&self, fragment: &str, success: bool, stdout: &str) {
        lock(&self.responses).push((
            fragment.to_string(),
            ShellResult {
                success,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        ));
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

#[async_trait]
impl HostShell for ScriptedShell {
    async fn run(&self, command: &str) -> Result<ShellResult> {
        info!("sh@host$ {}", command);
        lock(&self.commands).push(command.to_string());

        let responses = lock(&self.responses);
        let result = responses
            .iter()
            .rev()
            .find(|(fragment, _)| command.contains(fragment.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or(ShellResult {
                success: false,
                stdout: String::new(),
                stderr: format!("no scripted response for: {}", command),
            });
        Ok(result)
    }
}

/// A command seen by a [`MockConnector`] session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub vm: String,
    pub user: String,
    pub command: String,
}

#[derive(Clone)]
struct ScriptedExec {
    fragment: String,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

#[derive(Default)]
struct ConnectorState {
    script: Vec<ScriptedExec>,
    commands: Vec<RecordedCommand>,
    opened: usize,
    closed: usize,
    refuse_connections: bool,
    exec_delay: Option<Duration>,
    connect_delays: HashMap<String, Duration>,
}

/// Session connector whose sessions answer from a script.
///
/// Commands matching nothing succeed with empty output.
#[derive(Default, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `fragment`. The output is delivered in
    /// small chunks to exercise line reassembly.
    pub fn respond(&self, fragment: &str, exit_code: Option<i32>, stdout: &str, stderr: &str) {
        lock(&self.state).script.push(ScriptedExec {
            fragment: fragment.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse_connections = refuse;
    }

    /// Make every command take `delay` before it finishes.
    pub fn set_exec_delay(&self, delay: Option<Duration>) {
        lock(&self.state).exec_delay = delay;
    }

    /// Make connecting to `vm` take `delay`.
    pub fn set_connect_delay(&self, vm: &str, delay: Option<Duration>) {
        let mut state = lock(&self.state);
        match delay {
            Some(delay) => state.connect_delays.insert(vm.to_string(), delay),
            None => state.connect_delays.remove(vm),
        };
    }

    /// Commands run on `vm`, in order.
    pub fn commands_for(&self, vm: &str) -> Vec<String> {
        lock(&self.state)
            .commands
            .iter()
            .filter(|c| c.vm == vm)
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn opened(&self) -> usize {
        lock(&self.state).opened
    }

    pub fn closed(&self) -> usize {
        lock(&self.state).closed
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        let delay = lock(&self.state).connect_delays.get(&target.vm).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.refuse_connections {
            return Err(LabError::Session(format!(
                "connection to {}@{} refused",
                target.user, target.host
            )));
        }
        state.opened += 1;

        Ok(Box::new(MockSession {
            vm: target.vm.clone(),
            user: target.user.clone(),
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

struct MockSession {
    vm: String,
    user: String,
    state: Arc<Mutex<ConnectorState>>,
    open: bool,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&mut self, command: &str, sink: OutputSink<'_>) -> Result<Option<i32>> {
        if !self.open {
            return Err(LabError::Session(format!("session to {} is closed", self.vm)));
        }

        let (exec, delay) = {
            let mut state = lock(&self.state);
            state.commands.push(RecordedCommand {
                vm: self.vm.clone(),
                user: self.user.clone(),
                command: command.to_string(),
            });
            let exec = state
                .script
                .iter()
                .rev()
                .find(|s| command.contains(s.fragment.as_str()))
                .cloned();
            (exec, state.exec_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let Some(exec) = exec else {
            return Ok(Some(0));
        };
        for chunk in exec.stdout.as_bytes().chunks(3) {
            sink(OutputStream::Stdout, chunk);
        }
        for chunk in exec.stderr.as_bytes().chunks(3) {
            sink(OutputStream::Stderr, chunk);
        }
        Ok(exec.exit_code)
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            lock(&self.state).closed += 1;
        }
        Ok(())
    }
}

/// Reachability probe that follows [`MockDirectory`] domain states.
///
/// Addresses are bound to domains with [`MockProbe::bind`]. A bound address
/// answers pings while its domain is running, and its SSH port is open
/// unless marked down with [`MockProbe::set_ssh_down`]. Unbound addresses
/// never answer.
pub struct MockProbe {
    directory: Arc<MockDirectory>,
    hosts: Mutex<HashMap<String, String>>,
    ssh_down: Mutex<HashSet<String>>,
}

impl MockProbe {
    pub fn new(directory: Arc<MockDirectory>) -> Self {
        Self {
            directory,
            hosts: Mutex::new(HashMap::new()),
            ssh_down: Mutex::new(HashSet::new()),
        }
    }

    /// Bind `ip` to domain `vm`.
    pub fn bind(&self, ip: &str, vm: &str) {
        lock(&self.hosts).insert(ip.to_string(), vm.to_string());
    }

    pub fn set_ssh_down(&self, vm: &str, down: bool) {
        let mut ssh_down = lock(&self.ssh_down);
        if down {
            ssh_down.insert(vm.to_string());
        } else {
            ssh_down.remove(vm);
        }
    }

    async fn running_domain(&self, ip: &str) -> Option<String> {
        let vm = lock(&self.hosts).get(ip).cloned()?;
        match self.directory.domain_state(&vm).await {
            Ok(DomainState::Running) => Some(vm),
            _ => None,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for MockProbe {
    async fn ping(&self, ip: &str) -> bool {
        self.running_domain(ip).await.is_some()
    }

    async fn ssh_port_open(&self, ip: &str) -> bool {
        match self.running_domain(ip).await {
            Some(vm) => !lock(&self.ssh_down).contains(&vm),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmlab_hypervisor::DomainDescriptor;

    #[tokio::test]
    async fn test_scripted_shell_latest_match_wins() {
        let shell = ScriptedShell::new();
        shell.respond("ping", false, "");
        shell.respond("ping -c 1", true, "pong");

        let result = shell.run("ping -c 1 -W 5 10.0.0.5").await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "pong");

        assert!(!shell.run("uptime").await.unwrap().success);
        assert_eq!(shell.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_probe_follows_domain_state() {
        let directory = Arc::new(MockDirectory::new());
        directory.define(&DomainDescriptor::new("web1")).unwrap();
        let probe = MockProbe::new(directory.clone());
        probe.bind("10.0.0.5", "web1");

        assert!(!probe.ping("10.0.0.5").await);

        directory.start_domain("web1").await.unwrap();
        assert!(probe.ping("10.0.0.5").await);
        assert!(probe.ssh_port_open("10.0.0.5").await);

        probe.set_ssh_down("web1", true);
        assert!(!probe.ssh_port_open("10.0.0.5").await);
        assert!(!probe.ping("10.0.0.9").await);
    }
}
