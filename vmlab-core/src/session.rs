//! Persistent remote sessions, one per (VM, user).
//!
//! The [`SessionManager`] is the only place sessions live. It is injected into
//! the executor, so tests can swap the OpenSSH connector for a fake and
//! several labs in one process never share connections.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SshConfig;
use crate::error::{LabError, Result};
use crate::shell::{pump_output, OutputStream};

/// Receives output chunks as a remote command produces them.
pub type OutputSink<'a> = &'a mut (dyn FnMut(OutputStream, &[u8]) + Send);

/// Where and as whom to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub vm: String,
    pub user: String,
    pub host: String,
    pub password: Option<String>,
}

impl SessionTarget {
    pub fn new(vm: impl Into<String>, user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            vm: vm.into(),
            user: user.into(),
            host: host.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    fn key(&self) -> SessionKey {
        SessionKey {
            vm: self.vm.clone(),
            user: self.user.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    vm: String,
    user: String,
}

/// An open connection that can run commands one after another.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run `command`, streaming its output into `sink`, and return the exit
    /// code (`None` when the remote side reported no status).
    ///
    /// An error means the command could not be started at all.
    async fn exec(&mut self, command: &str, sink: OutputSink<'_>) -> Result<Option<i32>>;

    /// Tear the connection down. Closing twice is not an error.
    async fn close(&mut self) -> Result<()>;
}

/// Opens new sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>>;
}

/// Shared handle to a cached session. Holding the lock serializes commands.
pub type SharedSession = Arc<Mutex<Box<dyn RemoteSession>>>;

/// Cache of open sessions keyed by (VM, user).
pub struct SessionManager {
    connector: Arc<dyn SessionConnector>,
    sessions: Mutex<HashMap<SessionKey, SharedSession>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for `target`, opening one on first use.
    pub async fn session(&self, target: &SessionTarget) -> Result<SharedSession> {
        let key = target.key();
        if let Some(session) = self.sessions.lock().await.get(&key) {
            return Ok(Arc::clone(session));
        }

        // Connect without the map lock so other VMs are not held up
        info!(vm = %target.vm, user = %target.user, host = %target.host, "Opening session");
        let mut opened = self.connector.connect(target).await?;

        let existing = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&key) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let session: SharedSession = Arc::new(Mutex::new(opened));
                    sessions.insert(key, Arc::clone(&session));
                    return Ok(session);
                }
            }
        };

        // Another task opened the same session first
        debug!(vm = %target.vm, user = %target.user, "Dropping duplicate session");
        if let Err(e) = opened.close().await {
            warn!(vm = %target.vm, user = %target.user, error = %e, "Failed to close session");
        }
        Ok(existing)
    }

    /// Close and forget the session of one (VM, user) pair, if any.
    pub async fn discard(&self, vm: &str, user: &str) {
        let key = SessionKey {
            vm: vm.to_string(),
            user: user.to_string(),
        };
        let removed = self.sessions.lock().await.remove(&key);
        if let Some(session) = removed {
            close_logged(&key, session).await;
        }
    }

    /// Close every session of `vm`.
    pub async fn close_vm(&self, vm: &str) {
        let removed: Vec<(SessionKey, SharedSession)> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<SessionKey> = sessions.keys().filter(|k| k.vm == vm).cloned().collect();
            keys.into_iter()
                .filter_map(|k| sessions.remove(&k).map(|s| (k, s)))
                .collect()
        };

        for (key, session) in removed {
            close_logged(&key, session).await;
        }
    }

    /// Close every session.
    pub async fn close_all(&self) {
        let removed: Vec<(SessionKey, SharedSession)> =
            self.sessions.lock().await.drain().collect();

        for (key, session) in removed {
            close_logged(&key, session).await;
        }
    }

    /// Number of cached sessions.
    pub async fn open_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

async fn close_logged(key: &SessionKey, session: SharedSession) {
    debug!(vm = %key.vm, user = %key.user, "Closing session");
    if let Err(e) = session.lock().await.close().await {
        warn!(vm = %key.vm, user = %key.user, error = %e, "Failed to close session");
    }
}

/// Opens OpenSSH ControlMaster sessions.
#[derive(Debug, Clone)]
pub struct OpensshConnector {
    port: u16,
    connect_timeout: Duration,
    control_dir: Option<PathBuf>,
}

impl OpensshConnector {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            port: config.port,
            connect_timeout: config.connect_timeout(),
            control_dir: config.control_dir.clone(),
        }
    }
}

#[async_trait]
impl SessionConnector for OpensshConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        let session = OpensshSession::open(
            target,
            self.port,
            self.connect_timeout,
            self.control_dir.as_deref(),
        )
        .await?;
        Ok(Box::new(session))
    }
}

/// Command line pieces shared by the master and every multiplexed client.
#[derive(Debug, Clone)]
struct SshArgs {
    destination: String,
    port: u16,
    password: Option<String>,
    control_path: PathBuf,
}

impl SshArgs {
    fn command(&self) -> Command {
        let mut command = match &self.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg("ssh").env("SSHPASS", password);
                command
            }
            None => {
                let mut command = Command::new("ssh");
                command.args(["-o", "BatchMode=yes"]);
                command
            }
        };

        command
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-p", &self.port.to_string()])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Send a control request (`check`, `exit`) to the master.
    async fn control(&self, request: &str) -> bool {
        self.command()
            .args(["-O", request])
            .arg(&self.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// A master connection and the control socket that multiplexes commands
/// over it.
pub struct OpensshSession {
    args: SshArgs,
    master: Option<Child>,
    // Owns the socket directory; removed on drop
    _control_dir: TempDir,
}

impl OpensshSession {
    async fn open(
        target: &SessionTarget,
        port: u16,
        connect_timeout: Duration,
        control_dir: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("vmlab-ssh-");
        let dir = match control_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };

        let args = SshArgs {
            destination: format!("{}@{}", target.user, target.host),
            port,
            password: target.password.clone(),
            control_path: dir.path().join("control"),
        };
        let master = start_master(&args, connect_timeout).await?;

        Ok(Self {
            args,
            master: Some(master),
            _control_dir: dir,
        })
    }
}

async fn start_master(args: &SshArgs, connect_timeout: Duration) -> Result<Child> {
    let mut master = args
        .command()
        .args(["-N", "-o", "ControlMaster=yes"])
        .arg("-o")
        .arg(format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)))
        .arg(&args.destination)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| LabError::Session(format!("failed to spawn ssh: {}", e)))?;

    let deadline = tokio::time::Instant::now() + connect_timeout;
    loop {
        if let Some(status) = master.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = master.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            return Err(LabError::Session(format!(
                "ssh to {} exited with {}: {}",
                args.destination,
                status,
                stderr.trim()
            )));
        }

        if args.control("check").await {
            debug!(destination = %args.destination, "Control master ready");
            return Ok(master);
        }

        if tokio::time::Instant::now() >= deadline {
            let _ = master.kill().await;
            return Err(LabError::Session(format!(
                "timed out connecting to {}",
                args.destination
            )));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[async_trait]
impl RemoteSession for OpensshSession {
    async fn exec(&mut self, command: &str, sink: OutputSink<'_>) -> Result<Option<i32>> {
        if self.master.is_none() {
            return Err(LabError::Session(format!(
                "session to {} is closed",
                self.args.destination
            )));
        }

        let child = self
            .args
            .command()
            .arg("-T")
            .arg(&self.args.destination)
            .arg("--")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LabError::Session(format!("failed to start '{}': {}", command, e)))?;

        Ok(pump_output(child, |stream, data| sink(stream, data)).await?)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut master) = self.master.take() else {
            return Ok(());
        };

        if !self.args.control("exit").await {
            debug!(destination = %self.args.destination, "Control master did not acknowledge exit");
        }

        match tokio::time::timeout(Duration::from_secs(5), master.wait()).await {
            Ok(result) => {
                result?;
            }
            Err(_) => master.kill().await?,
        }
        Ok(())
    }
}
