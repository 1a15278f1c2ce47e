//! Command results, streamed output handling and the host-side shell.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{LabError, Result};

/// Outcome of a remote or host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellResult {
    /// The command exited with status 0
    pub success: bool,
    /// Everything written to standard output
    pub stdout: String,
    /// Everything written to standard error
    pub stderr: String,
}

/// Which stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Splits a byte stream into newline-terminated lines.
///
/// Partial lines are held back until a later chunk completes them or the
/// stream ends.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and emit every line it completes, without the newline.
    pub fn push(&mut self, data: &[u8], mut emit: impl FnMut(&str)) {
        self.pending.extend_from_slice(data);

        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = &self.pending[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            emit(&String::from_utf8_lossy(line));
            start = end + 1;
        }
        self.pending.drain(..start);
    }

    /// Emit whatever is left as a final, unterminated line.
    pub fn finish(&mut self, mut emit: impl FnMut(&str)) {
        if !self.pending.is_empty() {
            emit(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }
}

/// Buffers a command's output and logs it line by line as it arrives.
///
/// Standard output lines are logged at DEBUG, standard error lines at WARN.
pub struct OutputCollector {
    source: String,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_lines: LineBuffer,
    stderr_lines: LineBuffer,
}

impl OutputCollector {
    /// `source` names where the output comes from (a VM name or "host").
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_lines: LineBuffer::new(),
            stderr_lines: LineBuffer::new(),
        }
    }

    pub fn feed(&mut self, stream: OutputStream, data: &[u8]) {
        let source = &self.source;
        match stream {
            OutputStream::Stdout => {
                self.stdout.extend_from_slice(data);
                self.stdout_lines
                    .push(data, |line| debug!(source = %source, "{}", line));
            }
            OutputStream::Stderr => {
                self.stderr.extend_from_slice(data);
                self.stderr_lines
                    .push(data, |line| warn!(source = %source, "{}", line));
            }
        }
    }

    /// Flush partial lines and build the result. A missing exit code (the
    /// process was killed by a signal) counts as failure.
    pub fn finish(mut self, exit_code: Option<i32>) -> ShellResult {
        let source = &self.source;
        self.stdout_lines
            .finish(|line| debug!(source = %source, "{}", line));
        self.stderr_lines
            .finish(|line| warn!(source = %source, "{}", line));

        ShellResult {
            success: exit_code == Some(0),
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
        }
    }
}

/// Read a child's stdout and stderr concurrently until both close, handing
/// every chunk to `sink`, then reap the child.
pub(crate) async fn pump_output<F>(mut child: Child, mut sink: F) -> std::io::Result<Option<i32>>
where
    F: FnMut(OutputStream, &[u8]),
{
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; 4096];
    let mut err_buf = vec![0u8; 4096];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            n = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => {
                match n? {
                    0 => stdout = None,
                    n => sink(OutputStream::Stdout, &out_buf[..n]),
                }
            }
            n = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => {
                match n? {
                    0 => stderr = None,
                    n => sink(OutputStream::Stderr, &err_buf[..n]),
                }
            }
        }
    }

    let status = child.wait().await?;
    Ok(status.code())
}

async fn read_chunk<R>(pipe: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match pipe {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

/// Quote a value for safe interpolation into a `sh -c` command line.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell on the machine running vmlab.
///
/// Used for the address scan, reachability pings and the clone/resource
/// tools.
#[async_trait]
pub trait HostShell: Send + Sync {
    /// Run a command line and collect its result. Only failing to spawn the
    /// command is an error; a non-zero exit is reported in the result.
    async fn run(&self, command: &str) -> Result<ShellResult>;

    /// Like [`HostShell::run`] but a non-zero exit is a
    /// [`LabError::CommandFailed`].
    async fn run_strict(&self, command: &str) -> Result<ShellResult> {
        let result = self.run(command).await?;
        if !result.success {
            return Err(LabError::CommandFailed {
                command: command.to_string(),
            });
        }
        Ok(result)
    }
}

/// [`HostShell`] backed by `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct LocalShell;

impl LocalShell {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostShell for LocalShell {
    async fn run(&self, command: &str) -> Result<ShellResult> {
        info!("sh@host$ {}", command);

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut collector = OutputCollector::new("host");
        let exit_code = pump_output(child, |stream, data| collector.feed(stream, data)).await?;
        let result = collector.finish(exit_code);

        if !result.success {
            debug!(command = %command, exit_code = ?exit_code, "Host command failed");
        }
        Ok(result)
    }
}
