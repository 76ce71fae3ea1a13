//! Remote execution and file synchronization channels.
//!
//! `SshTransport` pipes scripts into `ssh <destination> /bin/sh -s` and copies
//! trees with `rsync`. Every call spawns its own child process, so host tasks
//! never share a channel.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::error::{JobError, Result};

pub const LOCAL_MACHINE: &str = "local machine";

/// Identifies who is doing what, threaded through every remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
    pub job: String,
    pub host: String,
    pub operation: &'static str,
    pub debug: bool,
}

/// One rsync invocation. Remote endpoints use the `user@host:path` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub source: String,
    pub target: String,
    pub exclude_from: Option<PathBuf>,
}

impl SyncRequest {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            exclude_from: None,
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["-az".to_string()];
        if let Some(exclude) = &self.exclude_from {
            args.push("--exclude-from".to_string());
            args.push(exclude.display().to_string());
        }
        args.push(self.source.clone());
        args.push(self.target.clone());
        args
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `script` with the remote shell of `destination` and returns its stdout.
    async fn run_script(&self, ctx: &OpContext, destination: &str, script: &str) -> Result<String>;

    /// Copies files between the local machine and a host.
    async fn sync(&self, ctx: &OpContext, request: &SyncRequest) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_program: String,
    rsync_program: String,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            rsync_program: "rsync".to_string(),
        }
    }
}

impl SshTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn run_script(&self, ctx: &OpContext, destination: &str, script: &str) -> Result<String> {
        if ctx.debug {
            echo_script(&mut std::io::stdout().lock(), destination, script)?;
        }
        tracing::debug!(job = %ctx.job, host = %ctx.host, op = ctx.operation, "opening remote shell");

        let mut child = Command::new(&self.ssh_program)
            .args(["-T", "-o", "BatchMode=yes", destination, "/bin/sh", "-s"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(&self.ssh_program, err))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(JobError::RemoteExecution {
                host: ctx.host.clone(),
                command: script.to_string(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    async fn sync(&self, ctx: &OpContext, request: &SyncRequest) -> Result<()> {
        let args = request.to_args();
        let command_line = format!("{} {}", self.rsync_program, shell_words::join(&args));
        if ctx.debug {
            echo_script(&mut std::io::stdout().lock(), LOCAL_MACHINE, &command_line)?;
        }
        tracing::debug!(job = %ctx.job, host = %ctx.host, op = ctx.operation, "running rsync");

        let output = Command::new(&self.rsync_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| spawn_error(&self.rsync_program, err))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(JobError::RemoteExecution {
                host: ctx.host.clone(),
                command: command_line,
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

/// Prints a script exactly as it is about to run, under a header naming the target.
pub fn echo_script<W: Write>(out: &mut W, target: &str, script: &str) -> std::io::Result<()> {
    writeln!(out, "# --- {target} ---")?;
    writeln!(out, "{}", script.trim_end())?;
    out.flush()
}

fn spawn_error(program: &str, err: std::io::Error) -> JobError {
    if err.kind() == std::io::ErrorKind::NotFound {
        JobError::BinaryNotFound {
            program: program.to_string(),
        }
    } else {
        JobError::Io(err)
    }
}
