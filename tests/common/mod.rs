#![allow(dead_code)]

//! Test doubles for the remote execution channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use rjob::core::error::{JobError, Result};
use rjob::core::transport::{OpContext, SyncRequest, Transport};

/// A remote call seen by `FakeTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Script {
        host: String,
        operation: &'static str,
        destination: String,
        script: String,
        debug: bool,
    },
    Sync {
        host: String,
        operation: &'static str,
        request: SyncRequest,
        debug: bool,
    },
}

impl Call {
    pub fn host(&self) -> &str {
        match self {
            Call::Script { host, .. } | Call::Sync { host, .. } => host,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Call::Script { operation, .. } | Call::Sync { operation, .. } => operation,
        }
    }

    pub fn debug(&self) -> bool {
        match self {
            Call::Script { debug, .. } | Call::Sync { debug, .. } => *debug,
        }
    }
}

/// Records every call and answers status scripts from a per-host queue.
/// The last queued status repeats once the queue is down to one entry.
#[derive(Default)]
pub struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    statuses: Mutex<HashMap<String, VecDeque<String>>>,
    failing: HashSet<(String, &'static str)>,
    delays: HashMap<String, Duration>,
    log_content: Option<String>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(self, host: &str, statuses: &[&str]) -> Self {
        self.statuses.lock().unwrap().insert(
            host.to_string(),
            statuses.iter().map(|status| status.to_string()).collect(),
        );
        self
    }

    pub fn failing_on(mut self, host: &str, operation: &'static str) -> Self {
        self.failing.insert((host.to_string(), operation));
        self
    }

    pub fn with_delay(mut self, host: &str, delay: Duration) -> Self {
        self.delays.insert(host.to_string(), delay);
        self
    }

    pub fn with_log(mut self, content: &str) -> Self {
        self.log_content = Some(content.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, host: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.host() == host)
            .collect()
    }

    fn next_status(&self, host: &str) -> String {
        let mut statuses = self.statuses.lock().unwrap();
        match statuses.get_mut(host) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => "dead".to_string(),
        }
    }

    fn check(&self, ctx: &OpContext, command: &str) -> Result<()> {
        if self.failing.contains(&(ctx.host.clone(), ctx.operation)) {
            return Err(JobError::RemoteExecution {
                host: ctx.host.clone(),
                command: command.to_string(),
                exit_code: Some(255),
                stderr: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn run_script(&self, ctx: &OpContext, destination: &str, script: &str) -> Result<String> {
        if let Some(delay) = self.delays.get(&ctx.host) {
            tokio::time::sleep(*delay).await;
        }
        self.calls.lock().unwrap().push(Call::Script {
            host: ctx.host.clone(),
            operation: ctx.operation,
            destination: destination.to_string(),
            script: script.to_string(),
            debug: ctx.debug,
        });
        self.check(ctx, script)?;
        if ctx.operation == "status" {
            return Ok(format!("Last login: yesterday\n{}\n", self.next_status(&ctx.host)));
        }
        Ok(String::new())
    }

    async fn sync(&self, ctx: &OpContext, request: &SyncRequest) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Sync {
            host: ctx.host.clone(),
            operation: ctx.operation,
            request: request.clone(),
            debug: ctx.debug,
        });
        self.check(ctx, &request.to_args().join(" "))?;
        if let Some(content) = &self.log_content {
            let (_, remote) = request.source.split_once(':').unwrap_or_default();
            let name = Path::new(remote).file_name().unwrap();
            std::fs::write(Path::new(&request.target).join(name), content)?;
        }
        Ok(())
    }
}

/// Runs scripts with a local `sh` in its own process group, so that killing a
/// job group can never reach the test process.
pub struct LocalShell;

#[async_trait]
impl Transport for LocalShell {
    async fn run_script(&self, ctx: &OpContext, _destination: &str, script: &str) -> Result<String> {
        let mut child = Command::new("sh")
            .arg("-s")
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(JobError::RemoteExecution {
                host: ctx.host.clone(),
                command: script.to_string(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn sync(&self, _ctx: &OpContext, _request: &SyncRequest) -> Result<()> {
        Ok(())
    }
}
