//! Fleet-wide fan-out of deployment operations.
//!
//! Every operation runs one future per host and waits for all of them, even
//! after one has failed. Failures are logged once the barrier is reached and
//! the first one is returned.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::core::deployment::{
    expand_target, DeployOptions, Deployment, LogLines, ENV_INDEX, ENV_RESULT, ENV_TOTAL,
};
use crate::core::error::{JobError, Result};
use crate::core::job::{split_server, JobSpec};
use crate::core::status::is_running;
use crate::core::supervisor::SupervisorKind;
use crate::core::transport::Transport;

pub const DEFAULT_COLLECT_TARGET: &str = "complete/{host}";
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(2);

pub struct Fleet {
    pub spec: JobSpec,
    pub options: DeployOptions,
    transport: Arc<dyn Transport>,
}

impl Fleet {
    pub fn new(spec: JobSpec, transport: Arc<dyn Transport>) -> Self {
        Self {
            spec,
            options: DeployOptions::default(),
            transport,
        }
    }

    pub fn with_options(mut self, options: DeployOptions) -> Self {
        self.options = options;
        self
    }

    /// One deployment per server entry, in the order the servers are listed.
    pub fn generate_deployments(&self) -> Result<Vec<Deployment>> {
        self.spec.validate()?;
        self.options.validate()?;
        self.spec.supervisor.parse::<SupervisorKind>()?;
        let total = self.spec.servers.len();
        let mut deployments = Vec::with_capacity(total);
        for (index, server) in self.spec.servers.iter().enumerate() {
            let (user, host) = split_server(server)?;
            let mut deployment = Deployment::new(
                self.spec.name.clone(),
                user,
                host,
                self.spec.command.clone(),
                Arc::clone(&self.transport),
            );
            deployment.supervisor = self.spec.supervisor.clone();
            deployment.install = self.spec.install.clone();
            deployment.options = self.options.clone();
            deployment.debug = self.spec.debug;
            let result_dir = deployment.result_dir();
            deployment.environment.insert(ENV_RESULT.to_string(), result_dir);
            deployment
                .environment
                .insert(ENV_INDEX.to_string(), index.to_string());
            deployment
                .environment
                .insert(ENV_TOTAL.to_string(), total.to_string());
            deployments.push(deployment);
        }
        Ok(deployments)
    }

    pub async fn deploy(&self) -> Result<()> {
        let deployments = self.generate_deployments()?;
        let total = deployments.len();
        let results = join_all(
            deployments
                .iter()
                .enumerate()
                .map(|(index, deployment)| deployment.deploy(index, total)),
        )
        .await;
        first_failure("deploy", &deployments, results).map(|_| ())
    }

    pub async fn patch(&self) -> Result<()> {
        let deployments = self.generate_deployments()?;
        let total = deployments.len();
        let results = join_all(
            deployments
                .iter()
                .enumerate()
                .map(|(index, deployment)| deployment.patch(index, total)),
        )
        .await;
        first_failure("patch", &deployments, results).map(|_| ())
    }

    /// Restarts the job on every host; each host stops its old instance first.
    pub async fn start(&self) -> Result<()> {
        let deployments = self.generate_deployments()?;
        let results = join_all(deployments.iter().map(|deployment| deployment.start())).await;
        first_failure("start", &deployments, results).map(|_| ())
    }

    pub async fn stop(&self) -> Result<()> {
        let deployments = self.generate_deployments()?;
        let results = join_all(deployments.iter().map(|deployment| deployment.stop())).await;
        first_failure("stop", &deployments, results).map(|_| ())
    }

    /// Pulls every host's result directory into the expanded `target_template`.
    pub async fn collect(&self, target_template: &str) -> Result<()> {
        let deployments = self.generate_deployments()?;
        let results = join_all(deployments.iter().enumerate().map(|(index, deployment)| {
            let target = expand_target(target_template, deployment, index);
            async move { deployment.collect(&target).await }
        }))
        .await;
        first_failure("collect", &deployments, results).map(|_| ())
    }

    /// One round of status queries, in server-list order.
    pub async fn statuses(&self) -> Result<Vec<(Deployment, String)>> {
        let deployments = self.generate_deployments()?;
        query_statuses(deployments).await
    }

    /// Fetches logs, limited to `host` when given. Unselected hosts are never
    /// contacted.
    pub async fn logs(&self, host: Option<&str>) -> Result<Vec<(Deployment, LogLines)>> {
        let mut deployments = self.generate_deployments()?;
        if let Some(host) = host {
            deployments.retain(|deployment| deployment.host == host);
            if deployments.is_empty() {
                return Err(JobError::config(format!("no server matches host {host:?}")));
            }
        }
        let results = join_all(deployments.iter().map(|deployment| deployment.logs())).await;
        let lines = first_failure("logs", &deployments, results)?;
        Ok(deployments.into_iter().zip(lines).collect())
    }

    /// Polls until no host reports a running status.
    ///
    /// Hosts are appended to the result in the round they were seen finishing,
    /// not in server-list order. There is no upper bound on the number of
    /// rounds.
    pub async fn wait(&self, interval: Duration) -> Result<Vec<(Deployment, String)>> {
        let mut active = self.generate_deployments()?;
        let mut complete = Vec::new();
        loop {
            let mut still_running = Vec::new();
            for (deployment, status) in query_statuses(active).await? {
                if is_running(&status) {
                    still_running.push(deployment);
                } else {
                    tracing::info!(job = %deployment.name, host = %deployment.host, op = "wait", status = %status, "deployment finished");
                    complete.push((deployment, status));
                }
            }
            active = still_running;
            tracing::info!(job = %self.spec.name, op = "wait", "{} left deployments", active.len());
            if active.is_empty() {
                return Ok(complete);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

async fn query_statuses(deployments: Vec<Deployment>) -> Result<Vec<(Deployment, String)>> {
    let results = join_all(deployments.iter().map(|deployment| deployment.status())).await;
    let statuses = first_failure("status", &deployments, results)?;
    Ok(deployments.into_iter().zip(statuses).collect())
}

/// Logs every failed host and returns the first error, or all values in order.
fn first_failure<T>(
    operation: &str,
    deployments: &[Deployment],
    results: Vec<Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(results.len());
    let mut first = None;
    for (deployment, result) in deployments.iter().zip(results) {
        match result {
            Ok(value) => values.push(value),
            Err(err) => {
                tracing::error!(job = %deployment.name, host = %deployment.host, op = operation, error = %err, "operation failed");
                if first.is_none() {
                    first = Some(err);
                }
            }
        }
    }
    match first {
        Some(err) => Err(err),
        None => Ok(values),
    }
}
