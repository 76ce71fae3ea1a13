use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::core::error::{JobError, Result};
use crate::core::status::last_status_line;
use crate::core::supervisor::{ScriptContext, Supervisor};
use crate::core::transport::{OpContext, SyncRequest, Transport};

pub const DEFAULT_REMOTE_ROOT: &str = "/tmp/jobs";
pub const DEFAULT_RESULT_DIRECTORY: &str = "done";
pub const DEFAULT_LOG_FILE: &str = ".log";
pub const DEFAULT_NAME_PREFIX: &str = "job-";
pub const DEFAULT_EXCLUDE_FILE: &str = ".jobignore";

pub const ENV_RESULT: &str = "RESULT";
pub const ENV_INDEX: &str = "DEPLOYMENT_INDEX";
pub const ENV_TOTAL: &str = "DEPLOYMENT_NUM";

/// Host-independent knobs copied into every deployment of a fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOptions {
    pub local_directory: PathBuf,
    pub exclude_file: PathBuf,
    pub remote_directory: Option<String>,
    pub result_directory: String,
    pub log_file: String,
    pub name_prefix: String,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            local_directory: PathBuf::from("."),
            exclude_file: PathBuf::from(DEFAULT_EXCLUDE_FILE),
            remote_directory: None,
            result_directory: DEFAULT_RESULT_DIRECTORY.to_string(),
            log_file: DEFAULT_LOG_FILE.to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

impl DeployOptions {
    /// Remote path pieces end up inside shell scripts and unit files, so they
    /// must stay on one line.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("remote directory", self.remote_directory.as_deref().unwrap_or_default()),
            ("result directory", self.result_directory.as_str()),
            ("log file", self.log_file.as_str()),
            ("name prefix", self.name_prefix.as_str()),
        ];
        for (label, value) in fields {
            if value.chars().any(char::is_control) {
                return Err(JobError::config(format!(
                    "{label} {value:?} contains control characters"
                )));
            }
        }
        Ok(())
    }
}

/// One job bound to one host. Rebuilt on every invocation, never persisted.
#[derive(Clone)]
pub struct Deployment {
    pub name: String,
    pub host: String,
    pub user: String,
    pub command: String,
    pub supervisor: String,
    pub environment: BTreeMap<String, String>,
    pub install: String,
    pub options: DeployOptions,
    pub debug: bool,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("name", &self.name)
            .field("destination", &self.destination())
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

impl Deployment {
    pub fn new(
        name: impl Into<String>,
        user: impl Into<String>,
        host: impl Into<String>,
        command: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            user: user.into(),
            command: command.into(),
            supervisor: "basic".to_string(),
            environment: BTreeMap::new(),
            install: String::new(),
            options: DeployOptions::default(),
            debug: false,
            transport,
        }
    }

    pub fn deploy_dir(&self) -> String {
        match &self.options.remote_directory {
            Some(dir) => dir.clone(),
            None => format!("{DEFAULT_REMOTE_ROOT}/{}", self.name),
        }
    }

    pub fn result_dir(&self) -> String {
        format!("{}/{}", self.deploy_dir(), self.options.result_directory)
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn log_path(&self) -> String {
        self.remote_abs(&self.options.log_file)
    }

    pub fn service_name(&self) -> String {
        format!("{}{}.service", self.options.name_prefix, self.name)
    }

    fn remote_abs(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.deploy_dir(), path)
        }
    }

    pub fn script_context(&self) -> ScriptContext {
        ScriptContext {
            name: self.name.clone(),
            command: self.command.clone(),
            workdir: self.deploy_dir(),
            done: self.result_dir(),
            logfile: self.log_path(),
            service_name: self.service_name(),
            environment: self.environment.clone(),
        }
    }

    pub fn supervisor(&self) -> Result<Supervisor> {
        Supervisor::resolve(&self.supervisor, self.script_context())
    }

    pub fn context(&self, operation: &'static str) -> OpContext {
        OpContext {
            job: self.name.clone(),
            host: self.host.clone(),
            operation,
            debug: self.debug,
        }
    }

    /// Wipes the remote deploy directory and repopulates it.
    pub async fn deploy(&self, index: usize, total: usize) -> Result<()> {
        let ctx = self.context("deploy");
        let dir = self.deploy_dir();
        tracing::info!(job = %ctx.job, host = %ctx.host, op = ctx.operation, dir = %dir, "resetting remote directory");
        let script = format!("rm -rf {dir}\nmkdir -p {dir}\n", dir = shell_words::quote(&dir));
        self.run(&ctx, &script).await?;
        self.patch(index, total).await
    }

    /// Pushes the local tree and runs the install command, without a reset.
    pub async fn patch(&self, index: usize, total: usize) -> Result<()> {
        let ctx = self.context("patch");
        let mut request = SyncRequest::new(
            format!("{}/", self.options.local_directory.display()),
            format!("{}:{}", self.destination(), self.deploy_dir()),
        );
        if self.options.exclude_file.exists() {
            request.exclude_from = Some(self.options.exclude_file.clone());
        }
        tracing::info!(job = %ctx.job, host = %ctx.host, op = ctx.operation, "synchronizing local tree to {}", self.deploy_dir());
        self.transport.sync(&ctx, &request).await?;

        if self.install.trim().is_empty() {
            return Ok(());
        }
        tracing::info!(job = %ctx.job, host = %ctx.host, op = ctx.operation, "running install command");
        let script = format!(
            "cd {dir}\nexport {ENV_INDEX}={index}\nexport {ENV_TOTAL}={total}\n{install}\n",
            dir = shell_words::quote(&self.deploy_dir()),
            install = self.install,
        );
        self.run(&ctx, &script).await?;
        Ok(())
    }

    /// Stops any previous instance, then launches a new one.
    pub async fn start(&self) -> Result<()> {
        let supervisor = self.supervisor()?;
        self.stop().await?;
        let ctx = self.context("start");
        tracing::info!(job = %ctx.job, host = %ctx.host, op = ctx.operation, supervisor = %supervisor.kind(), "starting job");
        self.run(&ctx, &supervisor.start()).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let supervisor = self.supervisor()?;
        let ctx = self.context("stop");
        tracing::info!(job = %ctx.job, host = %ctx.host, op = ctx.operation, "stopping job");
        self.run(&ctx, &supervisor.stop()).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<String> {
        let supervisor = self.supervisor()?;
        let ctx = self.context("status");
        let output = self.run(&ctx, &supervisor.status()).await?;
        let status = last_status_line(&output);
        tracing::debug!(job = %ctx.job, host = %ctx.host, op = ctx.operation, status = %status, "queried status");
        Ok(status)
    }

    /// Pulls the contents of the remote result directory into `target`.
    pub async fn collect(&self, target: &Path) -> Result<()> {
        let ctx = self.context("collect");
        tracing::info!(job = %ctx.job, host = %ctx.host, op = ctx.operation, "collecting results to {}", target.display());
        tokio::fs::create_dir_all(target).await?;
        let request = SyncRequest::new(
            format!("{}:{}/", self.destination(), self.result_dir()),
            target.display().to_string(),
        );
        self.transport.sync(&ctx, &request).await
    }

    /// Fetches the remote log into a scratch directory and iterates its lines.
    /// The scratch directory lives as long as the returned iterator.
    pub async fn logs(&self) -> Result<LogLines> {
        let ctx = self.context("logs");
        let cache = TempDir::new()?;
        let request = SyncRequest::new(
            format!("{}:{}", self.destination(), self.log_path()),
            format!("{}/", cache.path().display()),
        );
        self.transport.sync(&ctx, &request).await?;

        let file_name = Path::new(&self.options.log_file)
            .file_name()
            .ok_or_else(|| JobError::config(format!("log file {:?} has no file name", self.options.log_file)))?;
        let file = File::open(cache.path().join(file_name))?;
        Ok(LogLines {
            lines: BufReader::new(file).lines(),
            _cache: cache,
        })
    }

    async fn run(&self, ctx: &OpContext, script: &str) -> Result<String> {
        self.transport.run_script(ctx, &self.destination(), script).await
    }
}

/// Trimmed lines of a fetched log file. Finite and not restartable; the
/// backing temporary directory is removed when this is dropped.
pub struct LogLines {
    lines: Lines<BufReader<File>>,
    _cache: TempDir,
}

impl Iterator for LogLines {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines
            .next()
            .map(|line| line.map(|text| text.trim().to_string()))
    }
}

/// Expands `{host}`, `{user}`, `{name}` and `{index}` in a collect target.
pub fn expand_target(template: &str, deployment: &Deployment, index: usize) -> PathBuf {
    PathBuf::from(
        template
            .replace("{host}", &deployment.host)
            .replace("{user}", &deployment.user)
            .replace("{name}", &deployment.name)
            .replace("{index}", &index.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn run_script(&self, _ctx: &OpContext, _dest: &str, _script: &str) -> Result<String> {
            unreachable!("no remote calls expected")
        }

        async fn sync(&self, _ctx: &OpContext, _request: &SyncRequest) -> Result<()> {
            unreachable!("no sync expected")
        }
    }

    fn deployment() -> Deployment {
        Deployment::new("etl", "alice", "host1", "run-etl", Arc::new(Unreachable))
    }

    #[test]
    fn derives_default_paths() {
        let dep = deployment();
        assert_eq!(dep.deploy_dir(), "/tmp/jobs/etl");
        assert_eq!(dep.result_dir(), "/tmp/jobs/etl/done");
        assert_eq!(dep.destination(), "alice@host1");
        assert_eq!(dep.log_path(), "/tmp/jobs/etl/.log");
        assert_eq!(dep.service_name(), "job-etl.service");
    }

    #[test]
    fn result_dir_follows_remote_override() {
        let mut dep = deployment();
        dep.options.remote_directory = Some("/srv/etl".to_string());
        dep.options.log_file = "/var/log/etl.log".to_string();
        assert_eq!(dep.deploy_dir(), "/srv/etl");
        assert!(dep.result_dir().starts_with(&dep.deploy_dir()));
        assert_eq!(dep.log_path(), "/var/log/etl.log");
    }

    #[test]
    fn expand_target_fills_placeholders() {
        let dep = deployment();
        assert_eq!(expand_target("complete/{host}", &dep, 0), PathBuf::from("complete/host1"));
        assert_eq!(
            expand_target("out/{name}/{index}-{user}", &dep, 3),
            PathBuf::from("out/etl/3-alice")
        );
    }

    #[test]
    fn options_reject_multiline_paths() {
        assert!(DeployOptions::default().validate().is_ok());
        let options = DeployOptions {
            result_directory: "done\nEOF".to_string(),
            ..DeployOptions::default()
        };
        assert!(matches!(options.validate(), Err(JobError::Config { .. })));
        let options = DeployOptions {
            remote_directory: Some("/srv/etl\r".to_string()),
            ..DeployOptions::default()
        };
        assert!(matches!(options.validate(), Err(JobError::Config { .. })));
    }

    #[tokio::test]
    async fn unknown_supervisor_fails_before_remote_contact() {
        let mut dep = deployment();
        dep.supervisor = "upstart".to_string();
        let err = dep.start().await.unwrap_err();
        assert!(matches!(err, JobError::UnknownSupervisor { .. }));
        assert!(matches!(dep.status().await, Err(JobError::UnknownSupervisor { .. })));
    }
}
