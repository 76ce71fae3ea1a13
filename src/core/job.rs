use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::error::{JobError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "deploy.json";
pub const DEFAULT_SUPERVISOR: &str = "basic";

/// One path segment: no separators, no NUL or other control characters.
static RE_JOB_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^/\x00-\x1f\x7f]+$").unwrap());

/// User-authored description of a job and the fleet it runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub install: String,
    #[serde(default = "default_supervisor")]
    pub supervisor: String,
    #[serde(skip)]
    pub debug: bool,
}

fn default_supervisor() -> String {
    DEFAULT_SUPERVISOR.to_string()
}

impl JobSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>, servers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            servers,
            install: String::new(),
            supervisor: default_supervisor(),
            debug: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            JobError::config(format!("cannot read {}: {err}", path.display()))
        })?;
        let spec: JobSpec = serde_json::from_str(&content).map_err(|err| {
            JobError::config(format!("invalid job file {}: {err}", path.display()))
        })?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    pub fn validate(&self) -> Result<()> {
        if !is_path_segment(&self.name) {
            return Err(JobError::config(format!(
                "job name {:?} is not a valid directory name",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(JobError::config("job command is empty"));
        }
        for server in &self.servers {
            split_server(server)?;
        }
        Ok(())
    }
}

pub fn is_path_segment(name: &str) -> bool {
    name != "." && name != ".." && RE_JOB_NAME.is_match(name)
}

/// Splits `user@host` into its parts. Exactly one `@` is accepted.
pub fn split_server(server: &str) -> Result<(&str, &str)> {
    match server.split_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() && !host.contains('@') => {
            Ok((user, host))
        }
        _ => Err(JobError::config(format!(
            "server {server:?} must have the form user@host"
        ))),
    }
}
