//! Host-side control scripts.
//!
//! A supervisor turns a job description into three POSIX shell scripts:
//! `start`, `stop` and `status`. Rendering is pure; the deployment layer
//! decides where and when the scripts run.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::core::error::JobError;

/// Seconds the detached shell sleeps before running the command, so the pid
/// file is written before a short job can remove it.
pub const STARTUP_GRACE_SECS: u32 = 3;

pub const UNIT_DIRECTORY: &str = "/etc/systemd/system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorKind {
    Basic,
    Systemd,
}

impl FromStr for SupervisorKind {
    type Err = JobError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(SupervisorKind::Basic),
            "systemd" => Ok(SupervisorKind::Systemd),
            _ => Err(JobError::UnknownSupervisor {
                kind: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for SupervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorKind::Basic => write!(f, "basic"),
            SupervisorKind::Systemd => write!(f, "systemd"),
        }
    }
}

/// Everything a supervisor needs to know about one job on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptContext {
    pub name: String,
    pub command: String,
    pub workdir: String,
    pub done: String,
    pub logfile: String,
    pub service_name: String,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicSupervisor {
    pub context: ScriptContext,
}

impl BasicSupervisor {
    pub fn pidfile(&self) -> String {
        format!("{}/.pid", self.context.workdir)
    }

    pub fn start(&self) -> String {
        let ctx = &self.context;
        let pidfile = self.pidfile();
        let mut script = String::new();
        for (key, value) in &ctx.environment {
            script.push_str(&format!("export {key}={}\n", quote(value)));
        }
        script.push_str(&format!("cd {}\n", quote(&ctx.workdir)));
        script.push_str(&format!("rm -rf {done}\nmkdir -p {done}\n", done = quote(&ctx.done)));

        let detached = format!(
            "sleep {STARTUP_GRACE_SECS}; {command}; rm -f {pid}",
            command = ctx.command,
            pid = quote(&pidfile),
        );
        script.push_str(&format!(
            "nohup setsid sh -c {exec} > {log} 2>&1 < /dev/null &\n",
            exec = quote(&detached),
            log = quote(&ctx.logfile),
        ));
        script.push_str(&format!("echo $! > {}\n", quote(&pidfile)));
        script
    }

    /// Kills the whole process group of the recorded pid. The group id is read
    /// from field 5 of `/proc/<pid>/stat`, which assumes a Linux-style procfs.
    pub fn stop(&self) -> String {
        let mut script = format!("PIDFILE={}\n", quote(&self.pidfile()));
        script.push_str("if [ ! -f \"$PIDFILE\" ]; then echo already stopped; exit 0; fi\n");
        script.push_str("PID=$(cat \"$PIDFILE\")\n");
        script.push_str("PGID=$(awk '{print $5}' \"/proc/$PID/stat\" 2>/dev/null)\n");
        script.push_str("if [ -n \"$PGID\" ]; then kill -9 -\"$PGID\" 2>/dev/null || true; fi\n");
        script.push_str("rm -f \"$PIDFILE\"\n");
        script
    }

    /// Reports `active` while the pid file exists. The pid itself is not
    /// checked, so a pid file left behind by a crashed host reads as active.
    pub fn status(&self) -> String {
        format!(
            "if [ -f {pid} ]; then echo active; else echo dead; fi\n",
            pid = quote(&self.pidfile())
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemdSupervisor {
    pub context: ScriptContext,
}

impl SystemdSupervisor {
    pub fn unit_path(&self) -> String {
        format!("{UNIT_DIRECTORY}/{}", self.context.service_name)
    }

    pub fn unit_file(&self) -> String {
        let ctx = &self.context;
        let mut unit = String::new();
        unit.push_str("[Unit]\n");
        unit.push_str(&format!("Description=rjob {} one-shot service\n", ctx.name));
        unit.push('\n');
        unit.push_str("[Service]\n");
        unit.push_str("Type=exec\n");
        unit.push_str(&format!("WorkingDirectory={}\n", ctx.workdir));
        unit.push_str(&format!("StandardOutput=file:{}\n", ctx.logfile));
        unit.push_str("StandardError=inherit\n");
        let done = unit_quote(&ctx.done, true);
        unit.push_str(&format!("ExecStartPre=/bin/rm -rf {done}\n"));
        unit.push_str(&format!("ExecStartPre=/bin/mkdir -p {done}\n"));
        unit.push_str(&format!("ExecStart=/bin/sh -c {}\n", unit_quote(&ctx.command, true)));
        for (key, value) in &ctx.environment {
            let assignment = format!("{key}={value}");
            unit.push_str(&format!("Environment={}\n", unit_quote(&assignment, false)));
        }
        unit
    }

    pub fn start(&self) -> String {
        let service = quote(&self.context.service_name);
        format!(
            "cat > {path} <<'EOF'\n{unit}EOF\nsystemctl daemon-reload\nsystemctl start {service}\n",
            path = quote(&self.unit_path()),
            unit = self.unit_file(),
        )
    }

    pub fn stop(&self) -> String {
        format!("systemctl stop {}\n", quote(&self.context.service_name))
    }

    pub fn status(&self) -> String {
        format!(
            "systemctl show -p SubState --value {}\n",
            quote(&self.context.service_name)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supervisor {
    Basic(BasicSupervisor),
    Systemd(SystemdSupervisor),
}

impl Supervisor {
    pub fn new(kind: SupervisorKind, context: ScriptContext) -> Self {
        match kind {
            SupervisorKind::Basic => Supervisor::Basic(BasicSupervisor { context }),
            SupervisorKind::Systemd => Supervisor::Systemd(SystemdSupervisor { context }),
        }
    }

    /// Resolves a user-supplied kind string such as `" Systemd "`.
    pub fn resolve(kind: &str, context: ScriptContext) -> Result<Self, JobError> {
        Ok(Self::new(kind.parse()?, context))
    }

    pub fn kind(&self) -> SupervisorKind {
        match self {
            Supervisor::Basic(_) => SupervisorKind::Basic,
            Supervisor::Systemd(_) => SupervisorKind::Systemd,
        }
    }

    pub fn start(&self) -> String {
        match self {
            Supervisor::Basic(inner) => inner.start(),
            Supervisor::Systemd(inner) => inner.start(),
        }
    }

    pub fn stop(&self) -> String {
        match self {
            Supervisor::Basic(inner) => inner.stop(),
            Supervisor::Systemd(inner) => inner.stop(),
        }
    }

    pub fn status(&self) -> String {
        match self {
            Supervisor::Basic(inner) => inner.status(),
            Supervisor::Systemd(inner) => inner.status(),
        }
    }
}

fn quote(value: &str) -> Cow<'_, str> {
    shell_words::quote(value)
}

/// Double-quotes a value for a unit file. `%` is always a specifier there;
/// `$` only expands inside Exec lines. Line breaks become C escapes so each
/// setting stays on one line.
fn unit_quote(value: &str, exec_line: bool) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '%' => out.push_str("%%"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '$' if exec_line => out.push_str("$$"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
