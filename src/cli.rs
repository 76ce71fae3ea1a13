use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::core::deployment::DEFAULT_EXCLUDE_FILE;
use crate::core::error::{JobError, Result};
use crate::core::fleet::{Fleet, DEFAULT_COLLECT_TARGET};
use crate::core::job::{JobSpec, DEFAULT_CONFIG_FILE};
use crate::core::transport::SshTransport;

pub const DEFAULT_JOBIGNORE: &str = "venv\n.idea\n.git\n.jobignore\ncomplete\ndone\n";

#[derive(Debug, Parser)]
#[command(name = "rjob", version, about = "Dummy simple remote task executor")]
pub struct Cli {
    /// Print every script before it runs
    #[arg(long, global = true)]
    pub debug: bool,
    /// Job configuration file
    #[arg(short = 'c', long = "config", global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Initialize a new job in the current directory
    Init,
    /// Reset the remote directories, upload the project and install it
    Deploy,
    /// Upload the project and install it without resetting remote directories
    Patch,
    /// (Re)start the job on all servers
    Start,
    /// Stop the job on all servers
    Stop,
    /// Wait until the job has finished on all servers
    Wait(WaitArgs),
    /// Copy result directories from all servers to this machine
    #[command(alias = "gather")]
    Collect(CollectArgs),
    /// Show job status on all servers
    Status,
    /// Print job logs from all servers
    Logs(LogsArgs),
}

#[derive(Debug, Parser)]
pub struct WaitArgs {
    /// Seconds between status polls
    #[arg(short = 'i', long = "interval", default_value_t = 2)]
    pub interval: u64,
}

#[derive(Debug, Parser)]
pub struct CollectArgs {
    /// Local target; {host}, {user}, {name} and {index} are substituted
    #[arg(short = 't', long = "target", default_value = DEFAULT_COLLECT_TARGET)]
    pub target: String,
}

#[derive(Debug, Parser)]
pub struct LogsArgs {
    /// Only show logs of this host
    #[arg(long = "host")]
    pub host: Option<String>,
}

pub async fn execute(cli: Cli) -> Result<()> {
    if let Commands::Init = cli.command {
        return initialize(&cli.config);
    }

    let mut spec = JobSpec::load(&cli.config)?;
    spec.debug = cli.debug;
    let fleet = Fleet::new(spec, Arc::new(SshTransport::new()));

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Deploy => fleet.deploy().await,
        Commands::Patch => fleet.patch().await,
        Commands::Start => fleet.start().await,
        Commands::Stop => fleet.stop().await,
        Commands::Wait(args) => {
            let complete = fleet.wait(Duration::from_secs(args.interval)).await?;
            for (deployment, status) in complete {
                println!("{} {}", format_status(&status), deployment.destination());
            }
            Ok(())
        }
        Commands::Collect(args) => fleet.collect(&args.target).await,
        Commands::Status => {
            for (deployment, status) in fleet.statuses().await? {
                println!("{} {}", format_status(&status), deployment.destination());
            }
            Ok(())
        }
        Commands::Logs(args) => {
            for (deployment, lines) in fleet.logs(args.host.as_deref()).await? {
                for line in lines {
                    println!("{}: {}", deployment.host, line?);
                }
            }
            Ok(())
        }
    }
}

pub fn format_status(status: &str) -> String {
    format!("{status:<10}")
}

/// Writes a starter job file and exclude list into the config's directory.
fn initialize(config: &Path) -> Result<()> {
    if config.exists() {
        return Err(JobError::config(format!("{} already exists", config.display())));
    }
    let name = job_name_for(config)?;
    let spec = scaffold(&name, &local_user());
    spec.validate()?;
    spec.save(config)?;

    let ignore = config
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(DEFAULT_EXCLUDE_FILE);
    if !ignore.exists() {
        fs::write(&ignore, DEFAULT_JOBIGNORE)?;
    }
    println!("{}", spec.to_json()?);
    Ok(())
}

/// The job is named after the directory holding its config file.
fn job_name_for(config: &Path) -> Result<String> {
    let dir = match config.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let dir = dir.canonicalize()?;
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            JobError::config(format!("cannot derive a job name from {}", dir.display()))
        })
}

pub fn scaffold(name: &str, user: &str) -> JobSpec {
    JobSpec::new(name, "echo hello world", vec![format!("{user}@localhost")])
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rjob", "status", "--debug", "-c", "job.json"]).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.config, PathBuf::from("job.json"));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn gather_is_an_alias_of_collect() {
        let cli = Cli::try_parse_from(["rjob", "gather"]).unwrap();
        match cli.command {
            Commands::Collect(args) => assert_eq!(args.target, "complete/{host}"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn wait_interval_defaults_to_two_seconds() {
        let cli = Cli::try_parse_from(["rjob", "wait"]).unwrap();
        assert!(matches!(cli.command, Commands::Wait(WaitArgs { interval: 2 })));
        assert_eq!(cli.config, PathBuf::from("deploy.json"));
    }

    #[test]
    fn scaffold_targets_localhost() {
        let spec = scaffold("demo", "alice");
        assert_eq!(spec.servers, vec!["alice@localhost".to_string()]);
        assert_eq!(spec.supervisor, "basic");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn format_status_pads_to_ten_columns() {
        assert_eq!(format_status("dead"), "dead      ");
        assert_eq!(format_status("not-found-x"), "not-found-x");
    }

    #[test]
    fn initialize_writes_config_and_ignore_file() {
        let dir = tempfile::Builder::new().prefix("_work").tempdir().unwrap();
        let config = dir.path().join("deploy.json");
        initialize(&config).unwrap();
        let spec = JobSpec::load(&config).unwrap();
        let dir_name = dir.path().file_name().unwrap().to_string_lossy();
        assert_eq!(spec.name, dir_name);
        let ignore = fs::read_to_string(dir.path().join(".jobignore")).unwrap();
        assert!(ignore.lines().any(|line| line == "complete"));
        assert!(matches!(initialize(&config), Err(JobError::Config { .. })));
    }
}
