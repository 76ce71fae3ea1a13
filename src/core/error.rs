use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration error: {message}")]
    Config { message: String },
    #[error("{program} binary not found in PATH")]
    BinaryNotFound { program: String },
    #[error("command failed on {host} (exit_code={exit_code:?}): {command}\n{stderr}")]
    RemoteExecution {
        host: String,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("unknown supervisor {kind:?} (expected basic or systemd)")]
    UnknownSupervisor { kind: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl JobError {
    pub fn config(message: impl Into<String>) -> Self {
        JobError::Config {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
