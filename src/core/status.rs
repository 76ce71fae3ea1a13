/// Statuses that mean the job ran and is no longer tracked.
pub const COMPLETE_STATUSES: [&str; 1] = ["dead"];

/// Statuses that mean the job faulted or its unit does not exist.
pub const FAILED_STATUSES: [&str; 2] = ["failed", "not-found"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Running,
    Complete,
    Failed,
}

pub fn is_running(status: &str) -> bool {
    !is_complete(status) && !is_failed(status)
}

pub fn is_complete(status: &str) -> bool {
    COMPLETE_STATUSES.contains(&status)
}

pub fn is_failed(status: &str) -> bool {
    FAILED_STATUSES.contains(&status)
}

pub fn classify(status: &str) -> StatusClass {
    if is_complete(status) {
        StatusClass::Complete
    } else if is_failed(status) {
        StatusClass::Failed
    } else {
        StatusClass::Running
    }
}

/// Picks the status token out of raw script output: the last non-empty line,
/// so login banners printed ahead of it are ignored.
pub fn last_status_line(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default()
        .to_string()
}
