use anyhow::Result;
use exp_core::JobPath;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::settings::{BackendSettings, Settings};

pub mod local;
pub mod ssh;

pub use local::LocalBackend;
pub use ssh::SshBackend;

pub const JOB_STARTED: &str = "job_started.txt";
pub const JOB_FINISHED: &str = "job_finished.txt";
pub const JOB_FAILED: &str = "job_failed.txt";
pub const JOB_PID: &str = "job_pid.txt";
pub const START_SCRIPT: &str = "start_computation.sh";
/// Suffix of a job directory still being uploaded. Submission copies into
/// `<job>.partial` and renames it into place once complete.
pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op}: transient failure: {message}")]
    Transient { op: String, message: String },
    #[error("{op}: timed out after {after:?}")]
    Timeout { op: String, after: Duration },
    #[error("{op}: {message}")]
    Fatal { op: String, message: String },
}

impl BackendError {
    pub fn transient(op: &str, message: impl Into<String>) -> Self {
        BackendError::Transient {
            op: op.to_string(),
            message: message.into(),
        }
    }

    pub fn fatal(op: &str, message: impl Into<String>) -> Self {
        BackendError::Fatal {
            op: op.to_string(),
            message: message.into(),
        }
    }

    /// Transient failures and timeouts are worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::Fatal { .. })
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Whatever actually runs jobs. Jobs are addressed by their relative
/// `<scenario>/<dir>` path; a backend keeps its own copy of each submitted
/// directory until `remote_cleanup`.
pub trait ComputeBackend: Send {
    fn name(&self) -> &'static str;

    /// Uploads the staged directory and launches the worker. Submitting the
    /// same path twice is an error.
    fn submit(&self, job: &JobPath, staged_dir: &Path) -> BackendResult<()>;

    fn list_finished(&self) -> BackendResult<Vec<JobPath>>;
    fn list_failed(&self) -> BackendResult<Vec<JobPath>>;
    fn list_interrupted(&self) -> BackendResult<Vec<JobPath>>;
    fn list_not_started(&self) -> BackendResult<Vec<JobPath>>;

    /// Copies the backend's job directory into `dest`.
    fn fetch(&self, job: &JobPath, dest: &Path) -> BackendResult<()>;

    fn cancel(&self, job: &JobPath) -> BackendResult<()>;
    fn restart(&self, job: &JobPath) -> BackendResult<()>;
    fn remote_cleanup(&self, job: &JobPath) -> BackendResult<()>;
    fn scheduled_job_count(&self) -> BackendResult<usize>;
}

pub fn from_settings(settings: &Settings) -> Result<Box<dyn ComputeBackend>> {
    let backend: Box<dyn ComputeBackend> = match &settings.backend {
        BackendSettings::Local {
            remote_root,
            worker_command,
        } => Box::new(LocalBackend::new(remote_root, worker_command.clone())?),
        BackendSettings::Ssh {
            address,
            remote_dir,
            launch_prefix,
            worker_command,
            queue_count_command,
        } => Box::new(SshBackend::new(
            address,
            remote_dir,
            launch_prefix,
            worker_command.clone(),
            queue_count_command,
            settings.calls.timeout(),
        )),
    };
    Ok(backend)
}
