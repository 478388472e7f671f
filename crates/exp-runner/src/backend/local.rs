use anyhow::{Context, Result};
use chrono::Utc;
use exp_core::{copy_dir, ensure_dir, JobPath};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{
    BackendError, BackendResult, ComputeBackend, JOB_FAILED, JOB_FINISHED, JOB_PID, JOB_STARTED,
    PARTIAL_SUFFIX,
};
use crate::job::{JobManifest, OUTPUT_DIR};
use crate::stager::sorted_dirs;

/// Runs jobs as child processes on this machine, with `remote_root` as the
/// backend's copy of every job directory. Without a worker command, jobs are
/// only uploaded and wait for something else to write the markers.
pub struct LocalBackend {
    remote_root: PathBuf,
    worker_command: Vec<String>,
    children: Mutex<BTreeMap<JobPath, Child>>,
}

impl LocalBackend {
    pub fn new(remote_root: impl Into<PathBuf>, worker_command: Vec<String>) -> Result<Self> {
        let remote_root = remote_root.into();
        ensure_dir(&remote_root)
            .with_context(|| format!("creating backend root {}", remote_root.display()))?;
        Ok(Self {
            remote_root,
            worker_command,
            children: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn job_dir(&self, job: &JobPath) -> PathBuf {
        job.under(&self.remote_root)
    }

    fn children(&self, op: &str) -> BackendResult<MutexGuard<'_, BTreeMap<JobPath, Child>>> {
        self.children
            .lock()
            .map_err(|_| BackendError::fatal(op, "child table lock poisoned"))
    }

    fn launch(&self, op: &str, job: &JobPath, dir: &Path) -> BackendResult<()> {
        let Some((program, args)) = self.worker_command.split_first() else {
            debug!(job = %job, "no worker command configured; job left for an external worker");
            return Ok(());
        };
        let manifest = JobManifest::read(dir).map_err(|e| BackendError::fatal(op, e.to_string()))?;
        for marker in [JOB_STARTED, JOB_FINISHED, JOB_FAILED, JOB_PID] {
            let _ = fs::remove_file(dir.join(marker));
        }
        let output = dir.join(OUTPUT_DIR);
        ensure_dir(&output).map_err(|e| BackendError::fatal(op, e.to_string()))?;
        let run_id = Utc::now().timestamp_micros();
        let stdout_path = output.join(format!("{}stdout-{}.txt", manifest.log_prefix, run_id));
        let stderr_path = output.join(format!("{}stderr.txt", manifest.log_prefix));
        let stdout = fs::File::create(&stdout_path).map_err(|e| BackendError::fatal(op, e.to_string()))?;
        let stderr = fs::File::create(&stderr_path).map_err(|e| BackendError::fatal(op, e.to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&manifest.action)
            .arg(dir)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        let child = cmd
            .spawn()
            .map_err(|e| BackendError::fatal(op, format!("spawning {}: {}", program, e)))?;
        fs::write(dir.join(JOB_STARTED), b"")
            .and_then(|_| fs::write(dir.join(JOB_PID), child.id().to_string()))
            .map_err(|e| BackendError::fatal(op, e.to_string()))?;
        info!(job = %job, pid = child.id(), action = %manifest.action, "worker started");
        self.children(op)?.insert(job.clone(), child);
        Ok(())
    }

    /// Writes completion markers for children that have exited.
    fn reap(&self, op: &str) -> BackendResult<()> {
        let mut children = self.children(op)?;
        let mut done = Vec::new();
        for (job, child) in children.iter_mut() {
            match child.try_wait() {
                Ok(Some(status)) => done.push((job.clone(), status.success())),
                Ok(None) => {}
                Err(err) => warn!(job = %job, error = %err, "polling worker failed"),
            }
        }
        for (job, success) in done {
            children.remove(&job);
            let marker = if success { JOB_FINISHED } else { JOB_FAILED };
            let dir = self.job_dir(&job);
            if dir.is_dir() {
                fs::write(dir.join(marker), b"").map_err(|e| BackendError::fatal(op, e.to_string()))?;
            }
            debug!(job = %job, success, "worker exited");
        }
        Ok(())
    }

    fn job_dirs(&self, op: &str) -> BackendResult<Vec<(JobPath, PathBuf)>> {
        let mut out = Vec::new();
        let scenarios = sorted_dirs(&self.remote_root).map_err(|e| BackendError::fatal(op, e.to_string()))?;
        for scenario in scenarios {
            let dirs = sorted_dirs(&scenario).map_err(|e| BackendError::fatal(op, e.to_string()))?;
            for dir in dirs {
                if dir.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                if let Ok(job) = JobPath::parse(&dir.to_string_lossy()) {
                    out.push((job, dir));
                }
            }
        }
        Ok(out)
    }

    fn select(
        &self,
        op: &str,
        keep: impl Fn(&JobPath, &Path, bool) -> bool,
    ) -> BackendResult<Vec<JobPath>> {
        self.reap(op)?;
        let running: Vec<JobPath> = self.children(op)?.keys().cloned().collect();
        Ok(self
            .job_dirs(op)?
            .into_iter()
            .filter(|(job, dir)| keep(job, dir, running.contains(job)))
            .map(|(job, _)| job)
            .collect())
    }
}

impl ComputeBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    /// Safe to repeat: a leftover partial upload is replaced, and the same
    /// staging (matched by `staged_at`) already in place is only launched if
    /// it never started. A different job in the directory is refused.
    fn submit(&self, job: &JobPath, staged_dir: &Path) -> BackendResult<()> {
        let op = "submit";
        let manifest =
            JobManifest::read(staged_dir).map_err(|e| BackendError::fatal(op, e.to_string()))?;
        let dest = self.job_dir(job);
        if dest.exists() {
            let same = JobManifest::read(&dest)
                .map(|existing| existing.staged_at == manifest.staged_at)
                .unwrap_or(false);
            if !same {
                return Err(BackendError::fatal(op, format!("{} already submitted", job)));
            }
            let running = self.children(op)?.contains_key(job);
            if running || dest.join(JOB_STARTED).is_file() {
                debug!(job = %job, "already submitted");
                return Ok(());
            }
            return self.launch(op, job, &dest);
        }
        let partial = PathBuf::from(format!("{}{}", dest.display(), PARTIAL_SUFFIX));
        if partial.exists() {
            fs::remove_dir_all(&partial).map_err(|e| BackendError::transient(op, e.to_string()))?;
        }
        copy_dir(staged_dir, &partial).map_err(|e| BackendError::transient(op, e.to_string()))?;
        fs::rename(&partial, &dest).map_err(|e| BackendError::transient(op, e.to_string()))?;
        self.launch(op, job, &dest)
    }

    fn list_finished(&self) -> BackendResult<Vec<JobPath>> {
        self.select("list_finished", |_, dir, _| dir.join(JOB_FINISHED).is_file())
    }

    fn list_failed(&self) -> BackendResult<Vec<JobPath>> {
        self.select("list_failed", |_, dir, _| {
            dir.join(JOB_FAILED).is_file() && !dir.join(JOB_FINISHED).is_file()
        })
    }

    fn list_interrupted(&self) -> BackendResult<Vec<JobPath>> {
        self.select("list_interrupted", |_, dir, running| {
            !running
                && dir.join(JOB_STARTED).is_file()
                && !dir.join(JOB_FINISHED).is_file()
                && !dir.join(JOB_FAILED).is_file()
        })
    }

    fn list_not_started(&self) -> BackendResult<Vec<JobPath>> {
        self.select("list_not_started", |_, dir, running| {
            !running
                && !dir.join(JOB_STARTED).is_file()
                && !dir.join(JOB_FINISHED).is_file()
                && !dir.join(JOB_FAILED).is_file()
        })
    }

    fn fetch(&self, job: &JobPath, dest: &Path) -> BackendResult<()> {
        let op = "fetch";
        let src = self.job_dir(job);
        if !src.is_dir() {
            return Err(BackendError::fatal(op, format!("{} not found on backend", job)));
        }
        copy_dir(&src, dest).map_err(|e| BackendError::transient(op, e.to_string()))
    }

    fn cancel(&self, job: &JobPath) -> BackendResult<()> {
        let op = "cancel";
        if let Some(mut child) = self.children(op)?.remove(job) {
            child
                .kill()
                .map_err(|e| BackendError::fatal(op, e.to_string()))?;
            let _ = child.wait();
            info!(job = %job, "worker killed");
        }
        let dir = self.job_dir(job);
        if !dir.is_dir() {
            return Err(BackendError::fatal(op, format!("{} not found on backend", job)));
        }
        fs::write(dir.join(JOB_FAILED), b"").map_err(|e| BackendError::fatal(op, e.to_string()))
    }

    fn restart(&self, job: &JobPath) -> BackendResult<()> {
        let op = "restart";
        if self.worker_command.is_empty() {
            return Err(BackendError::fatal(op, "no worker command configured"));
        }
        if self.children(op)?.contains_key(job) {
            return Err(BackendError::fatal(op, format!("{} is still running", job)));
        }
        let dir = self.job_dir(job);
        if !dir.is_dir() {
            return Err(BackendError::fatal(op, format!("{} not found on backend", job)));
        }
        self.launch(op, job, &dir)
    }

    fn remote_cleanup(&self, job: &JobPath) -> BackendResult<()> {
        let op = "remote_cleanup";
        if self.children(op)?.contains_key(job) {
            return Err(BackendError::fatal(op, format!("{} is still running", job)));
        }
        let dir = self.job_dir(job);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| BackendError::transient(op, e.to_string()))?;
        }
        Ok(())
    }

    fn scheduled_job_count(&self) -> BackendResult<usize> {
        let op = "scheduled_job_count";
        self.reap(op)?;
        Ok(self.children(op)?.len())
    }
}
