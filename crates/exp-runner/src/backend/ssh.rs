use exp_core::JobPath;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    BackendError, BackendResult, ComputeBackend, JOB_FAILED, JOB_FINISHED, JOB_PID, JOB_STARTED,
    PARTIAL_SUFFIX, START_SCRIPT,
};
use crate::job::{JobManifest, MANIFEST_FILE, OUTPUT_DIR};

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Cluster login node reached over `ssh`/`scp`. Each submitted job directory
/// carries a `start_computation.sh` that wraps the worker with the launch
/// prefix (e.g. `srun`) and leaves the status markers behind.
pub struct SshBackend {
    address: String,
    remote_dir: String,
    launch_prefix: String,
    worker_command: Vec<String>,
    queue_count_command: String,
    timeout: Duration,
}

impl SshBackend {
    pub fn new(
        address: &str,
        remote_dir: &str,
        launch_prefix: &str,
        worker_command: Vec<String>,
        queue_count_command: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            address: address.to_string(),
            remote_dir: remote_dir.trim_end_matches('/').to_string(),
            launch_prefix: launch_prefix.trim().to_string(),
            worker_command,
            queue_count_command: queue_count_command.to_string(),
            timeout,
        }
    }

    fn remote_job_dir(&self, job: &JobPath) -> String {
        format!("{}/{}/{}", self.remote_dir, job.scenario, job.dir_name)
    }

    fn ssh(&self, op: &str, remote_command: &str) -> BackendResult<String> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.address)
            .arg(remote_command);
        run_with_deadline(op, cmd, self.timeout)
    }

    fn scp(&self, op: &str, from: &str, to: &str) -> BackendResult<String> {
        let mut cmd = Command::new("scp");
        cmd.arg("-q").arg("-r").arg("-o").arg("BatchMode=yes").arg(from).arg(to);
        run_with_deadline(op, cmd, self.timeout)
    }

    pub fn start_script(&self, manifest: &JobManifest, job: &JobPath) -> String {
        let dir = self.remote_job_dir(job);
        let stdout = format!("{}/{}/{}stdout-", dir, OUTPUT_DIR, manifest.log_prefix);
        let stderr = format!("{}/{}/{}stderr.txt", dir, OUTPUT_DIR, manifest.log_prefix);
        let mut worker = self.worker_command.clone();
        worker.push(manifest.action.clone());
        worker.push(dir.clone());
        let launch = if self.launch_prefix.is_empty() {
            format!(
                "{} > {} 2> {}",
                shell_join(&worker),
                format!("{}$$.txt", shell_quote(&stdout)),
                shell_quote(&stderr)
            )
        } else {
            let mut parts = vec![self.launch_prefix.clone()];
            if let Some(memory) = &manifest.memory {
                parts.push(format!("--mem={}", shell_quote(memory)));
            }
            parts.push(format!("--output={}", shell_quote(&format!("{}%j.txt", stdout))));
            parts.push(format!("--error={}", shell_quote(&stderr)));
            parts.push(shell_join(&worker));
            parts.join(" ")
        };
        format!(
            "#!/bin/bash\n\
             cd {dir} || exit 1\n\
             echo $$ > {pid}\n\
             touch {started}\n\
             {launch}\n\
             if [ $? -eq 0 ]; then touch {finished}; else touch {failed}; fi\n",
            dir = shell_quote(&dir),
            pid = JOB_PID,
            started = JOB_STARTED,
            launch = launch,
            finished = JOB_FINISHED,
            failed = JOB_FAILED,
        )
    }

    /// Remote check run before every upload. Prints `fresh` (upload into a
    /// new `.partial` dir), `staged` (this staging is in place but never
    /// started) or `started`; exits 3 when another submission owns the dir.
    pub fn submit_guard(&self, manifest: &JobManifest, job: &JobPath) -> String {
        let remote = self.remote_job_dir(job);
        let partial = format!("{}{}", remote, PARTIAL_SUFFIX);
        format!(
            "mkdir -p {scenario} && rm -rf {partial} && \
             if [ -d {remote} ]; then \
               if grep -qF {staged_at} {remote}/{manifest} 2>/dev/null; then \
                 if [ -f {remote}/{started} ]; then echo started; else echo staged; fi; \
               else echo 'job directory holds another submission' >&2; exit 3; fi; \
             else mkdir {partial} && echo fresh; fi",
            scenario = shell_quote(&format!("{}/{}", self.remote_dir, job.scenario)),
            partial = shell_quote(&partial),
            remote = shell_quote(&remote),
            staged_at = shell_quote(&manifest.staged_at),
            manifest = MANIFEST_FILE,
            started = JOB_STARTED,
        )
    }

    fn detach_start(&self, op: &str, job: &JobPath) -> BackendResult<()> {
        let dir = shell_quote(&self.remote_job_dir(job));
        self.ssh(
            op,
            &format!(
                "cd {dir} && rm -f {s} {f} {x} {p} && chmod +x {script} && \
                 nohup ./{script} > /dev/null 2>&1 < /dev/null &",
                dir = dir,
                s = JOB_STARTED,
                f = JOB_FINISHED,
                x = JOB_FAILED,
                p = JOB_PID,
                script = START_SCRIPT
            ),
        )?;
        Ok(())
    }

    fn list_marker(&self, op: &str, marker: &str) -> BackendResult<Vec<JobPath>> {
        let out = self.ssh(
            op,
            &format!(
                "find {} -mindepth 3 -maxdepth 3 -name {} 2>/dev/null || true",
                shell_quote(&self.remote_dir),
                marker
            ),
        )?;
        Ok(parse_listing(&out, &format!("/{}", marker)))
    }
}

impl ComputeBackend for SshBackend {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn submit(&self, job: &JobPath, staged_dir: &Path) -> BackendResult<()> {
        let op = "submit";
        let manifest =
            JobManifest::read(staged_dir).map_err(|e| BackendError::fatal(op, e.to_string()))?;
        fs::write(staged_dir.join(START_SCRIPT), self.start_script(&manifest, job))
            .map_err(|e| BackendError::fatal(op, e.to_string()))?;
        let remote = self.remote_job_dir(job);
        let state = self.ssh(op, &self.submit_guard(&manifest, job))?;
        match state.trim() {
            "started" => {
                debug!(job = %job, "already submitted");
                return Ok(());
            }
            "staged" => debug!(job = %job, "upload already in place; starting"),
            _ => {
                let partial = format!("{}{}", remote, PARTIAL_SUFFIX);
                self.scp(
                    op,
                    &format!("{}/.", staged_dir.display()),
                    &format!("{}:{}", self.address, partial),
                )?;
                self.ssh(
                    op,
                    &format!("mv {} {}", shell_quote(&partial), shell_quote(&remote)),
                )?;
            }
        }
        self.detach_start(op, job)?;
        info!(job = %job, address = %self.address, "job submitted");
        Ok(())
    }

    fn list_finished(&self) -> BackendResult<Vec<JobPath>> {
        self.list_marker("list_finished", JOB_FINISHED)
    }

    fn list_failed(&self) -> BackendResult<Vec<JobPath>> {
        self.list_marker("list_failed", JOB_FAILED)
    }

    fn list_interrupted(&self) -> BackendResult<Vec<JobPath>> {
        let script = format!(
            "for d in {root}/*/*/; do \
               [ -f \"$d{s}\" ] || continue; \
               [ -f \"$d{f}\" ] && continue; \
               [ -f \"$d{x}\" ] && continue; \
               pid=$(cat \"$d{p}\" 2>/dev/null); \
               if [ -z \"$pid\" ] || ! kill -0 \"$pid\" 2>/dev/null; then echo \"$d\"; fi; \
             done",
            root = shell_quote(&self.remote_dir),
            s = JOB_STARTED,
            f = JOB_FINISHED,
            x = JOB_FAILED,
            p = JOB_PID
        );
        let out = self.ssh("list_interrupted", &script)?;
        Ok(parse_listing(&out, "/"))
    }

    fn list_not_started(&self) -> BackendResult<Vec<JobPath>> {
        let script = format!(
            "for d in {root}/*/*/; do \
               [ -d \"$d\" ] || continue; \
               [ -f \"$d{s}\" ] || [ -f \"$d{f}\" ] || [ -f \"$d{x}\" ] || echo \"$d\"; \
             done",
            root = shell_quote(&self.remote_dir),
            s = JOB_STARTED,
            f = JOB_FINISHED,
            x = JOB_FAILED
        );
        let out = self.ssh("list_not_started", &script)?;
        Ok(parse_listing(&out, "/"))
    }

    fn fetch(&self, job: &JobPath, dest: &Path) -> BackendResult<()> {
        let op = "fetch";
        fs::create_dir_all(dest).map_err(|e| BackendError::fatal(op, e.to_string()))?;
        self.scp(
            op,
            &format!("{}:{}/.", self.address, self.remote_job_dir(job)),
            &dest.display().to_string(),
        )?;
        debug!(job = %job, dest = %dest.display(), "fetched");
        Ok(())
    }

    fn cancel(&self, job: &JobPath) -> BackendResult<()> {
        let dir = shell_quote(&self.remote_job_dir(job));
        self.ssh(
            "cancel",
            &format!(
                "cd {dir} && pid=$(cat {p}) && pkill -P \"$pid\"; kill \"$pid\"; touch {x}",
                dir = dir,
                p = JOB_PID,
                x = JOB_FAILED
            ),
        )?;
        Ok(())
    }

    fn restart(&self, job: &JobPath) -> BackendResult<()> {
        self.detach_start("restart", job)?;
        info!(job = %job, "job restarted");
        Ok(())
    }

    fn remote_cleanup(&self, job: &JobPath) -> BackendResult<()> {
        self.ssh(
            "remote_cleanup",
            &format!("rm -rf {}", shell_quote(&self.remote_job_dir(job))),
        )?;
        Ok(())
    }

    fn scheduled_job_count(&self) -> BackendResult<usize> {
        let op = "scheduled_job_count";
        let out = self.ssh(op, &self.queue_count_command)?;
        out.trim()
            .parse::<usize>()
            .map_err(|_| BackendError::fatal(op, format!("unexpected queue count '{}'", out.trim())))
    }
}

/// Turns one absolute remote path per line into job paths; `suffix` is
/// stripped first. Lines that do not name a job directory are skipped.
pub fn parse_listing(out: &str, suffix: &str) -> Vec<JobPath> {
    let mut jobs: Vec<JobPath> = out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let dir = line.strip_suffix(suffix).unwrap_or(line);
            if dir.trim_end_matches('/').ends_with(PARTIAL_SUFFIX) {
                return None;
            }
            match JobPath::parse(dir) {
                Ok(job) => Some(job),
                Err(err) => {
                    warn!(line, error = %err, "ignoring unexpected listing line");
                    None
                }
            }
        })
        .collect();
    jobs.sort();
    jobs.dedup();
    jobs
}

/// Runs `cmd` to completion or kills it at the deadline. Output pipes are
/// drained on helper threads so a chatty child cannot block on a full pipe.
fn run_with_deadline(op: &str, mut cmd: Command, timeout: Duration) -> BackendResult<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| BackendError::fatal(op, format!("spawn failed: {}", e)))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let drain = |pipe: Option<Box<dyn Read + Send>>| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = pipe {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        })
    };
    let out_reader = drain(stdout.map(|p| Box::new(p) as Box<dyn Read + Send>));
    let err_reader = drain(stderr.map(|p| Box::new(p) as Box<dyn Read + Send>));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BackendError::Timeout {
                        op: op.to_string(),
                        after: timeout,
                    });
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(BackendError::transient(op, err.to_string())),
        }
    };
    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();
    if status.success() {
        return Ok(String::from_utf8_lossy(&stdout).into_owned());
    }
    let tail = String::from_utf8_lossy(&stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no stderr")
        .to_string();
    match status.code() {
        Some(SSH_CONNECTION_FAILURE) => Err(BackendError::transient(op, tail)),
        Some(code) => Err(BackendError::fatal(op, format!("exit {}: {}", code, tail))),
        None => Err(BackendError::transient(op, format!("killed by signal: {}", tail))),
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=%".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
