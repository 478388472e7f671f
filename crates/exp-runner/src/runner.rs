use anyhow::{anyhow, Context, Result};
use exp_core::{ensure_dir, JobPath, Timestamp};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::batch::{load_config_value, BatchConfig, BatchKind};
use crate::orchestrator::{CheckReport, Orchestrator};
use crate::retry::with_retry;
use crate::settings::{CallPolicy, Settings};
use crate::stager::sorted_files;

const SLEEP_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct IngestedBatch {
    pub file: String,
    pub archived_as: PathBuf,
    pub submitted: Vec<JobPath>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct TickReport {
    pub iteration: u64,
    pub ingested: Vec<IngestedBatch>,
    pub check: Option<CheckReport>,
    pub started: Vec<JobPath>,
    pub scheduled_on_backend: Option<usize>,
}

/// Single-threaded polling loop: ingest batch files, reconcile every
/// `reconcile_every` ticks, report liveness every `liveness_every` ticks.
pub struct Runner {
    orchestrator: Orchestrator,
    watch_dir: PathBuf,
    processed_dir: PathBuf,
    poll_interval: Duration,
    reconcile_every: u64,
    liveness_every: u64,
    policy: CallPolicy,
    shutdown: Arc<AtomicBool>,
    /// Stamp of the last ingested batch; the next one is always later.
    last_stamp: Option<Timestamp>,
}

impl Runner {
    pub fn new(orchestrator: Orchestrator, settings: &Settings) -> Self {
        Self {
            orchestrator,
            watch_dir: settings.watch_dir(),
            processed_dir: settings.processed_dir(),
            poll_interval: settings.poll_interval(),
            reconcile_every: settings.runner.reconcile_every.max(1),
            liveness_every: settings.runner.liveness_every.max(1),
            policy: settings.calls.clone(),
            shutdown: Arc::new(AtomicBool::new(false)),
            last_stamp: None,
        }
    }

    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut Orchestrator {
        &mut self.orchestrator
    }

    pub fn run(&mut self) -> Result<()> {
        ensure_dir(&self.watch_dir)?;
        ensure_dir(&self.processed_dir)?;
        info!(
            watch_dir = %self.watch_dir.display(),
            interval_secs = self.poll_interval.as_secs(),
            "runner started"
        );
        let mut iteration: u64 = 0;
        while !self.shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.tick(iteration);
            debug!(iteration, elapsed_ms = started.elapsed().as_millis() as u64, "tick done");
            iteration += 1;
            self.sleep_interval();
        }
        self.orchestrator.flush_ledger()?;
        info!(iterations = iteration, "runner stopped");
        Ok(())
    }

    /// One pass of the loop. Failures are logged and never end the loop.
    pub fn tick(&mut self, iteration: u64) -> TickReport {
        let mut report = TickReport {
            iteration,
            ..TickReport::default()
        };
        match self.ingest() {
            Ok(ingested) => report.ingested = ingested,
            Err(err) => error!(error = %format!("{:#}", err), "ingesting batch files failed"),
        }
        if iteration % self.reconcile_every == 0 {
            match self.orchestrator.check_finished() {
                Ok(check) => report.check = Some(check),
                Err(err) => error!(error = %format!("{:#}", err), "checking finished jobs failed"),
            }
        }
        if !self.orchestrator.pending().is_empty() {
            report.started = self.orchestrator.start_jobs();
        }
        if iteration > 0 && iteration % self.liveness_every == 0 {
            let backend = self.orchestrator.backend();
            match with_retry(&self.policy, "scheduled_job_count", || backend.scheduled_job_count()) {
                Ok(count) => {
                    info!(iteration, scheduled = count, pending = self.orchestrator.pending().len(), "runner alive");
                    report.scheduled_on_backend = Some(count);
                }
                Err(err) => warn!(iteration, error = %err, "runner alive; backend queue unavailable"),
            }
        }
        report
    }

    /// Consumes every batch file in the watch directory exactly once: each is
    /// processed, then moved to the processed directory under a timestamp
    /// prefix (with `rejected-` when it could not be scheduled).
    pub fn ingest(&mut self) -> Result<Vec<IngestedBatch>> {
        let mut out = Vec::new();
        for file in sorted_files(&self.watch_dir)? {
            let Some(name) = file.file_name().and_then(|s| s.to_str()).map(|s| s.to_string())
            else {
                continue;
            };
            if name.starts_with('.') || !is_batch_file(&file) {
                continue;
            }
            let stamp = self.next_stamp()?;
            let outcome = self.process(&name, &file, &stamp);
            let archived_as = self.archive(&file, &name, &stamp, outcome.is_err())?;
            match outcome {
                Ok(submitted) => {
                    info!(file = %name, submitted = submitted.len(), "batch scheduled");
                    out.push(IngestedBatch {
                        file: name,
                        archived_as,
                        submitted,
                        error: None,
                    });
                }
                Err(err) => {
                    error!(file = %name, error = %format!("{:#}", err), "batch rejected");
                    out.push(IngestedBatch {
                        file: name,
                        archived_as,
                        submitted: Vec::new(),
                        error: Some(format!("{:#}", err)),
                    });
                }
            }
        }
        Ok(out)
    }

    /// The current time, bumped past the previous batch when two files
    /// are ingested within the same second.
    fn next_stamp(&mut self) -> Result<Timestamp> {
        let now = Timestamp::now();
        let stamp = match &self.last_stamp {
            Some(last) if &now <= last => last.next_second()?,
            _ => now,
        };
        self.last_stamp = Some(stamp.clone());
        Ok(stamp)
    }

    fn process(&mut self, name: &str, file: &Path, stamp: &Timestamp) -> Result<Vec<JobPath>> {
        match BatchKind::from_file_name(name) {
            Some(BatchKind::EvaluationSweep) => {
                let config = load_config_value(file)?;
                let jobs = self
                    .orchestrator
                    .declare_evaluation_sweep(config, None, false)?;
                self.orchestrator.flush_ledger()?;
                Ok(self.orchestrator.submit(&jobs))
            }
            Some(kind) => {
                let batch = BatchConfig::load(file)?;
                self.orchestrator.schedule_batch(kind, &batch, stamp)
            }
            None => Err(anyhow!(
                "'{}' does not start with a known batch prefix (do, rap, expl)",
                name
            )),
        }
    }

    fn archive(&self, file: &Path, name: &str, stamp: &Timestamp, rejected: bool) -> Result<PathBuf> {
        ensure_dir(&self.processed_dir)?;
        let archived_name = if rejected {
            format!("{}-rejected-{}", stamp, name)
        } else {
            format!("{}-{}", stamp, name)
        };
        let dest = self.processed_dir.join(archived_name);
        if fs::rename(file, &dest).is_err() {
            fs::copy(file, &dest).with_context(|| format!("archiving {}", file.display()))?;
            fs::remove_file(file).with_context(|| format!("removing {}", file.display()))?;
        }
        Ok(dest)
    }

    fn sleep_interval(&self) {
        let deadline = Instant::now() + self.poll_interval;
        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

fn is_batch_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("json") | Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::ledger::MemoryLedgerStore;
    use chrono::Utc;

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "exprunner_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn runner(root: &Path) -> Runner {
        let settings = Settings::from_yaml(&format!(
            r#"
results_root: {root}/results
games_root: {root}/games
staging_root: {root}/staging
fetch_root: {root}/fetch
backend:
  kind: local
  remote_root: {root}/remote
calls:
  retries: 0
  backoff_ms: 0
runner:
  watch_dir: {root}/inbox
  processed_dir: {root}/processed
  poll_interval_secs: 0
  reconcile_every: 2
"#,
            root = root.display()
        ))
        .expect("settings");
        ensure_dir(&root.join("games")).expect("games");
        fs::write(root.join("games/g1.json"), b"{}").expect("game");
        ensure_dir(&settings.watch_dir()).expect("inbox");
        let backend = LocalBackend::new(root.join("remote"), Vec::new()).expect("backend");
        let orchestrator =
            Orchestrator::new(&settings, Box::new(backend), Box::new(MemoryLedgerStore::new()))
                .expect("orchestrator");
        Runner::new(orchestrator, &settings)
    }

    #[test]
    fn batch_files_are_consumed_once_and_archived() {
        let root = temp_root("ingest");
        let mut runner = runner(&root);
        fs::write(
            root.join("inbox/do_first.yaml"),
            "scenarios: [g1]\ntemplates:\n  - name: cfg\n    heuristic: __HEUR__\nparametersGrid:\n  HEUR: [a, b]\n",
        )
        .expect("batch");
        fs::write(root.join("inbox/notes.json"), b"{}").expect("junk");
        fs::write(root.join("inbox/do_broken.json"), b"{not json").expect("broken");
        fs::write(root.join("inbox/readme.txt"), b"ignored").expect("txt");

        let ingested = runner.ingest().expect("ingest");
        assert_eq!(ingested.len(), 3);
        let first = ingested.iter().find(|b| b.file == "do_first.yaml").expect("first");
        assert_eq!(first.submitted.len(), 2);
        assert!(first.error.is_none());
        let archived = first.archived_as.file_name().and_then(|s| s.to_str()).expect("name");
        assert!(archived.ends_with("-do_first.yaml") && !archived.contains("rejected"));

        for rejected in ["notes.json", "do_broken.json"] {
            let b = ingested.iter().find(|b| b.file == rejected).expect("rejected");
            assert!(b.error.is_some());
            assert!(b
                .archived_as
                .to_string_lossy()
                .ends_with(&format!("-rejected-{}", rejected)));
        }
        assert!(root.join("inbox/readme.txt").exists());
        assert!(runner.ingest().expect("second pass").is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn batches_ingested_together_get_distinct_timestamps() {
        let root = temp_root("stamps");
        let mut runner = runner(&root);
        let batch = "scenarios: [g1]\ntemplates:\n  - name: cfg\n    heuristic: __HEUR__\nparametersGrid:\n  HEUR: [a]\n";
        fs::write(root.join("inbox/do_one.yaml"), batch).expect("one");
        fs::write(root.join("inbox/do_two.yaml"), batch).expect("two");

        let ingested = runner.ingest().expect("ingest");
        assert_eq!(ingested.len(), 2);
        assert!(ingested.iter().all(|b| b.error.is_none() && b.submitted.len() == 1));
        let one = &ingested[0].submitted[0];
        let two = &ingested[1].submitted[0];
        assert_ne!(one, two);
        let stamp = |p: &JobPath| p.identity().expect("identity").timestamp;
        assert!(stamp(one) < stamp(two));
        assert_ne!(ingested[0].archived_as, ingested[1].archived_as);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reconcile_runs_on_every_nth_tick() {
        let root = temp_root("ticks");
        let mut runner = runner(&root);
        assert!(runner.tick(0).check.is_some());
        assert!(runner.tick(1).check.is_none());
        assert!(runner.tick(2).check.is_some());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn run_returns_once_shutdown_is_requested() {
        let root = temp_root("shutdown");
        let mut runner = runner(&root);
        let flag = runner.shutdown_handle();
        flag.store(true, Ordering::SeqCst);
        runner.run().expect("run");
        assert!(root.join("processed").is_dir());
        let _ = fs::remove_dir_all(root);
    }
}
