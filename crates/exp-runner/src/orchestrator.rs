use anyhow::{anyhow, Context, Result};
use exp_core::{
    atomic_write_json_pretty, load_json_file, split_dir_name, CoreError, JobIdentity, JobPath,
    LedgerKey, Timestamp,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::backend::{self, ComputeBackend, JOB_FAILED, JOB_FINISHED};
use crate::batch::{BatchConfig, BatchKind, EvaluationConfig, NextEntry};
use crate::job::{
    InputRef, Job, JobKind, JobManifest, JobState, GAME_FILE, NEXT_FILE, PRIMARY_RESULTS,
};
use crate::ledger::{AttemptStatus, JobLedger, JsonFileLedgerStore, LedgerStore};
use crate::retry::with_retry;
use crate::settings::{CallPolicy, Settings};
use crate::stager::{sorted_dirs, JobStager};
use crate::stats::{CommandStatsGenerator, StatsGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    NotReady,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReconciliation {
    pub path: JobPath,
    pub outcome: ReconcileOutcome,
    pub kinds: Vec<(JobKind, ReconcileOutcome)>,
    pub next: Vec<NextEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedDir {
    pub dir: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Reconciliation {
    pub jobs: Vec<JobReconciliation>,
    pub rejected: Vec<RejectedDir>,
}

impl Reconciliation {
    /// Follow-up manifests of fully finished jobs, one per job directory.
    pub fn next_jobs(&self) -> Vec<NextJobs> {
        self.jobs
            .iter()
            .filter(|j| j.outcome == ReconcileOutcome::Finished && !j.next.is_empty())
            .map(|j| NextJobs {
                path: j.path.clone(),
                entries: j.next.clone(),
            })
            .collect()
    }

    pub fn count(&self, outcome: ReconcileOutcome) -> usize {
        self.jobs.iter().filter(|j| j.outcome == outcome).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextJobs {
    pub path: JobPath,
    pub entries: Vec<NextEntry>,
}

/// Result of one fetch/reconcile/schedule pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub failed: Vec<JobPath>,
    pub fetched: Vec<JobPath>,
    pub reconciliation: Reconciliation,
    pub submitted: Vec<JobPath>,
}

/// Drives jobs from declaration to reconciliation. Owns the ledger and the
/// local job state; the backend only shares each job directory's lifetime.
pub struct Orchestrator {
    results_root: PathBuf,
    games_root: PathBuf,
    fetch_root: PathBuf,
    stager: JobStager,
    ledger: JobLedger,
    store: Box<dyn LedgerStore>,
    backend: Box<dyn ComputeBackend>,
    stats: Option<Box<dyn StatsGenerator>>,
    policy: CallPolicy,
    to_start: Vec<JobPath>,
    states: BTreeMap<JobPath, JobState>,
    /// Evaluations waiting for the one already running in the same job
    /// directory. In memory only.
    deferred: BTreeMap<JobPath, VecDeque<(String, Value)>>,
}

impl Orchestrator {
    pub fn new(
        settings: &Settings,
        backend: Box<dyn ComputeBackend>,
        store: Box<dyn LedgerStore>,
    ) -> Result<Self> {
        let ledger = store.load()?;
        let mut orchestrator = Self {
            results_root: settings.results_root.clone(),
            games_root: settings.games_root.clone(),
            fetch_root: settings.fetch_root.clone(),
            stager: JobStager::new(
                &settings.staging_root,
                &settings.results_root,
                settings.worker_config_file.clone(),
            ),
            ledger,
            store,
            backend,
            stats: None,
            policy: settings.calls.clone(),
            to_start: Vec::new(),
            states: BTreeMap::new(),
            deferred: BTreeMap::new(),
        };
        // Staged but never submitted jobs survive a restart.
        for path in orchestrator.stager.staged_paths()? {
            debug!(job = %path, "re-queueing staged job");
            orchestrator.states.insert(path.clone(), JobState::Staged);
            orchestrator.to_start.push(path);
        }
        Ok(orchestrator)
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let backend = backend::from_settings(settings)?;
        let store = Box::new(JsonFileLedgerStore::new(settings.ledger_path()));
        let mut orchestrator = Self::new(settings, backend, store)?;
        if let Some(command) = &settings.stats_command {
            orchestrator.stats = Some(Box::new(CommandStatsGenerator::new(command.clone())?));
        }
        Ok(orchestrator)
    }

    pub fn with_stats(mut self, stats: Box<dyn StatsGenerator>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    pub fn pending(&self) -> &[JobPath] {
        &self.to_start
    }

    pub fn job_states(&self) -> &BTreeMap<JobPath, JobState> {
        &self.states
    }

    /// Names of the evaluations queued behind the one in flight for `path`.
    pub fn queued_evaluations(&self, path: &JobPath) -> Vec<String> {
        self.deferred
            .get(path)
            .map(|q| q.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn flush_ledger(&self) -> Result<()> {
        self.store.flush(&self.ledger)
    }

    /// `<games_root>/<scenario>/game.json`, or `<games_root>/<scenario>.json`
    /// when there is no per-scenario directory.
    fn game_file(&self, scenario: &str) -> PathBuf {
        let nested = self.games_root.join(scenario).join(GAME_FILE);
        if nested.is_file() {
            nested
        } else {
            self.games_root.join(format!("{}.json", scenario))
        }
    }

    /// Expands a batch into jobs (scenarios x templates x grid) sharing
    /// `timestamp`, and records each as a started ledger attempt. Nothing is
    /// recorded when any part of the batch is invalid.
    pub fn declare_batch(
        &mut self,
        kind: BatchKind,
        batch: &BatchConfig,
        timestamp: &Timestamp,
    ) -> Result<Vec<Job>> {
        let job_kind = match kind {
            BatchKind::Primary => JobKind::Primary,
            BatchKind::Planner => JobKind::Planner,
            BatchKind::EvaluationSweep => {
                return Err(anyhow!("evaluation sweeps are declared with declare_evaluation_sweep"))
            }
        };
        let templates = batch.parsed_templates()?;
        let combinations = batch.combinations()?;
        for scenario in &batch.scenarios {
            let game = self.game_file(scenario);
            if !game.is_file() {
                return Err(anyhow!(
                    "scenario '{}' has no game file at {}",
                    scenario,
                    game.display()
                ));
            }
        }

        let mut jobs = Vec::new();
        let mut seen = BTreeSet::new();
        for scenario in &batch.scenarios {
            for template in &templates {
                for params in &combinations {
                    let config = template.resolve(params)?;
                    let identity = JobIdentity::new(
                        scenario,
                        &template.name,
                        params.clone(),
                        timestamp.clone(),
                    );
                    let path = identity.job_path();
                    if !seen.insert(path.clone()) {
                        return Err(anyhow!("batch declares {} more than once", path));
                    }
                    jobs.push(Job {
                        identity,
                        kind: job_kind.clone(),
                        config,
                        inputs: vec![InputRef {
                            source: self.game_file(scenario),
                            file_name: GAME_FILE.to_string(),
                        }],
                        next: batch.next.clone(),
                        memory: batch.memory.clone(),
                        note: batch.note.clone(),
                    });
                }
            }
        }

        for job in &jobs {
            self.ledger
                .record_attempt(&job.identity.ledger_key(), &job.identity.timestamp, &job.note);
            self.states.insert(job.path(), JobState::Declared);
        }
        info!(kind = kind.as_str(), jobs = jobs.len(), timestamp = %timestamp, "batch declared");
        Ok(jobs)
    }

    /// Stages each job and queues it for submission. A job that cannot be
    /// staged is marked failed and left out; the others proceed. A job whose
    /// directory is already staged belongs to an earlier declaration and is
    /// only logged.
    pub fn stage(&mut self, jobs: &[Job]) -> Vec<JobPath> {
        let mut staged = Vec::new();
        for job in jobs {
            let path = job.path();
            if self.stager.staged_dir(&path).exists() {
                error!(job = %path, "job directory already staged; declaration skipped");
                if self.states.get(&path) == Some(&JobState::Declared) {
                    self.states.remove(&path);
                }
                continue;
            }
            match self.stager.stage(job) {
                Ok(dir) => {
                    debug!(job = %path, dir = %dir.display(), "staged");
                    self.states.insert(path.clone(), JobState::Staged);
                    self.to_start.push(path.clone());
                    staged.push(path);
                }
                Err(err) => {
                    error!(job = %path, error = %format!("{:#}", err), "staging failed");
                    let key = job.identity.ledger_key();
                    self.settle_failure(&path, &key, &job.identity.timestamp, Some(&job.kind));
                }
            }
        }
        staged
    }

    /// Submits every queued job. A retryable failure keeps the job queued
    /// for the next call; a fatal one drops it and marks it failed. An
    /// evaluation's sub-task is marked started once its job is submitted.
    pub fn start_jobs(&mut self) -> Vec<JobPath> {
        let queued = std::mem::take(&mut self.to_start);
        let mut started = Vec::new();
        for path in queued {
            let dir = self.stager.staged_dir(&path);
            let kind = JobManifest::read(&dir).ok().map(|m| m.kind);
            let submitted = with_retry(&self.policy, "submit", || self.backend.submit(&path, &dir));
            match submitted {
                Ok(()) => {
                    if let Err(err) = self.stager.discard(&path) {
                        warn!(job = %path, error = %err, "staged copy not removed");
                    }
                    self.note_sub_task_started(&path, kind.as_ref());
                    info!(job = %path, backend = self.backend.name(), "submitted");
                    self.states.insert(path.clone(), JobState::Submitted);
                    started.push(path);
                }
                Err(err) if err.is_retryable() => {
                    error!(job = %path, error = %err, "submission failed; job stays queued");
                    self.to_start.push(path);
                }
                Err(err) => {
                    error!(job = %path, error = %err, "submission refused; job dropped");
                    if let Err(err) = self.stager.discard(&path) {
                        warn!(job = %path, error = %err, "staged copy not removed");
                    }
                    match path.identity() {
                        Ok(identity) => {
                            let key = identity.ledger_key();
                            self.settle_failure(&path, &key, &identity.timestamp, kind.as_ref());
                        }
                        Err(_) => {
                            self.states.insert(path, JobState::Failed);
                        }
                    }
                }
            }
        }
        if let Err(err) = self.flush_ledger() {
            error!(error = %format!("{:#}", err), "ledger flush failed");
        }
        started
    }

    fn note_sub_task_started(&mut self, path: &JobPath, kind: Option<&JobKind>) {
        let Some(sub_task) = kind.and_then(|k| k.sub_task_name()) else {
            return;
        };
        let Ok(identity) = path.identity() else {
            return;
        };
        if !self
            .ledger
            .mark_sub_task_started(&identity.ledger_key(), &identity.timestamp, &sub_task)
        {
            debug!(job = %path, sub_task, "no ledger attempt to attach the evaluation to");
        }
    }

    pub fn submit(&mut self, jobs: &[Job]) -> Vec<JobPath> {
        self.stage(jobs);
        self.start_jobs()
    }

    /// Declare, stage and submit a batch in one step.
    pub fn schedule_batch(
        &mut self,
        kind: BatchKind,
        batch: &BatchConfig,
        timestamp: &Timestamp,
    ) -> Result<Vec<JobPath>> {
        let jobs = self.declare_batch(kind, batch, timestamp)?;
        self.flush_ledger()?;
        Ok(self.submit(&jobs))
    }

    /// An evaluation of a finished primary job. It reuses the parent's
    /// identity and directory; the `evaluation:<name>` sub-task is recorded
    /// when the job is submitted.
    pub fn declare_evaluation(&mut self, path: &JobPath, config: Value) -> Result<Job> {
        let identity = path.identity()?;
        let eval = EvaluationConfig::from_value(config)?;
        let results_dir = self.stager.results_dir(path);
        let all_results = results_dir.join(PRIMARY_RESULTS);
        if !all_results.is_file() {
            return Err(CoreError::InconsistentData(format!(
                "cannot evaluate {}: no {} in {}",
                path,
                PRIMARY_RESULTS,
                results_dir.display()
            ))
            .into());
        }
        let kind = JobKind::Evaluation {
            name: eval.name.clone(),
        };
        let mut inputs = vec![InputRef {
            source: all_results,
            file_name: PRIMARY_RESULTS.to_string(),
        }];
        let stored_game = results_dir.join(GAME_FILE);
        let game = if stored_game.is_file() {
            stored_game
        } else {
            self.game_file(&identity.scenario)
        };
        inputs.push(InputRef {
            source: game,
            file_name: GAME_FILE.to_string(),
        });
        self.states.insert(path.clone(), JobState::Declared);
        Ok(Job {
            identity,
            kind,
            config: eval.raw,
            inputs,
            next: eval.next,
            memory: eval.memory,
            note: String::new(),
        })
    }

    /// Evaluations for every finished primary job, optionally restricted to
    /// one batch timestamp. Jobs that already carry this evaluation are
    /// skipped unless `rerun`.
    pub fn declare_evaluation_sweep(
        &mut self,
        config: Value,
        timestamp: Option<&Timestamp>,
        rerun: bool,
    ) -> Result<Vec<Job>> {
        let eval = EvaluationConfig::from_value(config.clone())?;
        let marker = JobKind::Evaluation {
            name: eval.name.clone(),
        }
        .marker();
        let mut jobs = Vec::new();
        for path in self.finished_primary_jobs()? {
            if let Some(filter) = timestamp {
                match split_dir_name(&path.dir_name) {
                    Ok((_, ts)) if &ts == filter => {}
                    _ => continue,
                }
            }
            if !rerun && self.stager.results_dir(&path).join(&marker).is_file() {
                debug!(job = %path, evaluation = %eval.name, "already evaluated");
                continue;
            }
            jobs.push(self.declare_evaluation(&path, config.clone())?);
        }
        info!(evaluation = %eval.name, jobs = jobs.len(), "evaluation sweep declared");
        Ok(jobs)
    }

    /// Job paths in the results tree that hold primary results.
    pub fn finished_primary_jobs(&self) -> Result<Vec<JobPath>> {
        let mut out = Vec::new();
        for scenario in sorted_dirs(&self.results_root)? {
            for dir in sorted_dirs(&scenario)? {
                if !dir.join(PRIMARY_RESULTS).is_file() {
                    continue;
                }
                let path = JobPath::parse(&dir.to_string_lossy())?;
                if let Err(err) = split_dir_name(&path.dir_name) {
                    warn!(dir = %dir.display(), error = %err, "results dir does not name a job");
                    continue;
                }
                out.push(path);
            }
        }
        Ok(out)
    }

    /// Runs one follow-up entry against every finished primary job.
    pub fn chain_on_finished(&mut self, entry: NextEntry) -> Result<Vec<JobPath>> {
        let next: Vec<NextJobs> = self
            .finished_primary_jobs()?
            .into_iter()
            .map(|path| NextJobs {
                path,
                entries: vec![entry.clone()],
            })
            .collect();
        let submitted = self.schedule_next(&next);
        self.flush_ledger()?;
        Ok(submitted)
    }

    /// Marks jobs the backend reports failed. A ledger attempt that already
    /// finished is left alone: that failure belongs to a later stage and is
    /// settled when the directory is reconciled.
    pub fn record_failures(&mut self) -> Result<Vec<JobPath>> {
        let failed = with_retry(&self.policy, "list_failed", || self.backend.list_failed())?;
        let mut newly_failed = Vec::new();
        for path in failed {
            let identity = match path.identity() {
                Ok(identity) => identity,
                Err(err) => {
                    error!(job = %path, error = %err, "failed job has a malformed name");
                    continue;
                }
            };
            let key = identity.ledger_key();
            match self.ledger.status_of(&key, &identity.timestamp) {
                Some(AttemptStatus::Failed) | Some(AttemptStatus::Finished) => {}
                _ => {
                    warn!(job = %path, "job failed on the backend");
                    self.ledger.mark_failed(&key, &identity.timestamp);
                    newly_failed.push(path.clone());
                }
            }
            self.states.insert(path, JobState::Failed);
        }
        self.flush_ledger()?;
        Ok(newly_failed)
    }

    /// Copies every finished or failed backend job into the fetch area.
    pub fn fetch_finished(&mut self) -> Result<Vec<JobPath>> {
        let finished = with_retry(&self.policy, "list_finished", || self.backend.list_finished())?;
        let mut ready: Vec<(JobPath, JobState)> = finished
            .into_iter()
            .map(|path| (path, JobState::Finished))
            .collect();
        for path in with_retry(&self.policy, "list_failed", || self.backend.list_failed())? {
            if !ready.iter().any(|(p, _)| p == &path) {
                ready.push((path, JobState::Failed));
            }
        }
        let mut fetched = Vec::new();
        for (path, state) in ready {
            let dest = path.under(&self.fetch_root);
            match with_retry(&self.policy, "fetch", || self.backend.fetch(&path, &dest)) {
                Ok(()) => {
                    self.states.insert(path.clone(), state);
                    fetched.push(path);
                }
                Err(err) => error!(job = %path, error = %err, "fetch failed"),
            }
        }
        Ok(fetched)
    }

    /// Walks the fetch area and settles every job directory in it: results
    /// copied into the results tree and the ledger updated per kind.
    /// Directories that cannot be decoded are reported in `rejected`.
    pub fn reconcile(&mut self) -> Result<Reconciliation> {
        let mut report = Reconciliation::default();
        for scenario_dir in sorted_dirs(&self.fetch_root)? {
            for dir in sorted_dirs(&scenario_dir)? {
                let path = match JobPath::parse(&dir.to_string_lossy()) {
                    Ok(path) => path,
                    Err(err) => {
                        report.rejected.push(RejectedDir {
                            dir: dir.display().to_string(),
                            error: err.to_string(),
                        });
                        continue;
                    }
                };
                match self.reconcile_job(&path, &dir) {
                    Ok(job) => report.jobs.push(job),
                    Err(err) => {
                        error!(job = %path, error = %format!("{:#}", err), "cannot reconcile");
                        report.rejected.push(RejectedDir {
                            dir: path.to_string(),
                            error: format!("{:#}", err),
                        });
                    }
                }
            }
        }
        self.flush_ledger()?;
        info!(
            finished = report.count(ReconcileOutcome::Finished),
            failed = report.count(ReconcileOutcome::Failed),
            not_ready = report.count(ReconcileOutcome::NotReady),
            rejected = report.rejected.len(),
            "reconciled"
        );
        Ok(report)
    }

    fn reconcile_job(&mut self, path: &JobPath, dir: &Path) -> Result<JobReconciliation> {
        let identity = path.identity()?;
        let key = identity.ledger_key();
        let timestamp = identity.timestamp.clone();

        if dir.join(JOB_FAILED).is_file() && !dir.join(JOB_FINISHED).is_file() {
            let kind = JobManifest::read(dir).ok().map(|m| m.kind);
            self.settle_failure(path, &key, &timestamp, kind.as_ref());
            return Ok(JobReconciliation {
                path: path.clone(),
                outcome: ReconcileOutcome::Failed,
                kinds: kind.map(|k| vec![(k, ReconcileOutcome::Failed)]).unwrap_or_default(),
                next: Vec::new(),
            });
        }

        let kinds = JobKind::detect(dir);
        if kinds.is_empty() {
            debug!(job = %path, "no completion marker yet");
            return Ok(JobReconciliation {
                path: path.clone(),
                outcome: ReconcileOutcome::NotReady,
                kinds: Vec::new(),
                next: Vec::new(),
            });
        }
        let next = match read_next_manifest(dir) {
            Ok(next) => next,
            Err(err) => {
                error!(job = %path, error = %format!("{:#}", err), "completed job without a usable follow-up manifest");
                let kind = JobManifest::read(dir)
                    .ok()
                    .map(|m| m.kind)
                    .or_else(|| kinds.first().cloned());
                self.settle_failure(path, &key, &timestamp, kind.as_ref());
                return Ok(JobReconciliation {
                    path: path.clone(),
                    outcome: ReconcileOutcome::Failed,
                    kinds: kind.map(|k| vec![(k, ReconcileOutcome::Failed)]).unwrap_or_default(),
                    next: Vec::new(),
                });
            }
        };

        let mut outcomes = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match self.stager.collect(&kind, dir, path)? {
                Some(target) => {
                    match kind.sub_task_name() {
                        Some(sub_task) => {
                            self.ledger.mark_sub_task_finished(&key, &timestamp, &sub_task)
                        }
                        None => self.ledger.mark_finished(&key, &timestamp),
                    }
                    info!(job = %path, kind = ?kind, results = %target.display(), "results collected");
                    outcomes.push((kind, ReconcileOutcome::Finished));
                }
                None => outcomes.push((kind, ReconcileOutcome::NotReady)),
            }
        }
        let outcome = if outcomes.iter().all(|(_, o)| *o == ReconcileOutcome::Finished) {
            self.states.insert(path.clone(), JobState::Finished);
            ReconcileOutcome::Finished
        } else {
            ReconcileOutcome::NotReady
        };
        Ok(JobReconciliation {
            path: path.clone(),
            outcome,
            kinds: outcomes,
            next: if outcome == ReconcileOutcome::Finished {
                next
            } else {
                Vec::new()
            },
        })
    }

    fn settle_failure(
        &mut self,
        path: &JobPath,
        key: &LedgerKey,
        timestamp: &Timestamp,
        kind: Option<&JobKind>,
    ) {
        match kind.and_then(|k| k.sub_task_name()) {
            Some(sub_task) => {
                self.ledger.mark_sub_task_failed(key, timestamp, &sub_task);
            }
            None => self.ledger.mark_failed(key, timestamp),
        }
        warn!(job = %path, kind = ?kind, "job failed");
        self.states.insert(path.clone(), JobState::Failed);
    }

    /// Removes settled jobs from the backend and clears the fetch area.
    /// `NotReady` jobs keep their backend copy and are fetched again later.
    pub fn finalize(&mut self, report: &Reconciliation) {
        for job in &report.jobs {
            if job.outcome == ReconcileOutcome::NotReady {
                continue;
            }
            let path = &job.path;
            match with_retry(&self.policy, "remote_cleanup", || self.backend.remote_cleanup(path)) {
                Ok(()) => {
                    self.states.insert(path.clone(), JobState::Reconciled);
                }
                Err(err) => error!(job = %path, error = %err, "remote cleanup failed"),
            }
        }
        if let Err(err) = self.clear_fetch_area() {
            warn!(error = %format!("{:#}", err), "fetch area not cleared");
        }
    }

    fn clear_fetch_area(&self) -> Result<()> {
        for dir in sorted_dirs(&self.fetch_root)? {
            fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
        }
        Ok(())
    }

    /// Dispatches follow-up entries by name prefix: `expl` queues an
    /// evaluation of the finished job, `stats` runs the stats generator.
    /// Evaluations sharing a job directory run one after another; each pass
    /// submits the next queued one for every directory with nothing in
    /// flight. Returns the jobs submitted; per-entry failures are logged.
    pub fn schedule_next(&mut self, next: &[NextJobs]) -> Vec<JobPath> {
        for item in next {
            for entry in &item.entries {
                let name = entry.dispatch_name();
                let config = match entry.load() {
                    Ok(Some(config)) => config,
                    Ok(None) => {
                        warn!(job = %item.path, entry = %name, "follow-up config missing; skipped");
                        continue;
                    }
                    Err(err) => {
                        error!(job = %item.path, entry = %name, error = %format!("{:#}", err), "follow-up config unreadable");
                        continue;
                    }
                };
                if name.starts_with("expl") {
                    self.deferred
                        .entry(item.path.clone())
                        .or_default()
                        .push_back((name, config));
                } else if name.starts_with("stats") {
                    if let Err(err) = self.run_stats(&item.path, &name, &config) {
                        error!(job = %item.path, entry = %name, error = %format!("{:#}", err), "stats failed");
                    }
                } else {
                    warn!(job = %item.path, entry = %name, "unknown follow-up kind; skipped");
                }
            }
        }
        self.release_evaluations()
    }

    fn release_evaluations(&mut self) -> Vec<JobPath> {
        let mut evaluations = Vec::new();
        let paths: Vec<JobPath> = self.deferred.keys().cloned().collect();
        for path in paths {
            if self.in_flight(&path) {
                continue;
            }
            while let Some((name, config)) = self.deferred.get_mut(&path).and_then(|q| q.pop_front()) {
                match self.declare_evaluation(&path, config) {
                    Ok(job) => {
                        evaluations.push(job);
                        break;
                    }
                    Err(err) => {
                        error!(job = %path, entry = %name, error = %format!("{:#}", err), "evaluation not declared")
                    }
                }
            }
            if self.deferred.get(&path).map_or(false, |q| q.is_empty()) {
                self.deferred.remove(&path);
            }
        }
        self.submit(&evaluations)
    }

    fn in_flight(&self, path: &JobPath) -> bool {
        matches!(
            self.states.get(path),
            Some(JobState::Declared)
                | Some(JobState::Staged)
                | Some(JobState::Submitted)
                | Some(JobState::Interrupted)
        )
    }

    fn run_stats(&self, path: &JobPath, name: &str, config: &Value) -> Result<()> {
        let Some(stats) = &self.stats else {
            warn!(job = %path, entry = %name, "no stats command configured; skipped");
            return Ok(());
        };
        let results_dir = self.stager.results_dir(path);
        let file_name = if name.ends_with(".json") {
            name.to_string()
        } else {
            format!("{}.json", name)
        };
        let config_path = results_dir.join(file_name);
        atomic_write_json_pretty(&config_path, config)?;
        stats.generate(&results_dir, &config_path)
    }

    /// Failure-pass, fetch, reconcile, clean up, then chain follow-ups.
    pub fn check_finished(&mut self) -> Result<CheckReport> {
        let failed = self.record_failures()?;
        let fetched = self.fetch_finished()?;
        let reconciliation = self.reconcile()?;
        self.finalize(&reconciliation);
        let submitted = self.schedule_next(&reconciliation.next_jobs());
        self.flush_ledger()?;
        Ok(CheckReport {
            failed,
            fetched,
            reconciliation,
            submitted,
        })
    }

    /// Deletes every results directory whose name ends in `timestamp`.
    /// An empty timestamp deletes nothing.
    pub fn prune_by_timestamp(&self, timestamp: &str) -> Result<Vec<PathBuf>> {
        if timestamp.is_empty() {
            return Err(CoreError::EmptyTimestamp.into());
        }
        let mut doomed = Vec::new();
        if !self.results_root.is_dir() {
            return Ok(doomed);
        }
        let mut walker = walkdir::WalkDir::new(&self.results_root).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if let Ok((_, ts)) = split_dir_name(&name) {
                if ts.as_str() == timestamp {
                    doomed.push(entry.path().to_path_buf());
                    walker.skip_current_dir();
                }
            }
        }
        for dir in &doomed {
            fs::remove_dir_all(dir).with_context(|| format!("removing {}", dir.display()))?;
            info!(dir = %dir.display(), "pruned");
        }
        Ok(doomed)
    }

    pub fn restart_interrupted(&mut self, timestamp: Option<&Timestamp>) -> Result<Vec<JobPath>> {
        let interrupted =
            with_retry(&self.policy, "list_interrupted", || self.backend.list_interrupted())?;
        let mut restarted = Vec::new();
        for path in interrupted {
            if let Some(filter) = timestamp {
                match split_dir_name(&path.dir_name) {
                    Ok((_, ts)) if &ts == filter => {}
                    _ => continue,
                }
            }
            self.states.insert(path.clone(), JobState::Interrupted);
            match with_retry(&self.policy, "restart", || self.backend.restart(&path)) {
                Ok(()) => {
                    info!(job = %path, "restarted");
                    self.states.insert(path.clone(), JobState::Submitted);
                    restarted.push(path);
                }
                Err(err) => error!(job = %path, error = %err, "restart failed"),
            }
        }
        Ok(restarted)
    }

    pub fn cancel(&mut self, path: &JobPath) -> Result<()> {
        with_retry(&self.policy, "cancel", || self.backend.cancel(path))?;
        info!(job = %path, "cancelled");
        self.states.insert(path.clone(), JobState::Failed);
        Ok(())
    }

    pub fn unfinished(&self) -> Vec<(String, String, Timestamp)> {
        self.ledger.unfinished()
    }

    /// Removes one ledger attempt and flushes.
    pub fn remove(&mut self, scenario: &str, params: &str, timestamp: &Timestamp) -> Result<bool> {
        let removed = self
            .ledger
            .remove(&LedgerKey::new(scenario, params), timestamp);
        if removed {
            self.flush_ledger()?;
        }
        Ok(removed)
    }
}

fn read_next_manifest(dir: &Path) -> Result<Vec<NextEntry>> {
    let path = dir.join(NEXT_FILE);
    if !path.is_file() {
        return Err(CoreError::InconsistentData(format!(
            "{} has a completion marker but no {}",
            dir.display(),
            NEXT_FILE
        ))
        .into());
    }
    let value = load_json_file(&path)?;
    serde_json::from_value(value).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendResult, LocalBackend};
    use crate::ledger::{MemoryLedgerStore, MISSING_START_NOTE};
    use chrono::Utc;
    use exp_core::ensure_dir;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "exporch_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn settings(root: &Path) -> Settings {
        Settings::from_yaml(&format!(
            r#"
results_root: {root}/results
games_root: {root}/games
staging_root: {root}/staging
fetch_root: {root}/fetch
backend:
  kind: local
  remote_root: {root}/remote
calls:
  retries: 1
  backoff_ms: 0
"#,
            root = root.display()
        ))
        .expect("settings")
    }

    fn write_game(root: &Path, scenario: &str) {
        let games = root.join("games");
        ensure_dir(&games).expect("games");
        fs::write(games.join(format!("{}.json", scenario)), b"{}").expect("game");
    }

    fn local(root: &Path, store: MemoryLedgerStore) -> Orchestrator {
        let s = settings(root);
        let backend = LocalBackend::new(root.join("remote"), Vec::new()).expect("backend");
        Orchestrator::new(&s, Box::new(backend), Box::new(store)).expect("orchestrator")
    }

    fn ts() -> Timestamp {
        Timestamp::parse("2020_01_19_11_22_19").expect("ts")
    }

    fn batch(next: Value) -> BatchConfig {
        BatchConfig::from_value(json!({
            "scenarios": ["g1"],
            "templates": [{"name": "cfg", "heuristic": "__HEUR__"}],
            "parametersGrid": {"HEUR": ["a", "b"]},
            "next": next
        }))
        .expect("batch")
    }

    /// What a worker leaves behind for a primary run.
    fn complete_primary(dir: &Path) {
        let output = dir.join("output");
        ensure_dir(&output).expect("output");
        fs::write(output.join("AllResults.json"), b"{\"score\": 1}").expect("results");
        fs::write(output.join("dostdout-1.txt"), b"").expect("log");
        fs::write(output.join("dostderr.txt"), b"").expect("err");
        fs::write(dir.join(JOB_FINISHED), b"").expect("marker");
    }

    #[test]
    fn declare_batch_names_jobs_and_records_attempts() {
        let root = temp_root("declare");
        write_game(&root, "g1");
        let store = MemoryLedgerStore::new();
        let mut orch = local(&root, store.clone());
        let jobs = orch
            .declare_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("declare");
        let names: Vec<String> = jobs.iter().map(|j| j.path().to_string()).collect();
        assert_eq!(
            names,
            vec![
                "g1/cfg_HEUR-a_2020_01_19_11_22_19",
                "g1/cfg_HEUR-b_2020_01_19_11_22_19",
            ]
        );
        assert_eq!(jobs[0].config, json!({"name": "cfg", "heuristic": "a"}));
        assert_eq!(orch.unfinished().len(), 2);
        orch.flush_ledger().expect("flush");
        assert_eq!(store.snapshot().expect("snapshot").len(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn declare_batch_with_missing_game_records_nothing() {
        let root = temp_root("nogame");
        let mut orch = local(&root, MemoryLedgerStore::new());
        assert!(orch
            .declare_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .is_err());
        assert!(orch.ledger().is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn schedule_batch_submits_and_clears_staging() {
        let root = temp_root("schedule");
        write_game(&root, "g1");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let started = orch
            .schedule_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("schedule");
        assert_eq!(started.len(), 2);
        assert!(orch.pending().is_empty());
        assert_eq!(orch.backend().list_not_started().expect("list").len(), 2);
        assert!(!root.join("staging/g1/cfg_HEUR-a_2020_01_19_11_22_19").exists());
        assert_eq!(orch.job_states().get(&started[0]), Some(&JobState::Submitted));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn not_ready_job_keeps_remote_copy_and_ledger_entry() {
        let root = temp_root("notready");
        write_game(&root, "g1");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let started = orch
            .schedule_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("schedule");
        let path = started[0].clone();
        // Finished marker but no results: the worker has not written its output yet.
        fs::write(path.under(&root.join("remote")).join(JOB_FINISHED), b"").expect("marker");

        let report = orch.check_finished().expect("check");
        assert_eq!(report.reconciliation.count(ReconcileOutcome::NotReady), 1);
        assert!(path.under(&root.join("remote")).is_dir());
        let identity = path.identity().expect("identity");
        assert_eq!(
            orch.ledger().status_of(&identity.ledger_key(), &identity.timestamp),
            Some(AttemptStatus::Started)
        );
        assert!(!path.under(&root.join("results")).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn finished_job_is_collected_cleaned_and_chained() {
        let root = temp_root("chain");
        write_game(&root, "g1");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let started = orch
            .schedule_batch(
                BatchKind::Primary,
                &batch(json!([{"name": "expl_x", "depth": 3}])),
                &ts(),
            )
            .expect("schedule");
        let path = started[0].clone();
        let remote = path.under(&root.join("remote"));
        complete_primary(&remote);

        let report = orch.check_finished().expect("check");
        assert_eq!(report.reconciliation.count(ReconcileOutcome::Finished), 1);
        assert_eq!(report.submitted, vec![path.clone()]);

        let results = path.under(&root.join("results"));
        assert!(results.join("AllResults.json").is_file());
        assert!(results.join("dostdout.txt").is_file());
        assert!(results.join("configuration.json").is_file());

        // The remote dir now holds the evaluation submission only.
        let manifest = JobManifest::read(&remote).expect("manifest");
        assert_eq!(manifest.kind, JobKind::Evaluation { name: "expl_x".to_string() });
        let config = load_json_file(&remote.join("config.json")).expect("config");
        assert_eq!(config, json!({"name": "expl_x", "depth": 3}));
        assert!(remote.join("AllResults.json").is_file());

        let identity = path.identity().expect("identity");
        let entry = &orch.ledger().attempts(&identity.ledger_key())[0];
        assert_eq!(entry.status, AttemptStatus::Finished);
        assert_eq!(
            entry.sub_tasks.get("evaluation:expl_x").map(|s| s.status),
            Some(AttemptStatus::Started)
        );
        assert!(sorted_dirs(&root.join("fetch")).expect("fetch").is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fetched_failure_marks_ledger_failed() {
        let root = temp_root("failed");
        write_game(&root, "g1");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let started = orch
            .schedule_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("schedule");
        let path = started[0].clone();
        fs::write(path.under(&root.join("remote")).join(JOB_FAILED), b"").expect("marker");

        let report = orch.check_finished().expect("check");
        assert_eq!(report.failed, vec![path.clone()]);
        assert_eq!(report.reconciliation.count(ReconcileOutcome::Failed), 1);
        let identity = path.identity().expect("identity");
        assert_eq!(
            orch.ledger().status_of(&identity.ledger_key(), &identity.timestamp),
            Some(AttemptStatus::Failed)
        );
        assert!(!path.under(&root.join("remote")).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn malformed_fetched_dir_is_reported_not_fatal() {
        let root = temp_root("malformed");
        let mut orch = local(&root, MemoryLedgerStore::new());
        ensure_dir(&root.join("fetch/g1/short")).expect("bad dir");
        let good = JobPath::new("g1", "cfg_2020_01_19_11_22_19");
        complete_primary(&good.under(&root.join("fetch")));
        fs::write(good.under(&root.join("fetch")).join(NEXT_FILE), b"[]").expect("next");
        fs::write(good.under(&root.join("fetch")).join("config.json"), b"{}").expect("config");

        let report = orch.reconcile().expect("reconcile");
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].dir.contains("short"));
        assert_eq!(report.count(ReconcileOutcome::Finished), 1);
        let identity = good.identity().expect("identity");
        let entry = &orch.ledger().attempts(&identity.ledger_key())[0];
        assert_eq!(entry.note, MISSING_START_NOTE);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn completed_job_without_next_manifest_fails_once() {
        let root = temp_root("nonext");
        write_game(&root, "g1");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let started = orch
            .schedule_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("schedule");
        let path = started[0].clone();
        let remote = path.under(&root.join("remote"));
        complete_primary(&remote);
        fs::remove_file(remote.join(NEXT_FILE)).expect("drop next");

        let report = orch.check_finished().expect("check");
        assert_eq!(report.reconciliation.count(ReconcileOutcome::Failed), 1);
        assert!(report.reconciliation.rejected.is_empty());
        let identity = path.identity().expect("identity");
        assert_eq!(
            orch.ledger().status_of(&identity.ledger_key(), &identity.timestamp),
            Some(AttemptStatus::Failed)
        );
        assert!(!remote.exists());

        let again = orch.check_finished().expect("check again");
        assert!(again.fetched.is_empty());
        assert!(again.reconciliation.jobs.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn evaluations_of_one_job_run_one_at_a_time() {
        let root = temp_root("sequential");
        write_game(&root, "g1");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let started = orch
            .schedule_batch(
                BatchKind::Primary,
                &batch(json!([{"name": "expl_a"}, {"name": "expl_b"}])),
                &ts(),
            )
            .expect("schedule");
        let path = started[0].clone();
        let remote = path.under(&root.join("remote"));
        complete_primary(&remote);

        let report = orch.check_finished().expect("check");
        assert_eq!(report.submitted, vec![path.clone()]);
        assert_eq!(orch.queued_evaluations(&path), vec!["expl_b".to_string()]);
        let manifest = JobManifest::read(&remote).expect("manifest");
        assert_eq!(manifest.kind, JobKind::Evaluation { name: "expl_a".to_string() });
        let identity = path.identity().expect("identity");
        let key = identity.ledger_key();
        let entry = &orch.ledger().attempts(&key)[0];
        assert_eq!(
            entry.sub_tasks.get("evaluation:expl_a").map(|s| s.status),
            Some(AttemptStatus::Started)
        );
        assert!(!entry.sub_tasks.contains_key("evaluation:expl_b"));

        // The worker finishes the first evaluation.
        let output = remote.join("output");
        ensure_dir(&output).expect("output");
        fs::write(output.join("Exploitabilityexpl_a.json"), b"{}").expect("marker");
        fs::write(output.join("explexpl_astdout-1.txt"), b"").expect("log");
        fs::write(output.join("explexpl_astderr.txt"), b"").expect("err");
        fs::write(remote.join(JOB_FINISHED), b"").expect("finished");

        let report = orch.check_finished().expect("check again");
        assert_eq!(report.reconciliation.count(ReconcileOutcome::Finished), 1);
        assert_eq!(report.submitted, vec![path.clone()]);
        assert!(orch.queued_evaluations(&path).is_empty());
        let manifest = JobManifest::read(&remote).expect("manifest");
        assert_eq!(manifest.kind, JobKind::Evaluation { name: "expl_b".to_string() });
        assert!(path
            .under(&root.join("results"))
            .join("Exploitabilityexpl_a.json")
            .is_file());
        let entry = &orch.ledger().attempts(&key)[0];
        assert_eq!(
            entry.sub_tasks.get("evaluation:expl_a").map(|s| s.status),
            Some(AttemptStatus::Finished)
        );
        assert_eq!(
            entry.sub_tasks.get("evaluation:expl_b").map(|s| s.status),
            Some(AttemptStatus::Started)
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn nested_game_file_is_preferred() {
        let root = temp_root("nestedgame");
        let nested = root.join("games/g1");
        ensure_dir(&nested).expect("games");
        fs::write(nested.join(GAME_FILE), b"{}").expect("game");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let jobs = orch
            .declare_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("declare");
        assert_eq!(jobs[0].inputs[0].source, nested.join(GAME_FILE));

        write_game(&root, "g1");
        let jobs = orch
            .declare_batch(
                BatchKind::Primary,
                &batch(json!([])),
                &Timestamp::parse("2020_01_19_11_22_20").expect("ts"),
            )
            .expect("declare again");
        assert_eq!(jobs[0].inputs[0].source, nested.join(GAME_FILE));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn staging_failure_marks_attempt_failed() {
        let root = temp_root("stagefail");
        write_game(&root, "g1");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let jobs = orch
            .declare_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("declare");
        fs::remove_file(root.join("games/g1.json")).expect("drop game");

        let started = orch.submit(&jobs);
        assert!(started.is_empty());
        assert!(orch.pending().is_empty());
        let identity = jobs[0].identity.clone();
        assert_eq!(
            orch.ledger().status_of(&identity.ledger_key(), &identity.timestamp),
            Some(AttemptStatus::Failed)
        );
        assert_eq!(orch.job_states().get(&jobs[0].path()), Some(&JobState::Failed));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn evaluation_requires_primary_results() {
        let root = temp_root("evalreq");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let path = JobPath::new("g1", "cfg_2020_01_19_11_22_19");
        let err = orch
            .declare_evaluation(&path, json!({"name": "x"}))
            .expect_err("no results");
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::InconsistentData(_))
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn evaluation_sweep_skips_evaluated_jobs_unless_rerun() {
        let root = temp_root("sweep");
        write_game(&root, "g1");
        let mut orch = local(&root, MemoryLedgerStore::new());
        let a = JobPath::new("g1", "cfg_HEUR-a_2020_01_19_11_22_19");
        let b = JobPath::new("g1", "cfg_HEUR-b_2020_02_19_11_22_19");
        for p in [&a, &b] {
            let dir = p.under(&root.join("results"));
            ensure_dir(&dir).expect("results");
            fs::write(dir.join("AllResults.json"), b"{}").expect("results");
        }
        fs::write(a.under(&root.join("results")).join("Exploitabilityx.json"), b"{}")
            .expect("evaluated");

        let jobs = orch
            .declare_evaluation_sweep(json!({"name": "x"}), None, false)
            .expect("sweep");
        assert_eq!(jobs.iter().map(|j| j.path()).collect::<Vec<_>>(), vec![b.clone()]);

        let jobs = orch
            .declare_evaluation_sweep(json!({"name": "x"}), None, true)
            .expect("rerun");
        assert_eq!(jobs.len(), 2);

        let only_a = Timestamp::parse("2020_01_19_11_22_19").expect("ts");
        let jobs = orch
            .declare_evaluation_sweep(json!({"name": "x"}), Some(&only_a), true)
            .expect("filtered");
        assert_eq!(jobs.iter().map(|j| j.path()).collect::<Vec<_>>(), vec![a]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn prune_requires_timestamp_and_removes_matching_dirs() {
        let root = temp_root("prune");
        let orch = local(&root, MemoryLedgerStore::new());
        let keep = root.join("results/g1/cfg_2020_01_19_11_22_19");
        let drop = root.join("results/g1/cfg_2021_01_19_11_22_19");
        ensure_dir(&keep).expect("keep");
        ensure_dir(&drop.join("planCache")).expect("drop");

        let err = orch.prune_by_timestamp("").expect_err("empty");
        assert!(matches!(err.downcast_ref::<CoreError>(), Some(CoreError::EmptyTimestamp)));
        assert!(drop.exists());

        let removed = orch.prune_by_timestamp("2021_01_19_11_22_19").expect("prune");
        assert_eq!(removed, vec![drop.clone()]);
        assert!(!drop.exists());
        assert!(keep.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remove_deletes_one_attempt_and_flushes() {
        let root = temp_root("remove");
        write_game(&root, "g1");
        let store = MemoryLedgerStore::new();
        let mut orch = local(&root, store.clone());
        orch.declare_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("declare");
        assert!(orch.remove("g1", "cfg_HEUR-a", &ts()).expect("remove"));
        assert!(!orch.remove("g1", "cfg_HEUR-a", &ts()).expect("again"));
        assert_eq!(store.snapshot().expect("snapshot").len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    /// Backend that fails every submission, counting calls.
    struct FlakyBackend {
        submits: Arc<Mutex<u32>>,
        fatal: bool,
    }

    impl ComputeBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn submit(&self, _job: &JobPath, _staged_dir: &Path) -> BackendResult<()> {
            if let Ok(mut n) = self.submits.lock() {
                *n += 1;
            }
            if self.fatal {
                Err(BackendError::fatal("submit", "already submitted"))
            } else {
                Err(BackendError::transient("submit", "connection reset"))
            }
        }
        fn list_finished(&self) -> BackendResult<Vec<JobPath>> {
            Ok(Vec::new())
        }
        fn list_failed(&self) -> BackendResult<Vec<JobPath>> {
            Ok(Vec::new())
        }
        fn list_interrupted(&self) -> BackendResult<Vec<JobPath>> {
            Ok(Vec::new())
        }
        fn list_not_started(&self) -> BackendResult<Vec<JobPath>> {
            Ok(Vec::new())
        }
        fn fetch(&self, _job: &JobPath, _dest: &Path) -> BackendResult<()> {
            Ok(())
        }
        fn cancel(&self, _job: &JobPath) -> BackendResult<()> {
            Ok(())
        }
        fn restart(&self, _job: &JobPath) -> BackendResult<()> {
            Ok(())
        }
        fn remote_cleanup(&self, _job: &JobPath) -> BackendResult<()> {
            Ok(())
        }
        fn scheduled_job_count(&self) -> BackendResult<usize> {
            Ok(0)
        }
    }

    #[test]
    fn failed_submissions_stay_queued_and_survive_restart() {
        let root = temp_root("flaky");
        write_game(&root, "g1");
        let submits = Arc::new(Mutex::new(0));
        let s = settings(&root);
        let mut orch = Orchestrator::new(
            &s,
            Box::new(FlakyBackend {
                submits: submits.clone(),
                fatal: false,
            }),
            Box::new(MemoryLedgerStore::new()),
        )
        .expect("orchestrator");
        let started = orch
            .schedule_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("schedule");
        assert!(started.is_empty());
        assert_eq!(orch.pending().len(), 2);
        // One try plus one retry per job.
        assert_eq!(*submits.lock().expect("lock"), 4);

        let reopened = Orchestrator::new(
            &s,
            Box::new(FlakyBackend {
                submits: Arc::new(Mutex::new(0)),
                fatal: false,
            }),
            Box::new(MemoryLedgerStore::new()),
        )
        .expect("reopen");
        assert_eq!(reopened.pending().len(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn refused_submission_is_dropped_and_marked_failed() {
        let root = temp_root("refused");
        write_game(&root, "g1");
        let submits = Arc::new(Mutex::new(0));
        let store = MemoryLedgerStore::new();
        let mut orch = Orchestrator::new(
            &settings(&root),
            Box::new(FlakyBackend {
                submits: submits.clone(),
                fatal: true,
            }),
            Box::new(store.clone()),
        )
        .expect("orchestrator");
        let started = orch
            .schedule_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("schedule");
        assert!(started.is_empty());
        assert!(orch.pending().is_empty());
        // No retry after a fatal error.
        assert_eq!(*submits.lock().expect("lock"), 2);
        assert!(!root.join("staging/g1/cfg_HEUR-a_2020_01_19_11_22_19").exists());
        let snapshot = store.snapshot().expect("snapshot");
        for params in ["cfg_HEUR-a", "cfg_HEUR-b"] {
            assert_eq!(
                snapshot.status_of(&LedgerKey::new("g1", params), &ts()),
                Some(AttemptStatus::Failed)
            );
        }
        let _ = fs::remove_dir_all(root);
    }

    /// Local backend whose first submission dies midway through the upload.
    struct BrokenUpload {
        inner: LocalBackend,
        remote: PathBuf,
        broken: Mutex<bool>,
    }

    impl ComputeBackend for BrokenUpload {
        fn name(&self) -> &'static str {
            "broken-upload"
        }
        fn submit(&self, job: &JobPath, staged_dir: &Path) -> BackendResult<()> {
            if let Ok(mut broken) = self.broken.lock() {
                if !*broken {
                    *broken = true;
                    let partial = PathBuf::from(format!(
                        "{}{}",
                        job.under(&self.remote).display(),
                        crate::backend::PARTIAL_SUFFIX
                    ));
                    let _ = ensure_dir(&partial);
                    let _ = fs::write(partial.join("half.bin"), b"..");
                    return Err(BackendError::transient("submit", "broken pipe"));
                }
            }
            self.inner.submit(job, staged_dir)
        }
        fn list_finished(&self) -> BackendResult<Vec<JobPath>> {
            self.inner.list_finished()
        }
        fn list_failed(&self) -> BackendResult<Vec<JobPath>> {
            self.inner.list_failed()
        }
        fn list_interrupted(&self) -> BackendResult<Vec<JobPath>> {
            self.inner.list_interrupted()
        }
        fn list_not_started(&self) -> BackendResult<Vec<JobPath>> {
            self.inner.list_not_started()
        }
        fn fetch(&self, job: &JobPath, dest: &Path) -> BackendResult<()> {
            self.inner.fetch(job, dest)
        }
        fn cancel(&self, job: &JobPath) -> BackendResult<()> {
            self.inner.cancel(job)
        }
        fn restart(&self, job: &JobPath) -> BackendResult<()> {
            self.inner.restart(job)
        }
        fn remote_cleanup(&self, job: &JobPath) -> BackendResult<()> {
            self.inner.remote_cleanup(job)
        }
        fn scheduled_job_count(&self) -> BackendResult<usize> {
            self.inner.scheduled_job_count()
        }
    }

    #[test]
    fn interrupted_upload_is_retried_from_scratch() {
        let root = temp_root("upload");
        write_game(&root, "g1");
        let remote = root.join("remote");
        let backend = BrokenUpload {
            inner: LocalBackend::new(remote.clone(), Vec::new()).expect("backend"),
            remote: remote.clone(),
            broken: Mutex::new(false),
        };
        let mut orch = Orchestrator::new(
            &settings(&root),
            Box::new(backend),
            Box::new(MemoryLedgerStore::new()),
        )
        .expect("orchestrator");
        let started = orch
            .schedule_batch(BatchKind::Primary, &batch(json!([])), &ts())
            .expect("schedule");
        assert_eq!(started.len(), 2);
        assert!(orch.pending().is_empty());
        let dirs = sorted_dirs(&remote.join("g1")).expect("remote");
        assert_eq!(dirs.len(), 2);
        assert!(dirs
            .iter()
            .all(|d| !d.to_string_lossy().ends_with(crate::backend::PARTIAL_SUFFIX)));
        assert!(!started[0].under(&remote).join("half.bin").exists());
        assert_eq!(orch.backend().list_not_started().expect("list").len(), 2);
        let _ = fs::remove_dir_all(root);
    }
}
