use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use exp_core::{atomic_write_json_pretty, canonical_json_digest, copy_dir, ensure_dir, JobPath};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::job::{
    Artifact, Job, JobKind, JobManifest, Source, CONFIG_FILE, MANIFEST_FILE,
    MANIFEST_SCHEMA_VERSION, NEXT_FILE, OUTPUT_DIR, WORKER_CONFIG_FILE,
};

/// Owns the local side of a job directory: the staged copy handed to a
/// backend, and the canonical results tree filled in on completion.
#[derive(Debug, Clone)]
pub struct JobStager {
    staging_root: PathBuf,
    results_root: PathBuf,
    worker_config_file: Option<PathBuf>,
}

impl JobStager {
    pub fn new(
        staging_root: impl Into<PathBuf>,
        results_root: impl Into<PathBuf>,
        worker_config_file: Option<PathBuf>,
    ) -> Self {
        Self {
            staging_root: staging_root.into(),
            results_root: results_root.into(),
            worker_config_file,
        }
    }

    pub fn staged_dir(&self, path: &JobPath) -> PathBuf {
        path.under(&self.staging_root)
    }

    pub fn results_dir(&self, path: &JobPath) -> PathBuf {
        path.under(&self.results_root)
    }

    /// Lays out `<staging>/<scenario>/<dir>/` with config, next manifest,
    /// inputs, worker configuration and `job.json`. A directory that is
    /// already staged is an error; nothing is overwritten.
    pub fn stage(&self, job: &Job) -> Result<PathBuf> {
        let path = job.path();
        let dir = self.staged_dir(&path);
        if dir.exists() {
            return Err(anyhow!("job {} is already staged at {}", path, dir.display()));
        }
        for input in &job.inputs {
            if !input.source.is_file() {
                return Err(anyhow!(
                    "input {} for job {} not found",
                    input.source.display(),
                    path
                ));
            }
        }
        ensure_dir(&dir.join(OUTPUT_DIR))?;
        let result = self.fill(job, &dir);
        if result.is_err() {
            let _ = fs::remove_dir_all(&dir);
        }
        result.map(|_| dir)
    }

    fn fill(&self, job: &Job, dir: &Path) -> Result<()> {
        atomic_write_json_pretty(&dir.join(CONFIG_FILE), &job.config)?;
        atomic_write_json_pretty(&dir.join(NEXT_FILE), &serde_json::to_value(&job.next)?)?;
        for input in &job.inputs {
            fs::copy(&input.source, dir.join(&input.file_name)).with_context(|| {
                format!("copying input {}", input.source.display())
            })?;
        }
        if let Some(worker_config) = &self.worker_config_file {
            fs::copy(worker_config, dir.join(WORKER_CONFIG_FILE)).with_context(|| {
                format!("copying worker configuration {}", worker_config.display())
            })?;
        }
        let manifest = JobManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            scenario: job.identity.scenario.clone(),
            config_name: job.identity.config_name.clone(),
            params: job.identity.params.clone(),
            timestamp: job.identity.timestamp.clone(),
            kind: job.kind.clone(),
            action: job.kind.action().to_string(),
            log_prefix: job.kind.log_prefix(),
            memory: job.memory.clone(),
            config_digest: canonical_json_digest(&job.config),
            staged_at: Utc::now().to_rfc3339(),
        };
        atomic_write_json_pretty(&dir.join(MANIFEST_FILE), &serde_json::to_value(&manifest)?)?;
        Ok(())
    }

    pub fn discard(&self, path: &JobPath) -> Result<()> {
        let dir = self.staged_dir(path);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("removing staged dir {}", dir.display()))?;
        }
        if let Some(parent) = dir.parent() {
            // Drop the scenario directory once its last job is gone.
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }

    /// Job paths with a staged manifest, in path order.
    pub fn staged_paths(&self) -> Result<Vec<JobPath>> {
        let mut out = Vec::new();
        if !self.staging_root.is_dir() {
            return Ok(out);
        }
        for scenario in sorted_dirs(&self.staging_root)? {
            for job_dir in sorted_dirs(&scenario)? {
                if !job_dir.join(MANIFEST_FILE).is_file() {
                    continue;
                }
                match JobPath::parse(&job_dir.to_string_lossy()) {
                    Ok(path) => out.push(path),
                    Err(err) => warn!(dir = %job_dir.display(), error = %err, "skipping staged dir"),
                }
            }
        }
        Ok(out)
    }

    /// Copies the artifacts of `kind` from a fetched job directory into the
    /// results tree. Returns `None`, without copying anything, while a
    /// required artifact is still missing.
    pub fn collect(
        &self,
        kind: &JobKind,
        fetched_dir: &Path,
        path: &JobPath,
    ) -> Result<Option<PathBuf>> {
        let mut resolved: Vec<(PathBuf, PathBuf)> = Vec::new();
        let target = self.results_dir(path);
        for artifact in kind.artifacts() {
            let sources = resolve_source(&artifact, fetched_dir)?;
            if sources.is_empty() {
                if artifact.required {
                    debug!(job = %path, kind = ?kind, missing = ?artifact.source, "artifact not ready");
                    return Ok(None);
                }
                continue;
            }
            for (src, name) in sources {
                resolved.push((src, target.join(name)));
            }
        }
        ensure_dir(&target)?;
        for (src, dst) in resolved {
            if src.is_dir() {
                if dst.exists() {
                    fs::remove_dir_all(&dst)
                        .with_context(|| format!("replacing {}", dst.display()))?;
                }
                copy_dir(&src, &dst)?;
            } else {
                fs::copy(&src, &dst)
                    .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
            }
        }
        Ok(Some(target))
    }
}

fn resolve_source(artifact: &Artifact, fetched_dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let output = fetched_dir.join(OUTPUT_DIR);
    let found = match &artifact.source {
        Source::Output(name) => {
            let p = output.join(name);
            if p.is_file() {
                vec![(p, artifact.stored_as.clone())]
            } else {
                Vec::new()
            }
        }
        Source::OutputDir(name) => {
            let p = output.join(name);
            if p.is_dir() {
                vec![(p, artifact.stored_as.clone())]
            } else {
                Vec::new()
            }
        }
        Source::Staged(name) => {
            let p = fetched_dir.join(name);
            if p.is_file() {
                vec![(p, artifact.stored_as.clone())]
            } else {
                Vec::new()
            }
        }
        Source::OutputPrefixed(prefix) => sorted_files(&output)?
            .into_iter()
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?.to_string();
                name.starts_with(prefix.as_str()).then_some((p, name))
            })
            .collect(),
        Source::JobLog(prefix) => sorted_files(&output)?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|s| s.to_str())
                    .map(|n| n.starts_with(prefix.as_str()) && n.ends_with(".txt"))
                    .unwrap_or(false)
            })
            .last()
            .map(|p| vec![(p, artifact.stored_as.clone())])
            .unwrap_or_default(),
    };
    Ok(found)
}

fn sorted_entries(dir: &Path, want_dirs: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if (want_dirs && file_type.is_dir()) || (!want_dirs && file_type.is_file()) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

pub(crate) fn sorted_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    sorted_entries(dir, true)
}

pub(crate) fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    sorted_entries(dir, false)
}
