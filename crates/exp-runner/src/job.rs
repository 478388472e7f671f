use anyhow::{Context, Result};
use exp_core::{JobIdentity, JobPath, ParameterSet, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::batch::NextEntry;

pub const CONFIG_FILE: &str = "config.json";
pub const GAME_FILE: &str = "game.json";
pub const NEXT_FILE: &str = "next.json";
pub const MANIFEST_FILE: &str = "job.json";
pub const WORKER_CONFIG_FILE: &str = "worker_configuration.json";
pub const OUTPUT_DIR: &str = "output";
pub const PRIMARY_RESULTS: &str = "AllResults.json";
pub const MANIFEST_SCHEMA_VERSION: &str = "job_manifest_v1";

const PLANNER_RESULTS_PREFIX: &str = "RAPResultPlans_";
const EVALUATION_PREFIX: &str = "Exploitability";
const EVALUATION_PLANS_PREFIX: &str = "ExploitabilityPlans";

/// Stage of work a job directory carries. Declaration order is the
/// reconciliation priority.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Planner,
    Primary,
    Evaluation { name: String },
}

impl JobKind {
    /// Argument handed to the worker executable.
    pub fn action(&self) -> &'static str {
        match self {
            JobKind::Planner => "RAP",
            JobKind::Primary => "DO",
            JobKind::Evaluation { .. } => "EXPLOITABILITY",
        }
    }

    pub fn log_prefix(&self) -> String {
        match self {
            JobKind::Planner => "rap".to_string(),
            JobKind::Primary => "do".to_string(),
            JobKind::Evaluation { name } => format!("expl{}", name),
        }
    }

    pub fn sub_task_name(&self) -> Option<String> {
        match self {
            JobKind::Evaluation { name } => Some(format!("evaluation:{}", name)),
            _ => None,
        }
    }

    /// Completion marker this kind leaves under `output/`.
    pub fn marker(&self) -> String {
        match self {
            JobKind::Planner => format!("{}1.json", PLANNER_RESULTS_PREFIX),
            JobKind::Primary => PRIMARY_RESULTS.to_string(),
            JobKind::Evaluation { name } => format!("{}{}.json", EVALUATION_PREFIX, name),
        }
    }

    /// Kinds whose marker is present in `job_dir/output`, highest priority
    /// first; evaluations are ordered by name.
    pub fn detect(job_dir: &Path) -> Vec<JobKind> {
        let output = job_dir.join(OUTPUT_DIR);
        let mut kinds = Vec::new();
        if output.join(JobKind::Planner.marker()).is_file() {
            kinds.push(JobKind::Planner);
        }
        if output.join(PRIMARY_RESULTS).is_file() {
            kinds.push(JobKind::Primary);
        }
        let mut evaluations: Vec<String> = file_names(&output)
            .into_iter()
            .filter(|n| n.starts_with(EVALUATION_PREFIX) && !n.starts_with(EVALUATION_PLANS_PREFIX))
            .filter_map(|n| {
                n.strip_prefix(EVALUATION_PREFIX)
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .filter(|name| !name.is_empty())
                    .map(|name| name.to_string())
            })
            .collect();
        evaluations.sort();
        kinds.extend(evaluations.into_iter().map(|name| JobKind::Evaluation { name }));
        kinds
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        let prefix = self.log_prefix();
        let mut out = match self {
            JobKind::Planner => vec![
                Artifact::required(Source::OutputPrefixed(PLANNER_RESULTS_PREFIX.to_string()), ""),
                Artifact::optional(Source::OutputDir("planCacheRAP".to_string()), "planCacheRAP"),
                Artifact::required(Source::Staged(CONFIG_FILE.to_string()), "planner_configuration.json"),
            ],
            JobKind::Primary => vec![
                Artifact::required(Source::Output(PRIMARY_RESULTS.to_string()), PRIMARY_RESULTS),
                Artifact::optional(Source::OutputDir("planCache".to_string()), "planCache"),
                Artifact::required(Source::Staged(CONFIG_FILE.to_string()), "configuration.json"),
                Artifact::optional(Source::Staged(MANIFEST_FILE.to_string()), MANIFEST_FILE),
            ],
            JobKind::Evaluation { name } => vec![
                Artifact::required(Source::Output(self.marker()), &self.marker()),
                Artifact::optional(
                    Source::Output(format!("{}{}.json", EVALUATION_PLANS_PREFIX, name)),
                    &format!("{}{}.json", EVALUATION_PLANS_PREFIX, name),
                ),
                Artifact::optional(
                    Source::OutputDir(format!("planCacheExploit{}", name)),
                    &format!("planCacheExploit{}", name),
                ),
                Artifact::required(
                    Source::Staged(CONFIG_FILE.to_string()),
                    &format!("evaluation_{}_configuration.json", name),
                ),
            ],
        };
        out.push(Artifact::required(
            Source::JobLog(format!("{}stdout-", prefix)),
            &format!("{}stdout.txt", prefix),
        ));
        out.push(Artifact::required(
            Source::Output(format!("{}stderr.txt", prefix)),
            &format!("{}stderr.txt", prefix),
        ));
        out.push(Artifact::optional(Source::Staged(GAME_FILE.to_string()), GAME_FILE));
        out.push(Artifact::optional(
            Source::Staged(WORKER_CONFIG_FILE.to_string()),
            WORKER_CONFIG_FILE,
        ));
        out
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect()
}

/// Where a result artifact lives inside a fetched job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Plain file under `output/`.
    Output(String),
    /// Every file under `output/` with this prefix, stored under its own name.
    OutputPrefixed(String),
    /// Directory under `output/`; replaces any stale copy.
    OutputDir(String),
    /// Backend log named `<prefix><job id>.txt`; the lexicographically last one is kept.
    JobLog(String),
    /// File placed by the stager at the job directory root.
    Staged(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub source: Source,
    pub stored_as: String,
    pub required: bool,
}

impl Artifact {
    fn required(source: Source, stored_as: &str) -> Self {
        Self {
            source,
            stored_as: stored_as.to_string(),
            required: true,
        }
    }

    fn optional(source: Source, stored_as: &str) -> Self {
        Self {
            source,
            stored_as: stored_as.to_string(),
            required: false,
        }
    }
}

/// A file copied into the staged directory before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRef {
    pub source: PathBuf,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Declared,
    Staged,
    Submitted,
    Finished,
    Failed,
    Interrupted,
    Reconciled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub identity: JobIdentity,
    pub kind: JobKind,
    pub config: Value,
    pub inputs: Vec<InputRef>,
    pub next: Vec<NextEntry>,
    pub memory: Option<String>,
    pub note: String,
}

impl Job {
    pub fn path(&self) -> JobPath {
        self.identity.job_path()
    }
}

/// `job.json`: everything a backend needs to launch the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub schema_version: String,
    pub scenario: String,
    pub config_name: String,
    pub params: ParameterSet,
    pub timestamp: Timestamp,
    pub kind: JobKind,
    pub action: String,
    pub log_prefix: String,
    #[serde(default)]
    pub memory: Option<String>,
    pub config_digest: String,
    pub staged_at: String,
}

impl JobManifest {
    pub fn read(job_dir: &Path) -> Result<Self> {
        let path = job_dir.join(MANIFEST_FILE);
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}
