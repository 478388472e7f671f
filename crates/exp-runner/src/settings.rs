use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SETTINGS_FILE: &str = "expmgr.yaml";
pub const SETTINGS_ENV: &str = "EXPMGR_SETTINGS";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub results_root: PathBuf,
    pub games_root: PathBuf,
    pub staging_root: PathBuf,
    pub fetch_root: PathBuf,
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub worker_config_file: Option<PathBuf>,
    #[serde(default)]
    pub stats_command: Option<Vec<String>>,
    pub backend: BackendSettings,
    #[serde(default)]
    pub calls: CallPolicy,
    #[serde(default)]
    pub runner: RunnerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSettings {
    Local {
        remote_root: PathBuf,
        #[serde(default)]
        worker_command: Vec<String>,
    },
    Ssh {
        address: String,
        remote_dir: String,
        #[serde(default)]
        launch_prefix: String,
        worker_command: Vec<String>,
        #[serde(default = "default_queue_count_command")]
        queue_count_command: String,
    },
}

fn default_queue_count_command() -> String {
    "squeue -h --me | wc -l".to_string()
}

/// Caller-side limits applied to every backend call.
#[derive(Debug, Clone, Deserialize)]
pub struct CallPolicy {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl CallPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSettings {
    #[serde(default)]
    pub watch_dir: Option<PathBuf>,
    #[serde(default)]
    pub processed_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_reconcile_every")]
    pub reconcile_every: u64,
    #[serde(default = "default_liveness_every")]
    pub liveness_every: u64,
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_reconcile_every() -> u64 {
    10
}

fn default_liveness_every() -> u64 {
    60
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            watch_dir: None,
            processed_dir: None,
            poll_interval_secs: default_poll_interval_secs(),
            reconcile_every: default_reconcile_every(),
            liveness_every: default_liveness_every(),
        }
    }
}

impl Settings {
    /// Reads YAML settings; relative paths are resolved against the
    /// directory holding the settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        let mut settings = Self::from_yaml(&raw)?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        settings.resolve_relative_to(&base);
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// `--settings`, then `EXPMGR_SETTINGS`, then `./expmgr.yaml`.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        match std::env::var(SETTINGS_ENV) {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
            _ => PathBuf::from(DEFAULT_SETTINGS_FILE),
        }
    }

    fn validate(&self) -> Result<()> {
        if let BackendSettings::Ssh {
            worker_command,
            remote_dir,
            ..
        } = &self.backend
        {
            if worker_command.is_empty() {
                return Err(anyhow!("ssh backend requires a non-empty worker_command"));
            }
            if remote_dir.trim().is_empty() {
                return Err(anyhow!("ssh backend requires remote_dir"));
            }
        }
        if self.runner.reconcile_every == 0 || self.runner.liveness_every == 0 {
            return Err(anyhow!(
                "runner.reconcile_every and runner.liveness_every must be positive"
            ));
        }
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.results_root);
        fix(&mut self.games_root);
        fix(&mut self.staging_root);
        fix(&mut self.fetch_root);
        for p in [
            self.ledger_path.as_mut(),
            self.worker_config_file.as_mut(),
            self.runner.watch_dir.as_mut(),
            self.runner.processed_dir.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            fix(p);
        }
        if let BackendSettings::Local { remote_root, .. } = &mut self.backend {
            fix(remote_root);
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.results_root.join("expdb.json"))
    }

    pub fn watch_dir(&self) -> PathBuf {
        self.runner
            .watch_dir
            .clone()
            .unwrap_or_else(|| self.results_root.join("runner").join("to_schedule"))
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.runner
            .processed_dir
            .clone()
            .unwrap_or_else(|| self.results_root.join("runner").join("processed"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.runner.poll_interval_secs)
    }
}
