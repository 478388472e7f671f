use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::Command;
use tracing::info;

/// Post-processing run on a finished job's results directory.
pub trait StatsGenerator: Send {
    fn generate(&self, results_dir: &Path, config: &Path) -> Result<()>;
}

/// Runs an external program as `<command...> <results_dir> <config>`.
pub struct CommandStatsGenerator {
    command: Vec<String>,
}

impl CommandStatsGenerator {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("stats command must not be empty"));
        }
        Ok(Self { command })
    }
}

impl StatsGenerator for CommandStatsGenerator {
    fn generate(&self, results_dir: &Path, config: &Path) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("stats command must not be empty"))?;
        let output = Command::new(program)
            .args(args)
            .arg(results_dir)
            .arg(config)
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "stats command exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        info!(results = %results_dir.display(), "stats generated");
        Ok(())
    }
}
