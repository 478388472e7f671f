use anyhow::{anyhow, Context, Result};
use exp_core::{expand_grid_list, load_json_file, ParameterSet, Template};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// What a dropped-in batch file asks for, decided by its file-name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Primary,
    Planner,
    EvaluationSweep,
}

impl BatchKind {
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.starts_with("expl") {
            Some(BatchKind::EvaluationSweep)
        } else if name.starts_with("rap") {
            Some(BatchKind::Planner)
        } else if name.starts_with("do") {
            Some(BatchKind::Primary)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Primary => "primary",
            BatchKind::Planner => "planner",
            BatchKind::EvaluationSweep => "evaluation_sweep",
        }
    }
}

/// A follow-up action attached to a job: either a config file whose name
/// prefix selects the action, or an inline config dispatched on its `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextEntry {
    ConfigFile(PathBuf),
    Inline(Value),
}

impl NextEntry {
    pub fn dispatch_name(&self) -> String {
        match self {
            NextEntry::ConfigFile(path) => path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string(),
            NextEntry::Inline(value) => value
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// `None` when the referenced file no longer exists.
    pub fn load(&self) -> Result<Option<Value>> {
        match self {
            NextEntry::ConfigFile(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                load_config_value(path).map(Some)
            }
            NextEntry::Inline(value) => Ok(Some(value.clone())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    #[serde(alias = "games")]
    pub scenarios: Vec<String>,
    #[serde(default, alias = "doconfig", alias = "rapconfig")]
    pub templates: Vec<Value>,
    #[serde(default = "empty_grid")]
    pub parameters_grid: Value,
    #[serde(default, alias = "domemory", alias = "rapmemory")]
    pub memory: Option<String>,
    #[serde(default)]
    pub next: Vec<NextEntry>,
    #[serde(default)]
    pub note: String,
}

fn empty_grid() -> Value {
    json!({})
}

impl BatchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let value = load_config_value(path)?;
        Self::from_value(value)
            .with_context(|| format!("invalid batch file {}", path.display()))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let config: BatchConfig = serde_json::from_value(value)?;
        if config.scenarios.is_empty() {
            return Err(anyhow!("batch lists no scenarios"));
        }
        Ok(config)
    }

    pub fn parsed_templates(&self) -> Result<Vec<Template>> {
        if self.templates.is_empty() {
            return Err(anyhow!("batch lists no templates"));
        }
        let mut out = Vec::with_capacity(self.templates.len());
        for raw in &self.templates {
            out.push(Template::from_json(raw)?);
        }
        Ok(out)
    }

    pub fn combinations(&self) -> Result<Vec<ParameterSet>> {
        Ok(expand_grid_list(&self.parameters_grid)?)
    }
}

/// Config of one evaluation sub-task; the rest of the document is passed to
/// the worker untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationConfig {
    pub name: String,
    pub memory: Option<String>,
    pub next: Vec<NextEntry>,
    pub raw: Value,
}

impl EvaluationConfig {
    pub fn from_value(raw: Value) -> Result<Self> {
        let name = raw
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("evaluation config requires a non-empty 'name'"))?
            .to_string();
        let memory = raw
            .get("memory")
            .or_else(|| raw.get("explmemory"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let next = match raw.get("next") {
            Some(v) => serde_json::from_value(v.clone()).context("parsing evaluation 'next'")?,
            None => Vec::new(),
        };
        Ok(Self {
            name,
            memory,
            next,
            raw,
        })
    }
}

/// Reads a JSON or YAML config document, chosen by extension.
pub fn load_config_value(path: &Path) -> Result<Value> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "yaml" | "yml" => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let value: Value = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing yaml {}", path.display()))?;
            Ok(value)
        }
        _ => load_json_file(path).with_context(|| format!("parsing json {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_selects_batch_kind() {
        assert_eq!(BatchKind::from_file_name("do_sweep.json"), Some(BatchKind::Primary));
        assert_eq!(BatchKind::from_file_name("rap1.yaml"), Some(BatchKind::Planner));
        assert_eq!(
            BatchKind::from_file_name("explFull.json"),
            Some(BatchKind::EvaluationSweep)
        );
        assert_eq!(BatchKind::from_file_name("notes.json"), None);
    }

    #[test]
    fn batch_accepts_legacy_field_names() {
        let batch = BatchConfig::from_value(json!({
            "games": ["g1"],
            "doconfig": [{"name": "cfg", "heuristic": "__HEUR__"}],
            "parametersGrid": {"HEUR": ["a", "b"]},
            "domemory": "32G",
            "next": ["/cfg/explFull.json", {"name": "explQuick"}]
        }))
        .expect("batch");
        assert_eq!(batch.scenarios, vec!["g1"]);
        assert_eq!(batch.memory.as_deref(), Some("32G"));
        assert_eq!(batch.parsed_templates().expect("templates")[0].name, "cfg");
        assert_eq!(batch.combinations().expect("grid").len(), 2);
        assert_eq!(batch.next[0].dispatch_name(), "explFull.json");
        assert_eq!(batch.next[1].dispatch_name(), "explQuick");
    }

    #[test]
    fn batch_without_grid_yields_one_empty_combination() {
        let batch = BatchConfig::from_value(json!({
            "scenarios": ["g1"],
            "templates": [{"name": "cfg"}]
        }))
        .expect("batch");
        let combos = batch.combinations().expect("grid");
        assert_eq!(combos.len(), 1);
        assert!(combos[0].is_empty());
    }

    #[test]
    fn batch_requires_scenarios() {
        assert!(BatchConfig::from_value(json!({"scenarios": [], "templates": []})).is_err());
        assert!(BatchConfig::from_value(json!({"templates": []})).is_err());
    }

    #[test]
    fn evaluation_config_requires_name() {
        assert!(EvaluationConfig::from_value(json!({"memory": "8G"})).is_err());
        let cfg = EvaluationConfig::from_value(json!({
            "name": "x",
            "explmemory": "8G",
            "next": ["stats.json"]
        }))
        .expect("config");
        assert_eq!(cfg.memory.as_deref(), Some("8G"));
        assert_eq!(cfg.next, vec![NextEntry::ConfigFile(PathBuf::from("stats.json"))]);
    }

    #[test]
    fn missing_next_file_loads_as_none() {
        let entry = NextEntry::ConfigFile(std::env::temp_dir().join("expmgr-missing-next.json"));
        assert_eq!(entry.load().expect("load"), None);
    }
}
