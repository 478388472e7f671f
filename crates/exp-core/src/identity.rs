use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::params::ParameterSet;

pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";
pub const TIMESTAMP_LEN: usize = 19;

/// Fixed-width batch timestamp (`YYYY_MM_DD_HH_MM_SS`). Lexicographic order
/// matches chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(String);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(Utc::now().format(TIMESTAMP_FORMAT).to_string())
    }

    /// Only the width is checked: any 19-character suffix of a job
    /// directory name is a valid on-disk timestamp.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        if raw.is_empty() {
            return Err(CoreError::EmptyTimestamp);
        }
        if raw.chars().count() != TIMESTAMP_LEN {
            return Err(CoreError::InvalidTimestamp(raw.to_string()));
        }
        Ok(Timestamp(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// One second later. Fails on a timestamp that only has the right width.
    pub fn next_second(&self) -> CoreResult<Self> {
        let parsed = NaiveDateTime::parse_from_str(&self.0, TIMESTAMP_FORMAT)
            .map_err(|_| CoreError::InvalidTimestamp(self.0.clone()))?;
        let later = parsed + Duration::seconds(1);
        Ok(Timestamp(later.format(TIMESTAMP_FORMAT).to_string()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        Timestamp::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

/// Ledger key: a job identity without its timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub scenario: String,
    pub params: String,
}

impl LedgerKey {
    pub fn new(scenario: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            params: params.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scenario, self.params)
    }
}

/// Relative location of a job directory: `<scenario>/<dir_name>`. The same
/// relative path is used under the staging, remote, fetch and results roots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobPath {
    pub scenario: String,
    pub dir_name: String,
}

impl JobPath {
    pub fn new(scenario: impl Into<String>, dir_name: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            dir_name: dir_name.into(),
        }
    }

    pub fn parse(raw: &str) -> CoreResult<Self> {
        let trimmed = raw.trim_matches('/');
        match trimmed.rsplit_once('/') {
            Some((scenario, dir_name)) if !scenario.is_empty() && !dir_name.is_empty() => {
                let scenario = scenario.rsplit('/').next().unwrap_or(scenario);
                Ok(JobPath::new(scenario, dir_name))
            }
            _ => Err(CoreError::MalformedIdentity {
                name: raw.to_string(),
                reason: "expected <scenario>/<job directory>",
            }),
        }
    }

    pub fn under(&self, root: &Path) -> PathBuf {
        root.join(&self.scenario).join(&self.dir_name)
    }

    pub fn identity(&self) -> CoreResult<JobIdentity> {
        JobIdentity::from_dir_name(&self.scenario, &self.dir_name)
    }
}

impl fmt::Display for JobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scenario, self.dir_name)
    }
}

impl TryFrom<String> for JobPath {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        JobPath::parse(&value)
    }
}

impl From<JobPath> for String {
    fn from(value: JobPath) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIdentity {
    pub scenario: String,
    pub config_name: String,
    pub params: ParameterSet,
    pub timestamp: Timestamp,
}

impl JobIdentity {
    pub fn new(
        scenario: impl Into<String>,
        config_name: impl Into<String>,
        params: ParameterSet,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            config_name: config_name.into(),
            params,
            timestamp,
        }
    }

    /// `<config_name>_<params>`, the part of the directory name before the
    /// timestamp.
    pub fn config_and_params(&self) -> String {
        format!("{}_{}", self.config_name, self.params.encode())
    }

    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.config_and_params(), self.timestamp)
    }

    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey::new(&self.scenario, self.config_and_params())
    }

    pub fn job_path(&self) -> JobPath {
        JobPath::new(&self.scenario, self.dir_name())
    }

    pub fn from_dir_name(scenario: &str, dir_name: &str) -> CoreResult<Self> {
        let (head, timestamp) = split_dir_name(dir_name)?;
        let (config_name, params) = match head.split_once('_') {
            Some((name, rest)) => (name, ParameterSet::decode(rest)),
            None => (head, ParameterSet::new()),
        };
        Ok(JobIdentity::new(scenario, config_name, params, timestamp))
    }
}

/// Splits a job directory name into its `<config>_<params>` head and the
/// 19-character timestamp. The character just before the timestamp must be
/// `_`; names shorter than 20 characters are rejected.
pub fn split_dir_name(dir_name: &str) -> CoreResult<(&str, Timestamp)> {
    let boundaries: Vec<usize> = dir_name.char_indices().map(|(i, _)| i).collect();
    if boundaries.len() < TIMESTAMP_LEN + 1 {
        return Err(CoreError::MalformedIdentity {
            name: dir_name.to_string(),
            reason: "shorter than 20 characters",
        });
    }
    let sep = boundaries[boundaries.len() - TIMESTAMP_LEN - 1];
    if !dir_name[sep..].starts_with('_') {
        return Err(CoreError::MalformedIdentity {
            name: dir_name.to_string(),
            reason: "missing '_' before the timestamp",
        });
    }
    let timestamp = Timestamp(dir_name[sep + 1..].to_string());
    Ok((&dir_name[..sep], timestamp))
}

/// Decodes a job directory name, or a `<scenario>/<dir>` path whose last two
/// components are used.
pub fn split_identity(name: &str) -> CoreResult<JobIdentity> {
    let trimmed = name.trim_end_matches('/');
    let mut parts = trimmed.rsplit('/');
    let dir_name = parts.next().unwrap_or(trimmed);
    let scenario = parts.next().unwrap_or("");
    JobIdentity::from_dir_name(scenario, dir_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> Timestamp {
        Timestamp::parse("2020_01_19_11_22_19").expect("timestamp")
    }

    #[test]
    fn next_second_carries_into_minutes() {
        let later = Timestamp::parse("2020_01_19_11_22_59")
            .expect("timestamp")
            .next_second()
            .expect("next");
        assert_eq!(later.as_str(), "2020_01_19_11_23_00");
        assert!(later > ts());
        let odd = Timestamp::parse("abcdefghijklmnopqrs").expect("width only");
        assert!(matches!(odd.next_second(), Err(CoreError::InvalidTimestamp(_))));
    }

    #[test]
    fn dir_name_layout() {
        let mut params = ParameterSet::new();
        params.insert("HEUR", "a");
        let id = JobIdentity::new("g1", "cfg", params, ts());
        assert_eq!(id.dir_name(), "cfg_HEUR-a_2020_01_19_11_22_19");
        assert_eq!(id.ledger_key(), LedgerKey::new("g1", "cfg_HEUR-a"));
        assert_eq!(id.job_path().to_string(), "g1/cfg_HEUR-a_2020_01_19_11_22_19");
    }

    #[test]
    fn split_identity_roundtrips_dir_name() {
        let mut params = ParameterSet::new();
        params.insert("MAXTIME", 1800i64);
        params.insert("SEARCH", "ASTAR");
        let id = JobIdentity::new("SC33", "FDINIT", params, ts());
        let parsed = split_identity(&format!("SC33/{}", id.dir_name())).expect("parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn split_identity_rejects_short_names() {
        let err = split_identity("2020_01_19_11_22_19").expect_err("19 chars");
        assert!(matches!(err, CoreError::MalformedIdentity { .. }));
    }

    #[test]
    fn split_identity_requires_underscore_before_timestamp() {
        assert!(split_identity("cfgX2020_01_19_11_22_19").is_err());
        let (head, stamp) = split_dir_name("_2020_01_19_11_22_19").expect("20 chars");
        assert_eq!(head, "");
        assert_eq!(stamp, ts());
    }

    #[test]
    fn split_identity_accepts_any_suffix_of_the_right_width() {
        let parsed = split_identity("planCache_abcdefghijklmnopqrs").expect("accepted");
        assert_eq!(parsed.config_name, "planCache");
        assert_eq!(parsed.timestamp.as_str(), "abcdefghijklmnopqrs");
    }

    #[test]
    fn job_path_parse_uses_last_two_components() {
        let p = JobPath::parse("/tmp/x/g1/cfg_2020_01_19_11_22_19/").expect("path");
        assert_eq!(p.scenario, "g1");
        assert_eq!(p.dir_name, "cfg_2020_01_19_11_22_19");
        assert!(JobPath::parse("lonely").is_err());
    }

    #[test]
    fn empty_timestamp_is_rejected() {
        assert!(matches!(Timestamp::parse(""), Err(CoreError::EmptyTimestamp)));
        assert!(Timestamp::parse("2020").is_err());
    }
}
