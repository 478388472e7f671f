use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use exp_core::{atomic_write_json_pretty, LedgerKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const LEDGER_SCHEMA_VERSION: &str = "job_ledger_v1";
pub const MISSING_START_NOTE: &str = "missing starting record";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Started,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskRecord {
    pub status: AttemptStatus,
}

/// One attempt of a job (identified by its timestamp) under a ledger key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: Timestamp,
    pub status: AttemptStatus,
    #[serde(default)]
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_tasks: BTreeMap<String, SubTaskRecord>,
}

impl LedgerEntry {
    fn new(timestamp: Timestamp, status: AttemptStatus, note: &str) -> Self {
        Self {
            timestamp,
            status,
            note: note.to_string(),
            recorded_at: Some(Utc::now().to_rfc3339()),
            sub_tasks: BTreeMap::new(),
        }
    }
}

/// Persistent-ish record of every job attempt, keyed by
/// `(scenario, config_and_params)`. Entries under a key keep insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobLedger {
    experiments: BTreeMap<LedgerKey, Vec<LedgerEntry>>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a started attempt. At most one entry exists per
    /// `(key, timestamp)`, so recording the same pair again keeps the
    /// existing entry and its note.
    pub fn record_attempt(&mut self, key: &LedgerKey, timestamp: &Timestamp, note: &str) {
        let entries = self.experiments.entry(key.clone()).or_default();
        if entries.iter().any(|e| &e.timestamp == timestamp) {
            debug!(key = %key, timestamp = %timestamp, "attempt already recorded");
            return;
        }
        entries.push(LedgerEntry::new(
            timestamp.clone(),
            AttemptStatus::Started,
            note,
        ));
    }

    pub fn attempts(&self, key: &LedgerKey) -> &[LedgerEntry] {
        self.experiments
            .get(key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_attempt(&self, key: &LedgerKey, timestamp: &Timestamp) -> bool {
        self.attempts(key).iter().any(|e| &e.timestamp == timestamp)
    }

    pub fn status_of(&self, key: &LedgerKey, timestamp: &Timestamp) -> Option<AttemptStatus> {
        self.attempts(key)
            .iter()
            .find(|e| &e.timestamp == timestamp)
            .map(|e| e.status)
    }

    /// Marks every entry with `timestamp` finished. With no matching entry a
    /// finished entry is synthesized and noted as having no start record.
    pub fn mark_finished(&mut self, key: &LedgerKey, timestamp: &Timestamp) {
        self.set_status(key, timestamp, AttemptStatus::Finished);
    }

    pub fn mark_failed(&mut self, key: &LedgerKey, timestamp: &Timestamp) {
        self.set_status(key, timestamp, AttemptStatus::Failed);
    }

    fn set_status(&mut self, key: &LedgerKey, timestamp: &Timestamp, status: AttemptStatus) {
        let entries = self.experiments.entry(key.clone()).or_default();
        let mut matched = false;
        for entry in entries.iter_mut().filter(|e| &e.timestamp == timestamp) {
            entry.status = status;
            matched = true;
        }
        if !matched {
            entries.push(LedgerEntry::new(
                timestamp.clone(),
                status,
                MISSING_START_NOTE,
            ));
        }
    }

    /// Returns false when no attempt with `timestamp` exists; nothing is
    /// recorded in that case.
    pub fn mark_sub_task_started(
        &mut self,
        key: &LedgerKey,
        timestamp: &Timestamp,
        name: &str,
    ) -> bool {
        self.update_sub_task(key, timestamp, name, AttemptStatus::Started)
    }

    /// Like `mark_finished`, an attempt is synthesized (finished, with the
    /// missing-start note) when none carries `timestamp`.
    pub fn mark_sub_task_finished(&mut self, key: &LedgerKey, timestamp: &Timestamp, name: &str) {
        self.settle_sub_task(key, timestamp, name, AttemptStatus::Finished);
    }

    pub fn mark_sub_task_failed(&mut self, key: &LedgerKey, timestamp: &Timestamp, name: &str) {
        self.settle_sub_task(key, timestamp, name, AttemptStatus::Failed);
    }

    fn settle_sub_task(
        &mut self,
        key: &LedgerKey,
        timestamp: &Timestamp,
        name: &str,
        status: AttemptStatus,
    ) {
        if self.update_sub_task(key, timestamp, name, status) {
            return;
        }
        debug!(key = %key, timestamp = %timestamp, sub_task = name, "sub-task settled without a start record");
        let mut entry = LedgerEntry::new(timestamp.clone(), status, MISSING_START_NOTE);
        entry
            .sub_tasks
            .insert(name.to_string(), SubTaskRecord { status });
        self.experiments.entry(key.clone()).or_default().push(entry);
    }

    fn update_sub_task(
        &mut self,
        key: &LedgerKey,
        timestamp: &Timestamp,
        name: &str,
        status: AttemptStatus,
    ) -> bool {
        let Some(entries) = self.experiments.get_mut(key) else {
            return false;
        };
        let mut matched = false;
        for entry in entries.iter_mut().filter(|e| &e.timestamp == timestamp) {
            entry
                .sub_tasks
                .insert(name.to_string(), SubTaskRecord { status });
            matched = true;
        }
        matched
    }

    /// `(scenario, config_and_params, timestamp)` of every attempt that has
    /// not finished, failed ones included.
    pub fn unfinished(&self) -> Vec<(String, String, Timestamp)> {
        self.experiments
            .iter()
            .flat_map(|(key, entries)| {
                entries
                    .iter()
                    .filter(|e| e.status != AttemptStatus::Finished)
                    .map(move |e| (key.scenario.clone(), key.params.clone(), e.timestamp.clone()))
            })
            .collect()
    }

    /// Deletes exactly one entry. The key disappears once it holds no
    /// entries.
    pub fn remove(&mut self, key: &LedgerKey, timestamp: &Timestamp) -> bool {
        let Some(entries) = self.experiments.get_mut(key) else {
            return false;
        };
        let Some(idx) = entries.iter().position(|e| &e.timestamp == timestamp) else {
            return false;
        };
        entries.remove(idx);
        if entries.is_empty() {
            self.experiments.remove(key);
        }
        true
    }

    pub fn entries(&self) -> impl Iterator<Item = (&LedgerKey, &[LedgerEntry])> {
        self.experiments.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.experiments.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    pub fn to_document(&self) -> LedgerDocument {
        LedgerDocument {
            schema_version: LEDGER_SCHEMA_VERSION.to_string(),
            experiments: self
                .experiments
                .iter()
                .map(|(key, attempts)| LedgerRecord {
                    scenario: key.scenario.clone(),
                    params: key.params.clone(),
                    attempts: attempts.clone(),
                })
                .collect(),
        }
    }

    pub fn from_document(doc: LedgerDocument) -> Result<Self> {
        if doc.schema_version != LEDGER_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported ledger schema_version '{}'",
                doc.schema_version
            ));
        }
        let mut ledger = JobLedger::new();
        for record in doc.experiments {
            let key = LedgerKey::new(record.scenario, record.params);
            ledger
                .experiments
                .entry(key)
                .or_default()
                .extend(record.attempts);
        }
        ledger.experiments.retain(|_, v| !v.is_empty());
        Ok(ledger)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub schema_version: String,
    pub experiments: Vec<LedgerRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub scenario: String,
    pub params: String,
    pub attempts: Vec<LedgerEntry>,
}

pub trait LedgerStore: Send {
    fn load(&self) -> Result<JobLedger>;
    fn flush(&self, ledger: &JobLedger) -> Result<()>;
}

/// Ledger persisted as one pretty-printed JSON document, replaced atomically
/// on every flush. A missing file loads as an empty ledger.
#[derive(Debug, Clone)]
pub struct JsonFileLedgerStore {
    path: PathBuf,
}

impl JsonFileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for JsonFileLedgerStore {
    fn load(&self) -> Result<JobLedger> {
        if !self.path.exists() {
            return Ok(JobLedger::new());
        }
        let bytes = fs::read(&self.path)
            .with_context(|| format!("reading ledger {}", self.path.display()))?;
        let doc: LedgerDocument = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing ledger {}", self.path.display()))?;
        JobLedger::from_document(doc)
    }

    fn flush(&self, ledger: &JobLedger) -> Result<()> {
        let value = serde_json::to_value(ledger.to_document())?;
        atomic_write_json_pretty(&self.path, &value)
            .with_context(|| format!("writing ledger {}", self.path.display()))
    }
}

/// In-process store; clones share the same saved snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    saved: Arc<Mutex<JobLedger>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(ledger: JobLedger) -> Self {
        Self {
            saved: Arc::new(Mutex::new(ledger)),
        }
    }

    pub fn snapshot(&self) -> Result<JobLedger> {
        self.load()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<JobLedger> {
        let guard = self
            .saved
            .lock()
            .map_err(|_| anyhow!("ledger store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn flush(&self, ledger: &JobLedger) -> Result<()> {
        let mut guard = self
            .saved
            .lock()
            .map_err(|_| anyhow!("ledger store lock poisoned"))?;
        *guard = ledger.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LedgerKey {
        LedgerKey::new("g1", "cfg_HEUR-a")
    }

    fn ts(raw: &str) -> Timestamp {
        Timestamp::parse(raw).expect("timestamp")
    }

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "expledger_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn mark_finished_without_start_synthesizes_entry() {
        let mut ledger = JobLedger::new();
        let t = ts("2020_01_19_11_22_19");
        ledger.mark_finished(&key(), &t);
        let attempts = ledger.attempts(&key());
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Finished);
        assert_eq!(attempts[0].note, MISSING_START_NOTE);
    }

    #[test]
    fn re_recording_an_attempt_keeps_one_entry() {
        let mut ledger = JobLedger::new();
        let t = ts("2020_01_19_11_22_19");
        ledger.record_attempt(&key(), &t, "batch note");
        ledger.record_attempt(&key(), &t, "duplicate");
        assert_eq!(ledger.attempts(&key()).len(), 1);
        assert_eq!(ledger.unfinished().len(), 1);

        ledger.mark_finished(&key(), &t);
        assert_eq!(ledger.status_of(&key(), &t), Some(AttemptStatus::Finished));
        assert_eq!(ledger.attempts(&key())[0].note, "batch note");
        assert!(ledger.unfinished().is_empty());
    }

    #[test]
    fn sub_task_start_needs_an_existing_attempt() {
        let mut ledger = JobLedger::new();
        let t = ts("2020_01_19_11_22_19");
        assert!(!ledger.mark_sub_task_started(&key(), &t, "evaluation:x"));
        assert!(ledger.is_empty());

        ledger.record_attempt(&key(), &t, "");
        assert!(ledger.mark_sub_task_started(&key(), &t, "evaluation:x"));
        ledger.mark_sub_task_finished(&key(), &t, "evaluation:x");
        assert_eq!(ledger.attempts(&key()).len(), 1);
        let entry = &ledger.attempts(&key())[0];
        assert_eq!(
            entry.sub_tasks.get("evaluation:x").map(|s| s.status),
            Some(AttemptStatus::Finished)
        );
        // Sub-task progress leaves the attempt itself alone.
        assert_eq!(entry.status, AttemptStatus::Started);
    }

    #[test]
    fn sub_task_finish_without_start_synthesizes_entry() {
        let mut ledger = JobLedger::new();
        let t = ts("2020_01_19_11_22_19");
        ledger.mark_sub_task_finished(&key(), &t, "evaluation:x");
        let attempts = ledger.attempts(&key());
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Finished);
        assert_eq!(attempts[0].note, MISSING_START_NOTE);
        assert_eq!(
            attempts[0].sub_tasks.get("evaluation:x").map(|s| s.status),
            Some(AttemptStatus::Finished)
        );
        assert!(ledger.unfinished().is_empty());

        let other = LedgerKey::new("g2", "cfg");
        ledger.mark_sub_task_failed(&other, &t, "evaluation:y");
        assert_eq!(ledger.status_of(&other, &t), Some(AttemptStatus::Failed));
    }

    #[test]
    fn failed_attempts_are_listed_as_unfinished() {
        let mut ledger = JobLedger::new();
        let a = ts("2020_01_19_11_22_19");
        let b = ts("2020_01_20_11_22_19");
        ledger.record_attempt(&key(), &a, "");
        ledger.record_attempt(&key(), &b, "");
        ledger.mark_failed(&key(), &a);
        ledger.mark_finished(&key(), &b);
        assert_eq!(
            ledger.unfinished(),
            vec![("g1".to_string(), "cfg_HEUR-a".to_string(), a)]
        );
    }

    #[test]
    fn remove_drops_one_entry_and_then_the_key() {
        let mut ledger = JobLedger::new();
        let a = ts("2020_01_19_11_22_19");
        let b = ts("2020_01_20_11_22_19");
        ledger.record_attempt(&key(), &a, "");
        ledger.record_attempt(&key(), &b, "");
        assert!(ledger.remove(&key(), &a));
        assert_eq!(ledger.attempts(&key()).len(), 1);
        assert!(!ledger.remove(&key(), &a));
        assert!(ledger.remove(&key(), &b));
        assert!(ledger.is_empty());
    }

    #[test]
    fn json_store_roundtrips_and_treats_missing_as_empty() {
        let root = temp_root("store");
        let store = JsonFileLedgerStore::new(root.join("expdb.json"));
        assert!(store.load().expect("load missing").is_empty());

        let mut ledger = JobLedger::new();
        let t = ts("2020_01_19_11_22_19");
        ledger.record_attempt(&key(), &t, "note");
        ledger.mark_sub_task_started(&key(), &t, "evaluation:x");
        ledger.mark_failed(&LedgerKey::new("g2", "cfg"), &t);
        store.flush(&ledger).expect("flush");

        let loaded = store.load().expect("load");
        assert_eq!(loaded, ledger);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn json_store_rejects_unknown_schema() {
        let root = temp_root("schema");
        let path = root.join("expdb.json");
        exp_core::ensure_dir(&root).expect("root");
        fs::write(&path, br#"{"schema_version":"v0","experiments":[]}"#).expect("write");
        let err = JsonFileLedgerStore::new(&path).load().expect_err("schema");
        assert!(err.to_string().contains("schema_version"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn memory_store_clones_share_state() {
        let store = MemoryLedgerStore::new();
        let handle = store.clone();
        let mut ledger = JobLedger::new();
        ledger.record_attempt(&key(), &ts("2020_01_19_11_22_19"), "");
        store.flush(&ledger).expect("flush");
        assert_eq!(handle.snapshot().expect("snapshot").len(), 1);
    }
}
