pub mod backend;
pub mod batch;
pub mod job;
pub mod ledger;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod settings;
pub mod stager;
pub mod stats;

pub use backend::{BackendError, BackendResult, ComputeBackend, LocalBackend, SshBackend};
pub use batch::{BatchConfig, BatchKind, EvaluationConfig, NextEntry};
pub use job::{Job, JobKind, JobManifest, JobState};
pub use ledger::{
    AttemptStatus, JobLedger, JsonFileLedgerStore, LedgerEntry, LedgerStore, MemoryLedgerStore,
};
pub use orchestrator::{
    CheckReport, NextJobs, Orchestrator, ReconcileOutcome, Reconciliation,
};
pub use runner::{Runner, TickReport};
pub use settings::{BackendSettings, CallPolicy, Settings};
pub use stager::JobStager;
pub use stats::{CommandStatsGenerator, StatsGenerator};
