use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use exp_core::{CoreError, JobPath, Timestamp};
use exp_runner::batch::load_config_value;
use exp_runner::{
    BackendError, BatchConfig, BatchKind, CheckReport, NextEntry, Orchestrator, Runner, Settings,
};
use serde_json::{json, Value};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "expmgr", version, about = "Experiment batch manager for remote compute")]
struct Cli {
    /// Settings file (falls back to EXPMGR_SETTINGS, then ./expmgr.yaml).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the watch directory and the backend until interrupted.
    StartRunner,
    /// Declare and submit one batch file (do*/rap*/expl* prefix).
    Declare {
        batch: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Evaluate {
        #[arg(long)]
        job: String,
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    EvaluateAll {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        timestamp: Option<String>,
        #[arg(long)]
        rerun: bool,
        #[arg(long)]
        json: bool,
    },
    ChainFinished {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Submit jobs left in the staging area.
    StartJobs {
        #[arg(long)]
        json: bool,
    },
    /// One fetch/reconcile/schedule pass.
    Reconcile {
        #[arg(long)]
        json: bool,
    },
    Unfinished {
        #[arg(long)]
        json: bool,
    },
    Remove {
        scenario: String,
        params: String,
        timestamp: String,
        #[arg(long)]
        json: bool,
    },
    Prune {
        #[arg(long)]
        timestamp: String,
        #[arg(long)]
        json: bool,
    },
    Ledger {
        #[arg(long)]
        json: bool,
    },
    RestartInterrupted {
        #[arg(long)]
        timestamp: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Cancel {
        job: String,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.settings.as_deref(), cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "expmgr=debug,exp_runner=debug,exp_core=debug"
    } else {
        "expmgr=info,exp_runner=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Logs go to stderr so `--json` output on stdout stays parseable.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let path = Settings::locate(explicit);
    Settings::load(&path)
}

fn parse_timestamp(raw: Option<String>) -> Result<Option<Timestamp>> {
    raw.map(|t| Timestamp::parse(&t)).transpose().map_err(Into::into)
}

fn run_command(settings_path: Option<&Path>, command: Commands) -> Result<Option<Value>> {
    let settings = load_settings(settings_path)?;
    let mut orch = Orchestrator::from_settings(&settings)?;
    match command {
        Commands::StartRunner => {
            let shutdown = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;
            signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
            let mut runner = Runner::new(orch, &settings).with_shutdown(shutdown);
            runner.run()?;
        }
        Commands::Declare { batch, json } => {
            let name = batch
                .file_name()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow!("batch path has no file name: {}", batch.display()))?;
            let kind = BatchKind::from_file_name(name).ok_or_else(|| {
                anyhow!("'{}' does not start with a known batch prefix (do, rap, expl)", name)
            })?;
            let submitted = match kind {
                BatchKind::EvaluationSweep => {
                    let jobs = orch.declare_evaluation_sweep(load_config_value(&batch)?, None, false)?;
                    orch.flush_ledger()?;
                    orch.submit(&jobs)
                }
                _ => {
                    let config = BatchConfig::load(&batch)?;
                    orch.schedule_batch(kind, &config, &Timestamp::now())?
                }
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "declare",
                    "kind": kind.as_str(),
                    "submitted": paths_json(&submitted),
                    "pending": paths_json(orch.pending()),
                })));
            }
            print_paths("submitted", &submitted);
            print_paths("pending", orch.pending());
        }
        Commands::Evaluate { job, config, json } => {
            let path = JobPath::parse(&job)?;
            let declared = orch.declare_evaluation(&path, load_config_value(&config)?)?;
            orch.flush_ledger()?;
            let submitted = orch.submit(&[declared]);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "evaluate",
                    "job": path.to_string(),
                    "submitted": paths_json(&submitted),
                })));
            }
            print_paths("submitted", &submitted);
        }
        Commands::EvaluateAll {
            config,
            timestamp,
            rerun,
            json,
        } => {
            let filter = parse_timestamp(timestamp)?;
            let jobs =
                orch.declare_evaluation_sweep(load_config_value(&config)?, filter.as_ref(), rerun)?;
            orch.flush_ledger()?;
            let submitted = orch.submit(&jobs);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "evaluate-all",
                    "declared": jobs.len(),
                    "submitted": paths_json(&submitted),
                })));
            }
            println!("declared: {}", jobs.len());
            print_paths("submitted", &submitted);
        }
        Commands::ChainFinished { config, json } => {
            let submitted = orch.chain_on_finished(NextEntry::ConfigFile(config))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "chain-finished",
                    "submitted": paths_json(&submitted),
                })));
            }
            print_paths("submitted", &submitted);
        }
        Commands::StartJobs { json } => {
            let started = orch.start_jobs();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "start-jobs",
                    "started": paths_json(&started),
                    "pending": paths_json(orch.pending()),
                })));
            }
            print_paths("started", &started);
            print_paths("pending", orch.pending());
        }
        Commands::Reconcile { json } => {
            let report = orch.check_finished()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "reconcile",
                    "report": serde_json::to_value(&report)?,
                })));
            }
            print_check_report(&report);
        }
        Commands::Unfinished { json } => {
            let rows: Vec<Value> = orch
                .unfinished()
                .into_iter()
                .map(|(scenario, params, ts)| {
                    json!({"scenario": scenario, "params": params, "timestamp": ts.as_str()})
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "unfinished",
                    "attempts": rows,
                })));
            }
            for (scenario, params, ts) in orch.unfinished() {
                println!("{}\t{}\t{}", scenario, params, ts);
            }
        }
        Commands::Remove {
            scenario,
            params,
            timestamp,
            json,
        } => {
            let ts = Timestamp::parse(&timestamp)?;
            let removed = orch.remove(&scenario, &params, &ts)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "remove",
                    "removed": removed,
                })));
            }
            println!("removed: {}", removed);
        }
        Commands::Prune { timestamp, json } => {
            let removed = orch.prune_by_timestamp(&timestamp)?;
            if json {
                let dirs: Vec<String> = removed.iter().map(|p| p.display().to_string()).collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "prune",
                    "removed": dirs,
                })));
            }
            for dir in &removed {
                println!("removed: {}", dir.display());
            }
        }
        Commands::Ledger { json } => {
            let doc = serde_json::to_value(orch.ledger().to_document())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "ledger",
                    "ledger": doc,
                })));
            }
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::RestartInterrupted { timestamp, json } => {
            let filter = parse_timestamp(timestamp)?;
            let restarted = orch.restart_interrupted(filter.as_ref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "restart-interrupted",
                    "restarted": paths_json(&restarted),
                })));
            }
            print_paths("restarted", &restarted);
        }
        Commands::Cancel { job, json } => {
            let path = JobPath::parse(&job)?;
            orch.cancel(&path)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "cancel",
                    "job": path.to_string(),
                })));
            }
            println!("cancelled: {}", path);
        }
        Commands::Status { json } => {
            let backend = orch.backend();
            let not_started = backend.list_not_started()?;
            let interrupted = backend.list_interrupted()?;
            let finished = backend.list_finished()?;
            let failed = backend.list_failed()?;
            let scheduled = backend.scheduled_job_count().ok();
            let unfinished = orch.unfinished().len();
            info!(backend = backend.name(), "status queried");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "backend": backend.name(),
                    "scheduled": scheduled,
                    "not_started": paths_json(&not_started),
                    "interrupted": paths_json(&interrupted),
                    "finished": paths_json(&finished),
                    "failed": paths_json(&failed),
                    "staged": paths_json(orch.pending()),
                    "ledger_unfinished": unfinished,
                })));
            }
            println!("backend: {}", backend.name());
            match scheduled {
                Some(n) => println!("scheduled: {}", n),
                None => println!("scheduled: unknown"),
            }
            print_paths("not_started", &not_started);
            print_paths("interrupted", &interrupted);
            print_paths("finished", &finished);
            print_paths("failed", &failed);
            print_paths("staged", orch.pending());
            println!("ledger_unfinished: {}", unfinished);
        }
    }
    Ok(None)
}

fn paths_json(paths: &[JobPath]) -> Value {
    Value::Array(paths.iter().map(|p| Value::String(p.to_string())).collect())
}

fn print_paths(label: &str, paths: &[JobPath]) {
    println!("{}: {}", label, paths.len());
    for p in paths {
        println!("  {}", p);
    }
}

fn print_check_report(report: &CheckReport) {
    print_paths("failed", &report.failed);
    print_paths("fetched", &report.fetched);
    for job in &report.reconciliation.jobs {
        println!("reconciled: {} {:?}", job.path, job.outcome);
    }
    for rejected in &report.reconciliation.rejected {
        println!("rejected: {} ({})", rejected.dir, rejected.error);
    }
    print_paths("submitted", &report.submitted);
}

fn error_code(err: &anyhow::Error) -> &'static str {
    if let Some(core) = err.downcast_ref::<CoreError>() {
        return match core {
            CoreError::MalformedIdentity { .. } => "malformed_identity",
            CoreError::InconsistentData(_) => "inconsistent_data",
            CoreError::EmptyTimestamp | CoreError::InvalidTimestamp(_) => "invalid_timestamp",
            _ => "invalid_config",
        };
    }
    if err.downcast_ref::<BackendError>().is_some() {
        return "backend_call_failed";
    }
    "command_failed"
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Declare { json, .. }
        | Commands::Evaluate { json, .. }
        | Commands::EvaluateAll { json, .. }
        | Commands::ChainFinished { json, .. }
        | Commands::StartJobs { json }
        | Commands::Reconcile { json }
        | Commands::Unfinished { json }
        | Commands::Remove { json, .. }
        | Commands::Prune { json, .. }
        | Commands::Ledger { json }
        | Commands::RestartInterrupted { json, .. }
        | Commands::Cancel { json, .. }
        | Commands::Status { json } => *json,
        Commands::StartRunner => false,
    }
}
