//! flowctl - CLI front-end for the job orchestrator.
//!
//! Unlike the teacher's `loopctl`, which talks to `loopd` over HTTP because
//! the teacher's daemon owns all state behind its own process, `flowctl`
//! operates directly on the filesystem-backed queue and artifact store (see
//! DESIGN.md): the durable state this CLI needs is the same durable state
//! `flowd` reads and writes, so no daemon needs to be running for any of
//! these commands to work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use flow_core::{ContextStrategy, HandoffStrategy, Id, Job, JobSource, Policy, Step};
use flow_queue::FileQueue;
use flow_store::ArtifactStore;
use flow_workers::BudgetTracker;
use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};

/// Exit code for "not found" / invalid user input, distinct from a bare `1`
/// used for `doctor` check failures.
const EXIT_NOT_FOUND: i32 = 2;

#[derive(Parser)]
#[command(name = "flowctl")]
#[command(about = "Control plane for the flowd job orchestrator")]
#[command(version)]
struct Cli {
    #[arg(long, global = true, env = "QUEUE_ROOT", default_value = "./data/queue")]
    queue_root: PathBuf,

    #[arg(long, global = true, env = "ARTIFACTS_ROOT", default_value = "./data/artifacts")]
    artifacts_root: PathBuf,

    #[arg(long, global = true, env = "WORKSPACES_ROOT", default_value = "./data/workspaces")]
    workspaces_root: PathBuf,

    #[arg(long, global = true, env = "STATE_DB_PATH", default_value = "./data/budget.db")]
    state_db_path: PathBuf,

    #[arg(long, global = true, env = "ALLOWED_BINARIES", value_delimiter = ',')]
    allowed_binaries: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a job spec (JSON file) to the pending queue.
    Submit {
        /// Path to a JSON job submission document.
        path: PathBuf,
    },
    /// Show a job's queue state, on-disk state, and result.
    Status {
        job_id: String,
    },
    /// Check that the orchestrator's storage locations and dependencies are reachable.
    Doctor,
    /// Move stale `running` entries back to `pending`.
    Recover {
        #[arg(long, default_value_t = 900)]
        stale_after_sec: u64,
    },
    /// Move a stuck `running` entry back to `pending`.
    Unlock {
        #[arg(long)]
        job: String,
    },
    /// Move an `awaiting_approval` entry into `pending`.
    Approve {
        #[arg(long)]
        job: String,
    },
}

/// The document a caller hands to `submit`. Mirrors `flowd::server`'s
/// webhook request body so the same job spec can be used against either
/// front-end.
#[derive(Debug, Deserialize)]
struct SubmitSpec {
    goal: String,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    callback_url: Option<String>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    policy: Policy,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    context_window: Vec<serde_json::Value>,
    #[serde(default)]
    context_strategy: Option<ContextStrategy>,
    #[serde(default)]
    artifact_handoff: Option<HandoffStrategy>,
}

fn main() {
    fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))).init();

    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> eyre::Result<i32> {
    match cli.command {
        Command::Submit { path } => cmd_submit(&cli.queue_root, &cli.artifacts_root, &path),
        Command::Status { job_id } => cmd_status(&cli.queue_root, &cli.artifacts_root, &job_id),
        Command::Doctor => cmd_doctor(&cli),
        Command::Recover { stale_after_sec } => cmd_recover(&cli.queue_root, stale_after_sec),
        Command::Unlock { job } => cmd_unlock(&cli.queue_root, &job),
        Command::Approve { job } => cmd_approve(&cli.queue_root, &job),
    }
}

fn cmd_submit(queue_root: &PathBuf, artifacts_root: &PathBuf, path: &PathBuf) -> eyre::Result<i32> {
    let raw = std::fs::read_to_string(path)?;
    let spec: SubmitSpec = serde_json::from_str(&raw)?;

    if spec.steps.is_empty() {
        eprintln!("'steps' must be a non-empty list");
        return Ok(EXIT_NOT_FOUND);
    }

    let job = Job {
        job_id: Id::new(),
        goal: spec.goal,
        source: JobSource::manual(),
        project_id: spec.project_id,
        workdir: spec.workdir.unwrap_or_else(|| ".".to_string()),
        steps: spec.steps,
        policy: spec.policy,
        callback_url: spec.callback_url,
        context_window: spec.context_window,
        context_strategy: spec.context_strategy,
        handoff_strategy: spec.artifact_handoff.unwrap_or(HandoffStrategy::Manual),
        tags: spec.tags,
        metadata: spec.metadata,
    };

    if let Err(msg) = job.validate_invariants() {
        eprintln!("invalid job: {msg}");
        return Ok(EXIT_NOT_FOUND);
    }
    if let Err(e) = flow_core::schema::validate_job(&serde_json::to_value(&job)?) {
        eprintln!("job failed schema validation: {e}");
        return Ok(EXIT_NOT_FOUND);
    }

    let queue = FileQueue::open(queue_root)?;
    let job_id = job.job_id.to_string();
    let requires_approval = job.policy.requires_approval;
    match queue.enqueue(job) {
        Ok(id) => {
            let status = if requires_approval { "awaiting_approval" } else { "queued" };
            let artifacts_dir = artifacts_root.join(&job_id);
            println!(
                "{}",
                serde_json::json!({
                    "status": status,
                    "job_id": id.to_string(),
                    "artifacts_dir": artifacts_dir.to_string_lossy(),
                })
            );
            Ok(0)
        }
        Err(flow_queue::QueueError::DuplicateJob(id)) => {
            eprintln!("duplicate job id: {id}");
            Ok(EXIT_NOT_FOUND)
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_status(queue_root: &PathBuf, artifacts_root: &PathBuf, job_id: &str) -> eyre::Result<i32> {
    let queue = FileQueue::open(queue_root)?;
    let store = ArtifactStore::new(artifacts_root);

    let queue_state = queue.queue_state(job_id)?;
    let job_dir = store.job_dir(job_id).map_err(|e| eyre::eyre!(e.to_string()))?;

    if queue_state.is_none() && !job_dir.exists() {
        eprintln!("unknown job_id: {job_id}");
        return Ok(EXIT_NOT_FOUND);
    }

    let state = read_json_opt(&job_dir.join("state.json"));
    let result = read_json_opt(&job_dir.join("result.json"));
    let status = result.as_ref().and_then(|v| v.get("status")).and_then(|s| s.as_str()).map(str::to_string);

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "job_id": job_id,
            "status": status,
            "queue_state": queue_state.map(flow_core::QueueState::dir_name),
            "state": state,
            "result": result,
        }))?
    );
    Ok(0)
}

fn read_json_opt(path: &std::path::Path) -> Option<serde_json::Value> {
    std::fs::read_to_string(path).ok().and_then(|raw| serde_json::from_str(&raw).ok())
}

fn cmd_recover(queue_root: &PathBuf, stale_after_sec: u64) -> eyre::Result<i32> {
    let queue = FileQueue::open(queue_root)?;
    let reclaimed = queue.reclaim_stale_running(Duration::from_secs(stale_after_sec))?;
    println!("reclaimed {reclaimed} stale running job(s)");
    Ok(0)
}

fn cmd_unlock(queue_root: &PathBuf, job_id: &str) -> eyre::Result<i32> {
    let queue = FileQueue::open(queue_root)?;
    if queue.unlock(job_id)? {
        println!("unlocked {job_id}");
        Ok(0)
    } else {
        eprintln!("no running entry found for job_id: {job_id}");
        Ok(EXIT_NOT_FOUND)
    }
}

fn cmd_approve(queue_root: &PathBuf, job_id: &str) -> eyre::Result<i32> {
    let queue = FileQueue::open(queue_root)?;
    if queue.approve(job_id)? {
        println!("approved {job_id}");
        Ok(0)
    } else {
        eprintln!("no awaiting_approval entry found for job_id: {job_id}");
        Ok(EXIT_NOT_FOUND)
    }
}

/// Checks that storage locations are writable, the budget database is
/// reachable, and every allowlisted binary resolves on `PATH` (via `which`).
/// Exits `1` (not `2`) on any failure, per spec.md's CLI exit-code contract.
fn cmd_doctor(cli: &Cli) -> eyre::Result<i32> {
    let mut ok = true;

    for (label, dir) in [
        ("QUEUE_ROOT", &cli.queue_root),
        ("ARTIFACTS_ROOT", &cli.artifacts_root),
        ("WORKSPACES_ROOT", &cli.workspaces_root),
    ] {
        match check_writable_dir(dir) {
            Ok(()) => println!("[ok] {label} is writable: {}", dir.display()),
            Err(e) => {
                println!("[fail] {label} ({}) is not writable: {e}", dir.display());
                ok = false;
            }
        }
    }

    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(BudgetTracker::new(&cli.state_db_path, 0, 0.0)) {
        Ok(_) => println!("[ok] budget database is reachable: {}", cli.state_db_path.display()),
        Err(e) => {
            println!("[fail] budget database ({}) is not reachable: {e}", cli.state_db_path.display());
            ok = false;
        }
    }

    if cli.allowed_binaries.is_empty() {
        println!("[warn] ALLOWED_BINARIES is empty; no binary reachability was checked");
    }
    for bin in &cli.allowed_binaries {
        match which(bin) {
            Some(path) => println!("[ok] binary '{bin}' resolves to {}", path.display()),
            None => {
                println!("[fail] binary '{bin}' was not found on PATH");
                ok = false;
            }
        }
    }

    if ok {
        println!("doctor: all checks passed");
        Ok(0)
    } else {
        println!("doctor: one or more checks failed");
        Ok(1)
    }
}

fn check_writable_dir(dir: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".flowctl-doctor-probe-{}", std::process::id()));
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)
}

/// Minimal `which`: search `PATH` for an executable named `bin`. No shelling
/// out to the system `which`, which may not exist on every host this runs on.
fn which(bin: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(bin)).find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn submit_then_status_round_trips() {
        let dir = TempDir::new().unwrap();
        let queue_root = dir.path().join("queue");
        let artifacts_root = dir.path().join("artifacts");

        let spec_path = dir.path().join("spec.json");
        std::fs::write(
            &spec_path,
            serde_json::json!({
                "goal": "run tests",
                "steps": [{"step_id": "s1", "agent": "claude", "prompt": "do it"}],
            })
            .to_string(),
        )
        .unwrap();

        let code = cmd_submit(&queue_root, &artifacts_root, &spec_path).unwrap();
        assert_eq!(code, 0);

        let entries: Vec<_> = std::fs::read_dir(queue_root.join("pending")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn submit_rejects_empty_steps() {
        let dir = TempDir::new().unwrap();
        let queue_root = dir.path().join("queue");
        let artifacts_root = dir.path().join("artifacts");
        let spec_path = dir.path().join("spec.json");
        std::fs::write(&spec_path, serde_json::json!({"goal": "run tests", "steps": []}).to_string()).unwrap();

        let code = cmd_submit(&queue_root, &artifacts_root, &spec_path).unwrap();
        assert_eq!(code, EXIT_NOT_FOUND);
    }

    #[test]
    fn status_reports_not_found_for_unknown_job() {
        let dir = TempDir::new().unwrap();
        let queue_root = dir.path().join("queue");
        let artifacts_root = dir.path().join("artifacts");
        let code = cmd_status(&queue_root, &artifacts_root, "does-not-exist").unwrap();
        assert_eq!(code, EXIT_NOT_FOUND);
    }

    #[test]
    fn unlock_reports_not_found_when_nothing_running() {
        let dir = TempDir::new().unwrap();
        let queue_root = dir.path().join("queue");
        let code = cmd_unlock(&queue_root, "nope").unwrap();
        assert_eq!(code, EXIT_NOT_FOUND);
    }

    #[test]
    fn which_resolves_a_binary_known_to_be_on_path() {
        assert!(which("sh").is_some() || which("cmd").is_some() || which("ls").is_some());
    }
}
