//! Per-step execution context. Grounded on `workers/base.py::StepContext`.

use std::collections::HashSet;
use std::path::PathBuf;

use flow_core::{ContextStrategy, Job, Step, StepStatus};
use flow_policy::ExecutionPolicy;

/// Everything a worker needs to execute one step. Constructed fresh by the
/// runner for each step attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job: Job,
    pub step: Step,

    pub job_dir: PathBuf,
    pub step_dir: PathBuf,

    pub enable_real_cli: bool,
    pub policy: ExecutionPolicy,
    pub env_allowlist: HashSet<String>,
    pub sensitive_env_vars: HashSet<String>,
    pub sandbox_clear_env: bool,

    pub max_input_artifacts_files: usize,
    pub max_input_artifact_chars: usize,
    pub max_input_artifacts_chars: usize,
    pub idle_watchdog_sec: Option<u64>,
    pub max_subprocess_output_chars: usize,

    /// Directory holding per-agent static system prompts (`<agent>.md`).
    /// `None` disables system-prompt loading entirely.
    pub agent_prompts_dir: Option<PathBuf>,

    /// Status a step is marked with when `ensure_git_repo` fails — either
    /// `needs_human` (default) or `failed`, operator-configurable.
    pub non_git_workdir_status: StepStatus,

    pub context_window: Vec<serde_json::Value>,
    pub context_strategy: Option<ContextStrategy>,
}
