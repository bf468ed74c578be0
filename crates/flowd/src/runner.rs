//! The runner loop (component C10): claims jobs off the filesystem queue and
//! drives each one through its steps. Grounded on `loopd`'s `Daemon::run`
//! main loop shape (claim → spawn/process → sleep-when-empty) and
//! `loopd/src/runner.rs`'s per-step retry-with-backoff loop, generalized from
//! "drive one CLI process" to "drive one pluggable worker through the full
//! job/step/result lifecycle".
//!
//! Unlike `loopd`, which spawns a `tokio::spawn` task per claimed run, this
//! runner processes one job at a time on its own task. The artifact store is
//! single-writer by construction (see `flow_store::artifacts`'s module
//! comment) and a single in-process job at a time keeps that invariant
//! trivially true without extra bookkeeping; operators scale throughput by
//! running more `flowd` processes against the same queue root instead.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flow_core::{ErrorInfo, Job, JobResult, JobStatus, OnFailure, SecretsCheck, Step, StepResult, StepStatus};
use flow_policy::ExecutionPolicy;
use flow_queue::{Claimed, FileQueue};
use flow_store::{ArtifactStore, WorkspaceManager};
use flow_workers::{BudgetTracker, StepContext, WorkerRegistry};

use crate::{AppResult, Config};

pub struct Runner {
    config: Config,
    queue: FileQueue,
    store: ArtifactStore,
    workspace: WorkspaceManager,
    registry: Arc<WorkerRegistry>,
    base_policy: ExecutionPolicy,
    budget: BudgetTracker,
}

impl Runner {
    pub async fn new(config: Config, registry: Arc<WorkerRegistry>) -> AppResult<Self> {
        let queue = FileQueue::open(&config.queue_root)?;
        let store = ArtifactStore::new(&config.artifacts_root);
        let workspace = WorkspaceManager::new(&config.workspaces_root, config.project_aliases.clone())?;
        let budget = BudgetTracker::new(&config.state_db_path, config.max_daily_api_calls, config.max_daily_cost_usd).await?;
        let base_policy = ExecutionPolicy::from_env(
            config.allowed_binaries.iter().cloned().collect(),
            config.sandbox,
            config.sandbox_wrapper.clone(),
            config.sandbox_wrapper_args.clone(),
            config.network_policy,
        );

        Ok(Self { config, queue, store, workspace, registry, base_policy, budget })
    }

    /// Drive the queue until `shutdown` is set. Runs `reclaim_stale_running`
    /// on every iteration (a cheap directory scan) and `run_retention` no
    /// more often than `retention_interval_sec`.
    pub async fn run_forever(&self, shutdown: Arc<AtomicBool>) -> AppResult<()> {
        let retention_interval = Duration::from_secs(self.config.retention_interval_sec);
        let mut last_retention = Instant::now()
            .checked_sub(retention_interval)
            .unwrap_or_else(Instant::now);

        loop {
            if shutdown.load(Ordering::SeqCst) {
                tracing::info!("runner shutting down");
                return Ok(());
            }

            match self.queue.reclaim_stale_running(Duration::from_secs(self.config.runner_reclaim_after_sec)) {
                Ok(0) => {}
                Ok(n) => tracing::info!(reclaimed = n, "reclaimed stale running jobs"),
                Err(e) => tracing::warn!(error = %e, "failed to scan for stale running jobs"),
            }

            if last_retention.elapsed() >= retention_interval {
                let stats = crate::retention::run_retention(
                    &self.config.queue_root,
                    &self.config.artifacts_root,
                    &self.config.workspaces_root,
                    self.config.artifacts_ttl_sec,
                    self.config.workspaces_ttl_sec,
                );
                tracing::info!(removed_artifacts = stats.removed_artifacts, removed_workspaces = stats.removed_workspaces, "retention sweep complete");
                last_retention = Instant::now();
            }

            match self.queue.claim() {
                Ok(Some(claimed)) => {
                    let job_id = claimed.job_id.clone();
                    if let Err(e) = self.process_claimed(claimed).await {
                        tracing::error!(job_id = %job_id, error = %e, "job processing failed unexpectedly");
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_secs(self.config.runner_poll_interval_sec)).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to claim next job");
                    tokio::time::sleep(Duration::from_secs(self.config.runner_poll_interval_sec)).await;
                }
            }
        }
    }

    async fn process_claimed(&self, claimed: Claimed) -> AppResult<()> {
        let mut job = claimed.entry.job.clone();
        let job_id_str = job.job_id.to_string();
        self.store.ensure_job_layout(&job_id_str)?;

        if let Err(msg) = job.validate_invariants() {
            return self.abort_job(&claimed, job, ErrorInfo::new("invalid_job", msg)).await;
        }
        if let Err(e) = flow_core::schema::validate_job(&serde_json::to_value(&job)?) {
            return self.abort_job(&claimed, job, ErrorInfo::new("job_schema_validation_failed", e.to_string())).await;
        }

        let effective_policy = self.base_policy.for_job(&job.policy);
        if let Err(e) = effective_policy.assert_real_cli_safe(self.config.enable_real_cli) {
            return self.abort_job(&claimed, job, ErrorInfo::new("unsafe_policy_configuration", e.to_string())).await;
        }

        let source_hint = match self.resolve_source_hint(&job) {
            Ok(hint) => hint,
            Err(e) => return self.abort_job(&claimed, job, ErrorInfo::new("workspace_preparation_failed", e.to_string())).await,
        };
        let layout = match self.workspace.prepare_workspace(&job_id_str, source_hint.as_deref()) {
            Ok(layout) => layout,
            Err(e) => return self.abort_job(&claimed, job, ErrorInfo::new("workspace_preparation_failed", e.to_string())).await,
        };
        job.workdir = layout.workdir.to_string_lossy().into_owned();
        self.store.write_job_spec(&job_id_str, &job)?;

        tracing::info!(job_id = %job_id_str, goal = %job.goal, steps = job.steps.len(), "job started");

        let started_at = Utc::now();
        let mut step_results: Vec<StepResult> = Vec::new();
        let mut idx = 0usize;
        let mut interrupted = false;
        let mut last_successful_step_id: Option<String> = None;

        while idx < job.steps.len() {
            let step = effective_step(&job, idx, last_successful_step_id.as_deref());
            tracing::info!(job_id = %job_id_str, step_id = %step.step_id, agent = %step.agent, attempt_budget = step.max_retries + 1, "starting step");

            let ctx = self.build_context(&job, &step, &effective_policy)?;
            let result = self.run_step_with_retries(&ctx).await;
            let success = matches!(result.status, StepStatus::Success);
            tracing::info!(job_id = %job_id_str, step_id = %step.step_id, status = ?result.status, attempts = result.attempts, "step finished");
            step_results.push(result);

            if success {
                last_successful_step_id = Some(step.step_id.clone());
                idx += 1;
                continue;
            }

            match step.on_failure() {
                OnFailure::Stop => break,
                OnFailure::Continue => idx += 1,
                OnFailure::AskHuman => {
                    self.persist_interrupted_state(&job_id_str, &step_results)?;
                    self.queue.await_approval(&claimed)?;
                    tracing::info!(job_id = %job_id_str, step_id = %step.step_id, "job parked awaiting human approval");
                    interrupted = true;
                    break;
                }
                OnFailure::Goto(target) => match job.steps.iter().position(|s| s.step_id == target) {
                    Some(target_idx) => idx = target_idx,
                    None => {
                        tracing::warn!(job_id = %job_id_str, step_id = %step.step_id, target = %target, "goto target step not found, stopping job");
                        break;
                    }
                },
            }
        }

        if interrupted {
            return Ok(());
        }

        let job_result = self.finalize_job_result(&job, started_at, step_results);
        self.persist_and_close(&claimed, &job_id_str, &job, job_result).await
    }

    fn resolve_source_hint(&self, job: &Job) -> Result<Option<PathBuf>, flow_store::WorkspaceError> {
        if let Some(project_id) = &job.project_id {
            return Ok(Some(self.workspace.resolve_project_alias(project_id)?));
        }
        let trimmed = job.workdir.trim();
        if trimmed.is_empty() || trimmed == "." {
            return Ok(None);
        }
        let path = PathBuf::from(trimmed);
        Ok(path.is_dir().then_some(path))
    }

    fn build_context(&self, job: &Job, step: &Step, effective_policy: &ExecutionPolicy) -> AppResult<StepContext> {
        let job_id_str = job.job_id.to_string();
        self.store.ensure_step_layout(&job_id_str, &step.step_id)?;
        let job_dir = self.store.job_dir(&job_id_str)?;
        let step_dir = self.store.step_dir(&job_id_str, &step.step_id)?;

        let mut sensitive_env_vars: std::collections::HashSet<String> =
            flow_core::SENSITIVE_ENV_VARS.iter().map(|s| s.to_string()).collect();
        sensitive_env_vars.extend(self.config.sensitive_env_vars.iter().cloned());

        Ok(StepContext {
            job: job.clone(),
            step: step.clone(),
            job_dir,
            step_dir,
            enable_real_cli: self.config.enable_real_cli,
            policy: effective_policy.clone(),
            env_allowlist: self.config.env_allowlist.iter().cloned().collect(),
            sensitive_env_vars,
            sandbox_clear_env: self.config.sandbox_clear_env,
            max_input_artifacts_files: self.config.max_input_artifacts_files,
            max_input_artifact_chars: self.config.max_input_artifact_chars,
            max_input_artifacts_chars: self.config.max_input_artifacts_chars,
            idle_watchdog_sec: Some(self.config.runner_max_idle_sec),
            max_subprocess_output_chars: self.config.max_subprocess_output_chars,
            agent_prompts_dir: self.config.agent_prompts_dir.clone(),
            non_git_workdir_status: self.config.non_git_workdir_status,
            context_window: job.context_window.clone(),
            context_strategy: job.context_strategy,
        })
    }

    async fn run_step_with_retries(&self, ctx: &StepContext) -> StepResult {
        let max_attempts = ctx.step.max_retries + 1;
        let mut last: Option<StepResult> = None;

        for attempt in 1..=max_attempts {
            let started_at = Utc::now();
            let raw = self.run_attempt(ctx, started_at).await;
            let finalized = self.finalize_step_result(ctx, raw, attempt).await;
            let success = matches!(finalized.status, StepStatus::Success);
            let is_last_attempt = attempt == max_attempts;
            last = Some(finalized);

            if success || is_last_attempt {
                break;
            }

            let backoff = (ctx.step.retry_backoff_sec as u64).saturating_mul(1u64 << (attempt - 1)).min(30);
            tracing::info!(job_id = %ctx.job.job_id, step_id = %ctx.step.step_id, attempt, backoff_sec = backoff, "retrying step after backoff");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
        }

        last.expect("run_step_with_retries always attempts at least once")
    }

    /// One attempt: dispatch to the registered worker, gated by the daily
    /// budget and an outer wall-clock timeout. Does not persist anything —
    /// that's `finalize_step_result`'s job.
    async fn run_attempt(&self, ctx: &StepContext, started_at: DateTime<Utc>) -> StepResult {
        let Some(worker) = self.registry.get(&ctx.step.agent) else {
            return flow_workers::early_failure(
                ctx,
                started_at,
                ErrorInfo::new("unknown_agent", format!("no worker registered for agent '{}'", ctx.step.agent)),
            );
        };

        if ctx.enable_real_cli && self.budget.enabled() {
            if let Err(e) = self.budget.check_budget().await {
                return flow_workers::early_failure(ctx, started_at, ErrorInfo::new("budget_exceeded", e.to_string()));
            }
        }

        let outer_timeout = Duration::from_secs(u64::from(ctx.step.timeout_sec) + 5);
        let result = match tokio::time::timeout(outer_timeout, worker.run(ctx)).await {
            Ok(step_result) => step_result,
            Err(_) => timeout_result(ctx, started_at, ctx.step.timeout_sec),
        };

        if ctx.enable_real_cli {
            if let Err(e) = self.budget.log_budget(&ctx.step.agent, 1, result.metrics.cost_usd.unwrap_or(0.0)).await {
                tracing::warn!(job_id = %ctx.job.job_id, error = %e, "failed to record budget usage");
            }
        }

        result
    }

    /// Post-step secrets check and schema validation, applied uniformly after
    /// every attempt (not just the final one), then persisted to the
    /// artifact store. Runs unconditionally, independent of the worker's own
    /// reported status.
    async fn finalize_step_result(&self, ctx: &StepContext, mut result: StepResult, attempt_number: u32) -> StepResult {
        result.attempts = attempt_number;

        let outcome = crate::secrets_check::run_secrets_check(&self.config.secrets_check_bin, &ctx.step_dir).await;
        if matches!(outcome.result, SecretsCheck::Failed) {
            if !matches!(result.status, StepStatus::Failed) {
                result.status = StepStatus::Failed;
            }
            if result.error.is_none() {
                result.error = Some(ErrorInfo::new(
                    "secrets_check_failed",
                    outcome.detail.clone().unwrap_or_else(|| "secrets check failed".to_string()),
                ));
            }
        }
        result.secrets_check = Some(outcome.result);

        if let Ok(value) = serde_json::to_value(&result) {
            if let Err(e) = flow_core::schema::validate_step_result(&value) {
                result.status = StepStatus::Failed;
                result.error = Some(ErrorInfo::new("result_schema_validation_failed", e.to_string()));
            }
        }

        let report_md = read_text(&ctx.step_dir.join("report.md"));
        let patch_diff = read_text(&ctx.step_dir.join("patch.diff"));
        let logs_txt = read_text(&ctx.step_dir.join("logs.txt"));
        let raw_stdout = read_text_opt(&ctx.step_dir.join("raw_stdout.txt"));
        let raw_stderr = read_text_opt(&ctx.step_dir.join("raw_stderr.txt"));

        if let Err(e) = self.store.write_step_artifacts(
            ctx.job.job_id.as_ref(),
            &ctx.step.step_id,
            &report_md,
            &patch_diff,
            &logs_txt,
            &result,
            raw_stdout.as_deref(),
            raw_stderr.as_deref(),
        ) {
            tracing::warn!(job_id = %ctx.job.job_id, step_id = %ctx.step.step_id, error = %e, "failed to persist step artifacts");
        }

        result
    }

    fn persist_interrupted_state(&self, job_id_str: &str, step_results: &[StepResult]) -> AppResult<()> {
        self.store.write_state(
            job_id_str,
            &serde_json::json!({
                "awaiting_approval": true,
                "completed_steps": step_results.len(),
                "last_step_id": step_results.last().map(|s| s.step_id.clone()),
            }),
        )?;
        Ok(())
    }

    fn finalize_job_result(&self, job: &Job, started_at: DateTime<Utc>, step_results: Vec<StepResult>) -> JobResult {
        let finished_at = Utc::now();
        let any_needs_human = step_results.iter().any(|s| matches!(s.status, StepStatus::NeedsHuman));
        let all_success = step_results.iter().all(|s| matches!(s.status, StepStatus::Success));
        let status = if any_needs_human {
            JobStatus::NeedsHuman
        } else if all_success {
            JobStatus::Success
        } else {
            JobStatus::Failed
        };

        let secrets_check = JobResult::aggregate_secrets_check(&step_results);
        let mut artifacts: Vec<String> = step_results.iter().flat_map(|s| s.artifacts.clone()).collect();
        artifacts.push("report.md".to_string());
        artifacts.push("patch.diff".to_string());
        artifacts.push("logs.txt".to_string());
        let error = if matches!(status, JobStatus::Success) {
            None
        } else {
            step_results.iter().rev().find_map(|s| s.error.clone())
        };

        JobResult { job_id: job.job_id.clone(), status, steps: step_results, artifacts, secrets_check, error, started_at, finished_at }
    }

    async fn persist_and_close(&self, claimed: &Claimed, job_id_str: &str, job: &Job, mut result: JobResult) -> AppResult<()> {
        if let Err(e) = flow_core::schema::validate_job_result(&serde_json::to_value(&result)?) {
            tracing::warn!(job_id = job_id_str, error = %e, "final job result failed schema validation");
            result.status = JobStatus::Failed;
            result.error = Some(ErrorInfo::new("result_schema_validation_failed", e.to_string()));
        }

        let report_md = self.aggregate_step_text(job_id_str, &result.steps, "report.md");
        let patch_diff = self.aggregate_step_text(job_id_str, &result.steps, "patch.diff");
        let logs_txt = self.aggregate_step_text(job_id_str, &result.steps, "logs.txt");
        self.store.write_job_artifacts(job_id_str, &report_md, &patch_diff, &logs_txt, &result)?;

        crate::callback::maybe_deliver(job, &result).await;

        match result.status {
            JobStatus::Success => {
                self.queue.ack(claimed)?;
            }
            _ => {
                self.queue.fail(claimed)?;
            }
        }
        tracing::info!(job_id = job_id_str, status = ?result.status, "job finished");
        Ok(())
    }

    async fn abort_job(&self, claimed: &Claimed, job: Job, error: ErrorInfo) -> AppResult<()> {
        let job_id_str = job.job_id.to_string();
        tracing::warn!(job_id = job_id_str, code = %error.code, message = %error.message, "job aborted before any step ran");
        let now = Utc::now();
        let result = JobResult {
            job_id: job.job_id.clone(),
            status: JobStatus::Failed,
            steps: vec![],
            artifacts: vec![],
            secrets_check: SecretsCheck::Passed,
            error: Some(error),
            started_at: now,
            finished_at: now,
        };
        let _ = self.store.write_job_spec(&job_id_str, &job);
        self.store.write_job_artifacts(&job_id_str, "", "", "", &result)?;
        crate::callback::maybe_deliver(&job, &result).await;
        self.queue.fail(claimed)?;
        Ok(())
    }

    fn aggregate_step_text(&self, job_id: &str, steps: &[StepResult], filename: &str) -> String {
        let mut out = String::new();
        for step in steps {
            let Ok(dir) = self.store.step_dir(job_id, &step.step_id) else { continue };
            let content = read_text(&dir.join(filename));
            if content.trim().is_empty() {
                continue;
            }
            if filename == "patch.diff" {
                out.push_str(&content);
                if !content.ends_with('\n') {
                    out.push('\n');
                }
            } else {
                out.push_str(&format!("## Step {} ({}) — {:?}\n\n{content}\n\n", step.step_id, step.agent, step.status));
            }
        }
        out
    }
}

/// Applies the job's handoff strategy to the step at `idx`, following
/// spec.md §4.10.8.a: `manual` passes the declared step through unchanged;
/// `patch_first` points the next step at the previous successful step's
/// patch instead of whatever input artifacts it declared, and drops any
/// patch it would otherwise re-apply (the workspace already carries that
/// change); `workspace_first` drops both, trusting the shared workdir alone.
/// With no prior successful step yet (the first step of the pipeline),
/// the declared step is left untouched regardless of strategy.
fn effective_step(job: &Job, idx: usize, last_successful_step_id: Option<&str>) -> Step {
    let step = job.steps[idx].clone();
    let Some(prev_id) = last_successful_step_id else {
        return step;
    };

    match job.handoff_strategy {
        flow_core::HandoffStrategy::Manual => step,
        flow_core::HandoffStrategy::PatchFirst => Step {
            input_artifacts: vec![format!("steps/{prev_id}/patch.diff")],
            apply_patches_from: vec![],
            ..step
        },
        flow_core::HandoffStrategy::WorkspaceFirst => {
            Step { input_artifacts: vec![], apply_patches_from: vec![], ..step }
        }
    }
}

fn timeout_result(ctx: &StepContext, started_at: DateTime<Utc>, timeout_sec: u32) -> StepResult {
    let finished_at = Utc::now();
    let message = format!("step exceeded outer timeout of {}s", timeout_sec + 5);
    let report_md = format!(
        "# {} step {} [timeout]\n\n- error: `step_timeout_exceeded`\n- message: `{message}`\n",
        ctx.step.agent, ctx.step.step_id
    );
    let logs_txt = format!("[{}] {} run exceeded timeout\n", ctx.step.step_id, ctx.step.agent);
    let _ = flow_workers::write_artifacts(ctx, &report_md, "", &logs_txt, None, None);

    StepResult {
        job_id: ctx.job.job_id.clone(),
        step_id: ctx.step.step_id.clone(),
        agent: ctx.step.agent.clone(),
        role: ctx.step.role.clone(),
        status: StepStatus::Timeout,
        attempts: 1,
        started_at,
        finished_at,
        summary: message.chars().take(200).collect(),
        change_status: None,
        artifacts: flow_workers::artifact_paths(ctx),
        secrets_check: None,
        metrics: flow_core::Metrics {
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            cost_usd: None,
            tokens_in: None,
            tokens_out: None,
        },
        error: Some(ErrorInfo::new("step_timeout_exceeded", message)),
    }
}

fn read_text(path: &std::path::Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

fn read_text_opt(path: &std::path::Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}
