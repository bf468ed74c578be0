//! CLI-variant worker template. Grounded on `workers/agent_executor.py`.

use std::collections::HashMap;

use chrono::Utc;
use flow_core::{ErrorInfo, Metrics, StepResult, StepStatus};
use flow_subprocess::{run_command, CommandOutput, RunOptions};

use crate::base::{
    apply_requested_patches, artifact_paths, capture_base_commit, capture_patch_diff, early_failure, ensure_git_repo,
    full_prompt, simulate, write_artifacts,
};
use crate::context::StepContext;

pub struct ParsedOutput {
    pub report_md: String,
    pub summary: String,
    pub status: Option<StepStatus>,
    pub error: Option<ErrorInfo>,
}

fn default_parse_output(ctx: &StepContext, result: &CommandOutput) -> ParsedOutput {
    let stdout: String = result.stdout.chars().take(8000).collect();
    let stderr: String = result.stderr.chars().take(8000).collect();
    let report_md = format!(
        "# {} step {}\n\n## Exit code\n\n`{}`\n\n## Raw stdout\n\n```\n{stdout}\n```\n\n## Raw stderr\n\n```\n{stderr}\n```\n",
        ctx.step.agent, ctx.step.step_id, result.exit_code
    );
    ParsedOutput { report_md, summary: format!("{} exit_code={}", ctx.step.agent, result.exit_code), status: None, error: None }
}

fn default_build_logs(ctx: &StepContext, result: &CommandOutput, status: StepStatus) -> String {
    format!(
        "[{}] {} run\nexit_code={}\nduration_ms={}\nkilled_by_watchdog={}\nstatus={status:?}\n",
        ctx.step.step_id, ctx.step.agent, result.exit_code, result.duration_ms, result.killed_by_watchdog
    )
}

/// A worker whose execution model is "build an argv, run it as a subprocess,
/// parse stdout/stderr". Implementors provide only `build_cmd` (and may
/// override `parse_output`/`postprocess_patch`/`build_logs`); the template in
/// [`run_cli_agent`] handles everything else.
pub trait AgentExecutor: Send + Sync {
    fn agent_name(&self) -> &'static str;

    fn build_cmd(&self, ctx: &StepContext, full_prompt: &str) -> Vec<String>;

    fn parse_output(&self, ctx: &StepContext, result: &CommandOutput) -> ParsedOutput {
        default_parse_output(ctx, result)
    }

    fn postprocess_patch(&self, _ctx: &StepContext, patch_diff: String) -> String {
        patch_diff
    }

    fn build_logs(&self, ctx: &StepContext, result: &CommandOutput, status: StepStatus) -> String {
        default_build_logs(ctx, result, status)
    }
}

/// The 12-step template from `AgentExecutor.run` in the Python reference.
pub async fn run_cli_agent(agent: &dyn AgentExecutor, ctx: &StepContext) -> StepResult {
    let _ = std::fs::create_dir_all(&ctx.step_dir);

    if !ctx.enable_real_cli {
        return simulate(ctx);
    }

    let started_at = Utc::now();

    if let Some(err) = apply_requested_patches(ctx) {
        return early_failure(ctx, started_at, err);
    }
    if let Some(err) = ensure_git_repo(ctx) {
        return early_failure(ctx, started_at, err);
    }

    let prompt = full_prompt(ctx);
    let base_commit = capture_base_commit(ctx);

    let cmd = agent.build_cmd(ctx, &prompt);
    let cmd = match ctx.policy.wrap_command(cmd) {
        Ok(cmd) => cmd,
        Err(e) => return early_failure(ctx, started_at, ErrorInfo::new("policy_denied", e.to_string())),
    };

    let result = match run_command(
        &cmd,
        RunOptions {
            cwd: std::path::Path::new(&ctx.job.workdir),
            env_overrides: &HashMap::new(),
            env_allowlist: &ctx.env_allowlist.iter().cloned().collect::<Vec<_>>(),
            clear_env: ctx.sandbox_clear_env,
            timeout_sec: u64::from(ctx.step.timeout_sec),
            idle_timeout_sec: ctx.idle_watchdog_sec,
            max_output_bytes: ctx.max_subprocess_output_chars,
        },
    )
    .await
    {
        Ok(result) => result,
        Err(e) => return early_failure(ctx, started_at, ErrorInfo::new("subprocess_failed", e.to_string())),
    };

    let finished_at = Utc::now();

    let parsed = agent.parse_output(ctx, &result);
    let status = parsed.status.unwrap_or(if result.exit_code == 0 { StepStatus::Success } else { StepStatus::Failed });
    let mut error = parsed.error;
    if !matches!(status, StepStatus::Success) && error.is_none() {
        error = Some(
            ErrorInfo::new(
                "agent_exit_nonzero",
                format!("{} exited with code {}", ctx.step.agent, result.exit_code),
            )
            .with_details(serde_json::json!({"exit_code": result.exit_code})),
        );
    }

    let patch_diff = agent.postprocess_patch(ctx, capture_patch_diff(ctx, base_commit.as_deref()));
    let patch_has_changes = !patch_diff.trim().is_empty();
    let change_status = if matches!(status, StepStatus::Success) {
        Some(if patch_has_changes { flow_core::ChangeStatus::Changed } else { flow_core::ChangeStatus::NoChanges })
    } else {
        None
    };

    let mut logs_txt = agent.build_logs(ctx, &result, status);
    if let Some(cs) = change_status {
        logs_txt += &format!("change_status={}\n", cs.as_str());
    }

    let _ = write_artifacts(ctx, &parsed.report_md, &patch_diff, &logs_txt, Some(&result.stdout), Some(&result.stderr));

    let summary =
        if let Some(cs) = change_status { format!("{} ({})", parsed.summary, cs.as_str()) } else { parsed.summary };

    StepResult {
        job_id: ctx.job.job_id.clone(),
        step_id: ctx.step.step_id.clone(),
        agent: ctx.step.agent.clone(),
        role: ctx.step.role.clone(),
        status,
        attempts: 1,
        started_at,
        finished_at,
        summary,
        change_status,
        artifacts: artifact_paths(ctx),
        secrets_check: None,
        metrics: Metrics { duration_ms: result.duration_ms, cost_usd: None, tokens_in: None, tokens_out: None },
        error,
    }
}
