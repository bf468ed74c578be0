//! API-variant worker template (direct LLM API integrations, no subprocess).
//! Grounded on `workers/api_worker.py`.

use std::time::Instant;

use chrono::Utc;
use flow_core::{ChangeStatus, ErrorInfo, Metrics, StepResult, StepStatus};

use crate::base::{
    apply_requested_patches, artifact_paths, capture_base_commit, capture_patch_diff, early_failure, ensure_git_repo,
    full_prompt, simulate, write_artifacts,
};
use crate::context::StepContext;

pub struct ApiResponse {
    pub report_md: String,
    pub summary: String,
    pub status: Option<StepStatus>,
    pub error: Option<ErrorInfo>,
    pub raw_response: Option<String>,
    pub metrics: Option<Metrics>,
}

impl ApiResponse {
    pub fn success(text: impl Into<String>) -> Self {
        let text = text.into();
        let trimmed = text.trim();
        let report_md = format!("# API response\n\n{}\n", if trimmed.is_empty() { "[empty]" } else { trimmed });
        let summary = trimmed.lines().next().map_or("API call completed".to_string(), |l| l.chars().take(200).collect());
        Self { report_md, summary, status: Some(StepStatus::Success), error: None, raw_response: Some(text), metrics: None }
    }
}

/// A worker whose execution model is "call a hosted LLM API directly,
/// no child process". Implementors provide `call_api`; the template in
/// [`run_api_agent`] handles patches, git checks, prompt assembly, timing,
/// and artifact writing.
#[async_trait::async_trait]
pub trait ApiAgent: Send + Sync {
    fn agent_name(&self) -> &'static str;

    async fn call_api(&self, prompt: &str, ctx: &StepContext) -> Result<ApiResponse, String>;
}

pub async fn run_api_agent(agent: &dyn ApiAgent, ctx: &StepContext) -> StepResult {
    let _ = std::fs::create_dir_all(&ctx.step_dir);

    if !ctx.enable_real_cli {
        return simulate(ctx);
    }

    let started_at = Utc::now();
    let started_instant = Instant::now();

    if let Some(err) = apply_requested_patches(ctx) {
        return early_failure(ctx, started_at, err);
    }
    if let Some(err) = ensure_git_repo(ctx) {
        return early_failure(ctx, started_at, err);
    }

    let prompt = full_prompt(ctx);
    let base_commit = capture_base_commit(ctx);

    let response = match agent.call_api(&prompt, ctx).await {
        Ok(response) => response,
        Err(e) => ApiResponse {
            report_md: format!("# API call failed\n\n- error: `{e}`\n"),
            summary: "API call failed".to_string(),
            status: Some(StepStatus::Failed),
            error: Some(ErrorInfo::new("api_call_failed", &e)),
            raw_response: Some(e),
            metrics: None,
        },
    };

    let finished_at = Utc::now();
    let duration_ms = started_instant.elapsed().as_millis() as u64;
    let status = response.status.unwrap_or(if response.error.is_none() { StepStatus::Success } else { StepStatus::Failed });
    let mut error = response.error;
    if !matches!(status, StepStatus::Success) && error.is_none() {
        error = Some(ErrorInfo::new("api_failed", "API worker returned non-success status"));
    }

    let patch_diff = capture_patch_diff(ctx, base_commit.as_deref());
    let logs_txt = format!("[{}] {} api run\nstatus={status:?}\nduration_ms={duration_ms}\n", ctx.step.step_id, ctx.step.agent);
    let raw_stderr = error.as_ref().map(|e| e.message.clone());

    let _ = write_artifacts(ctx, &response.report_md, &patch_diff, &logs_txt, response.raw_response.as_deref(), raw_stderr.as_deref());

    let change_status =
        matches!(status, StepStatus::Success).then(|| if patch_diff.trim().is_empty() { ChangeStatus::NoChanges } else { ChangeStatus::Changed });
    let summary = if let Some(cs) = change_status { format!("{} ({})", response.summary, cs.as_str()) } else { response.summary };

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
        metrics: response.metrics.unwrap_or(Metrics { duration_ms, cost_usd: None, tokens_in: None, tokens_out: None }),
        error,
    }
}
