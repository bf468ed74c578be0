//! Helpers shared between [`crate::agent_executor`] and [`crate::api_worker`].
//! Grounded on `workers/base.py::BaseWorker`.

use std::process::Command;

use chrono::Utc;
use flow_core::{ErrorInfo, Metrics, StepResult, StepStatus};

use crate::context::StepContext;
use crate::prompt::{build_full_prompt, load_system_prompt, resolve_within};

/// Prepends the agent's static system prompt (if one is configured and
/// present) ahead of the step's own prompt, then appends bounded
/// `input_artifacts` content. Artifacts are resolved against `ctx.job_dir`
/// (the artifact tree), not the workspace — spec.md §3 defines
/// `input_artifacts` as paths "relative to the job's artifact directory".
pub fn full_prompt(ctx: &StepContext) -> String {
    let base_prompt = match load_system_prompt(ctx.agent_prompts_dir.as_deref(), &ctx.step.agent) {
        Some(system_prompt) => format!("{system_prompt}\n\n## Task\n{}", ctx.step.prompt),
        None => ctx.step.prompt.clone(),
    };
    build_full_prompt(
        &base_prompt,
        &ctx.job_dir,
        &ctx.step.input_artifacts,
        ctx.max_input_artifacts_files,
        ctx.max_input_artifact_chars,
        ctx.max_input_artifacts_chars,
    )
}

/// `report.md`/`patch.diff`/`logs.txt` relative to the job root, the fixed
/// artifact set every worker writes.
pub fn artifact_paths(ctx: &StepContext) -> Vec<String> {
    let base = format!("steps/{}", ctx.step.step_id);
    vec![format!("{base}/report.md"), format!("{base}/patch.diff"), format!("{base}/logs.txt")]
}

pub fn redact_text(text: &str, ctx: &StepContext) -> String {
    flow_core::redact_env_values(&flow_core::redact_secrets(text), ctx.sensitive_env_vars.iter().map(String::as_str))
}

#[allow(clippy::too_many_arguments)]
pub fn write_artifacts(
    ctx: &StepContext,
    report_md: &str,
    patch_diff: &str,
    logs_txt: &str,
    raw_stdout: Option<&str>,
    raw_stderr: Option<&str>,
) -> std::io::Result<()> {
    std::fs::create_dir_all(&ctx.step_dir)?;
    std::fs::write(ctx.step_dir.join("report.md"), redact_text(report_md, ctx))?;
    std::fs::write(ctx.step_dir.join("patch.diff"), redact_text(patch_diff, ctx))?;
    std::fs::write(ctx.step_dir.join("logs.txt"), redact_text(logs_txt, ctx))?;
    if let Some(stdout) = raw_stdout {
        std::fs::write(ctx.step_dir.join("raw_stdout.txt"), redact_text(stdout, ctx))?;
    }
    if let Some(stderr) = raw_stderr {
        std::fs::write(ctx.step_dir.join("raw_stderr.txt"), redact_text(stderr, ctx))?;
    }
    Ok(())
}

fn run_git(args: &[&str], cwd: &str) -> Option<std::process::Output> {
    Command::new("git").args(args).current_dir(cwd).output().ok()
}

pub fn is_git_repo(workdir: &str) -> bool {
    run_git(&["rev-parse", "--is-inside-work-tree"], workdir)
        .is_some_and(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim().eq_ignore_ascii_case("true"))
}

pub fn capture_base_commit(ctx: &StepContext) -> Option<String> {
    let out = run_git(&["rev-parse", "HEAD"], &ctx.job.workdir)?;
    if !out.status.success() {
        return None;
    }
    let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!commit.is_empty()).then_some(commit)
}

pub fn capture_patch_diff(ctx: &StepContext, base_commit: Option<&str>) -> String {
    let args: Vec<&str> = match base_commit {
        Some(commit) => vec!["diff", commit],
        None => vec!["diff"],
    };
    match run_git(&args, &ctx.job.workdir) {
        Some(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        _ => String::new(),
    }
}

pub fn ensure_git_repo(ctx: &StepContext) -> Option<ErrorInfo> {
    if is_git_repo(&ctx.job.workdir) {
        return None;
    }
    Some(
        ErrorInfo::new("non_git_workdir", format!("Workdir is not a git repository: {}", ctx.job.workdir))
            .with_details(serde_json::json!({"workdir": ctx.job.workdir})),
    )
}

pub fn apply_requested_patches(ctx: &StepContext) -> Option<ErrorInfo> {
    if ctx.step.apply_patches_from.is_empty() {
        return None;
    }
    if let Some(err) = ensure_git_repo(ctx) {
        return Some(err);
    }

    for rel_patch in &ctx.step.apply_patches_from {
        // Patch files live in the artifact tree (`ctx.job_dir`), not the
        // workspace; `resolve_within` collapses `..`/`.` before the
        // containment check so a lexical `starts_with` can't be fooled by
        // an unresolved escape like `../../etc/evil.diff`.
        let Some(patch_path) = resolve_within(&ctx.job_dir, rel_patch) else {
            return Some(
                ErrorInfo::new("invalid_patch_path", format!("Patch path escapes job dir: {rel_patch}"))
                    .with_details(serde_json::json!({"patch": rel_patch})),
            );
        };
        if !patch_path.exists() {
            return Some(
                ErrorInfo::new("missing_patch", format!("Patch file does not exist: {rel_patch}"))
                    .with_details(serde_json::json!({"patch": rel_patch})),
            );
        }
        if patch_path.is_dir() {
            return Some(
                ErrorInfo::new("invalid_patch_path", format!("Patch path is a directory: {rel_patch}"))
                    .with_details(serde_json::json!({"patch": rel_patch})),
            );
        }

        let output = Command::new("git")
            .args(["apply", "--whitespace=nowarn", &patch_path.to_string_lossy()])
            .current_dir(&ctx.job.workdir)
            .output();
        match output {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                return Some(
                    ErrorInfo::new("patch_apply_failed", format!("Failed to apply patch: {rel_patch}")).with_details(
                        serde_json::json!({
                            "patch": rel_patch,
                            "exit_code": out.status.code(),
                            "stderr": String::from_utf8_lossy(&out.stderr).trim(),
                        }),
                    ),
                );
            }
            Err(e) => {
                return Some(
                    ErrorInfo::new("patch_apply_failed", format!("Failed to apply patch: {rel_patch}: {e}"))
                        .with_details(serde_json::json!({"patch": rel_patch})),
                );
            }
        }
    }
    None
}

/// Status + early-failure report shared by both worker template methods:
/// `non_git_workdir` respects `ctx.non_git_workdir_status`; every other
/// failure code is plain `failed`.
pub fn early_failure(ctx: &StepContext, started_at: chrono::DateTime<Utc>, error: ErrorInfo) -> StepResult {
    let status = if error.code == "non_git_workdir" { ctx.non_git_workdir_status } else { StepStatus::Failed };
    let finished_at = Utc::now();

    let report_md = format!(
        "# {} step {} [{status:?}]\n\n- error: `{}`\n- message: `{}`\n\n## Details\n\n```\n{}\n```\n",
        ctx.step.agent, ctx.step.step_id, error.code, error.message, error.details
    );
    let logs_txt =
        format!("[{}] {} run skipped\nstatus={status:?}\nerror={}\n", ctx.step.step_id, ctx.step.agent, error.code);

    let _ = write_artifacts(ctx, &report_md, "", &logs_txt, None, None);

    StepResult {
        job_id: ctx.job.job_id.clone(),
        step_id: ctx.step.step_id.clone(),
        agent: ctx.step.agent.clone(),
        role: ctx.step.role.clone(),
        status,
        attempts: 1,
        started_at,
        finished_at,
        summary: error.message.chars().take(200).collect(),
        change_status: None,
        artifacts: artifact_paths(ctx),
        secrets_check: None,
        metrics: Metrics { duration_ms: 0, cost_usd: None, tokens_in: None, tokens_out: None },
        error: Some(error),
    }
}

/// Deterministic fallback used by every worker when `enable_real_cli` is off
/// — no external process is spawned, but a full artifact set is still
/// produced so the rest of the pipeline (runner, artifact store, HTTP
/// surface) can be exercised end-to-end.
pub fn simulate(ctx: &StepContext) -> StepResult {
    let started_at = Utc::now();
    let prompt = full_prompt(ctx);
    let finished_at = Utc::now();

    let report_md = format!(
        "# Step {}\n\n- agent: **{}**\n- role: **{}**\n\n## Prompt\n\n{prompt}\n\n## Output (simulated)\n\nThis is a simulated worker run.\n",
        ctx.step.step_id, ctx.step.agent, ctx.step.role
    );
    let patch_diff = format!(
        "diff --git a/README.md b/README.md\nindex 0000000..1111111 100644\n--- a/README.md\n+++ b/README.md\n@@ -0,0 +1,2 @@\n+Simulated change from {}:{}\n+TODO: replace with real patch\n",
        ctx.step.agent, ctx.step.role
    );
    let logs_txt = format!("[{}] Simulated logs\nprompt_length={}\ntests: (skipped)\n", ctx.step.step_id, prompt.len());

    let _ = write_artifacts(ctx, &report_md, &patch_diff, &logs_txt, None, None);

    StepResult {
        job_id: ctx.job.job_id.clone(),
        step_id: ctx.step.step_id.clone(),
        agent: ctx.step.agent.clone(),
        role: ctx.step.role.clone(),
        status: StepStatus::Success,
        attempts: 1,
        started_at,
        finished_at,
        summary: "Simulated success".to_string(),
        change_status: Some(flow_core::ChangeStatus::Changed),
        artifacts: artifact_paths(ctx),
        secrets_check: None,
        metrics: Metrics { duration_ms: 500, cost_usd: None, tokens_in: None, tokens_out: None },
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use flow_core::{HandoffStrategy, Id, JobSource, NetworkPolicy, Policy, Step};
    use flow_policy::ExecutionPolicy;
    use tempfile::TempDir;

    use super::*;

    fn ctx_with(job_dir: &std::path::Path, workdir: &str, step: Step) -> StepContext {
        let job = flow_core::Job {
            job_id: Id::new(),
            goal: "fix the bug".to_string(),
            source: JobSource::manual(),
            project_id: None,
            workdir: workdir.to_string(),
            steps: vec![],
            policy: Policy::default(),
            callback_url: None,
            context_window: vec![],
            context_strategy: None,
            handoff_strategy: HandoffStrategy::Manual,
            tags: vec![],
            metadata: HashMap::new(),
        };
        StepContext {
            job,
            step,
            job_dir: job_dir.to_path_buf(),
            step_dir: job_dir.join("steps").join("current"),
            enable_real_cli: false,
            policy: ExecutionPolicy::from_env(HashSet::new(), false, None, vec![], NetworkPolicy::Allow),
            env_allowlist: HashSet::new(),
            sensitive_env_vars: HashSet::new(),
            sandbox_clear_env: true,
            max_input_artifacts_files: 10,
            max_input_artifact_chars: 1000,
            max_input_artifacts_chars: 10000,
            idle_watchdog_sec: None,
            max_subprocess_output_chars: 10000,
            agent_prompts_dir: None,
            non_git_workdir_status: StepStatus::NeedsHuman,
            context_window: vec![],
            context_strategy: None,
        }
    }

    fn step_with_artifacts(artifacts: Vec<String>) -> Step {
        Step {
            step_id: "s1".to_string(),
            agent: "claude".to_string(),
            role: "implementer".to_string(),
            prompt: "do it".to_string(),
            timeout_sec: 60,
            max_retries: 0,
            retry_backoff_sec: 5,
            input_artifacts: artifacts,
            apply_patches_from: vec![],
            allowed_tools: None,
            on_failure: "stop".to_string(),
        }
    }

    #[test]
    fn full_prompt_resolves_input_artifacts_against_job_dir_not_workdir() {
        let job_dir = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        std::fs::create_dir_all(job_dir.path().join("steps/01_plan")).unwrap();
        std::fs::write(job_dir.path().join("steps/01_plan/report.md"), "the plan").unwrap();

        let step = step_with_artifacts(vec!["steps/01_plan/report.md".to_string()]);
        let ctx = ctx_with(job_dir.path(), &workdir.path().to_string_lossy(), step);

        let prompt = full_prompt(&ctx);
        assert!(prompt.contains("the plan"));
        assert!(!prompt.contains("[missing]"));
    }

    #[test]
    fn full_prompt_prepends_configured_system_prompt() {
        let job_dir = TempDir::new().unwrap();
        let prompts_dir = TempDir::new().unwrap();
        std::fs::write(prompts_dir.path().join("claude.md"), "Be terse.").unwrap();

        let mut ctx = ctx_with(job_dir.path(), ".", step_with_artifacts(vec![]));
        ctx.agent_prompts_dir = Some(prompts_dir.path().to_path_buf());

        let prompt = full_prompt(&ctx);
        assert!(prompt.starts_with("Be terse.\n\n## Task\n"));
        assert!(prompt.contains("do it"));
    }

    #[test]
    fn apply_requested_patches_rejects_path_escaping_job_dir() {
        let job_dir = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        Command::new("git").args(["init", "--quiet"]).current_dir(workdir.path()).output().unwrap();

        let mut step = step_with_artifacts(vec![]);
        step.apply_patches_from = vec!["../../etc/evil.diff".to_string()];
        let ctx = ctx_with(job_dir.path(), &workdir.path().to_string_lossy(), step);

        let err = apply_requested_patches(&ctx).expect("escaping path must be rejected");
        assert_eq!(err.code, "invalid_patch_path");
    }

    #[test]
    fn apply_requested_patches_resolves_patch_against_job_dir_not_workdir() {
        let job_dir = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        Command::new("git").args(["init", "--quiet"]).current_dir(workdir.path()).output().unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(workdir.path())
            .output()
            .unwrap();
        Command::new("git").args(["config", "user.name", "test"]).current_dir(workdir.path()).output().unwrap();
        std::fs::write(workdir.path().join("a.txt"), "hello\n").unwrap();
        Command::new("git").args(["add", "a.txt"]).current_dir(workdir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "--quiet", "-m", "init"])
            .current_dir(workdir.path())
            .output()
            .unwrap();

        let patch = "diff --git a/a.txt b/a.txt\nindex 0000000..1111111 100644\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1,2 @@\n hello\n+world\n";
        std::fs::write(job_dir.path().join("patch.diff"), patch).unwrap();

        let mut step = step_with_artifacts(vec![]);
        step.apply_patches_from = vec!["patch.diff".to_string()];
        let ctx = ctx_with(job_dir.path(), &workdir.path().to_string_lossy(), step);

        // A patch that resolved against `workdir` would be `missing_patch`
        // since `patch.diff` only exists under `job_dir`.
        let result = apply_requested_patches(&ctx);
        assert_ne!(result.map(|e| e.code), Some("missing_patch".to_string()));
        assert_eq!(std::fs::read_to_string(workdir.path().join("a.txt")).unwrap(), "hello\nworld\n");
    }
}
