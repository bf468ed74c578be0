//! Claude CLI worker. Grounded on `workers/claude_worker.py`.

use std::collections::HashSet;

use async_trait::async_trait;
use flow_core::{ErrorInfo, Step, StepResult, StepStatus};
use flow_subprocess::CommandOutput;
use once_cell::sync::Lazy;

use crate::agent_executor::{run_cli_agent, AgentExecutor, ParsedOutput};
use crate::context::StepContext;
use crate::worker::Worker;

static CLAUDE_SAFE_TOOLS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["Read", "Grep", "Glob", "Edit", "Write", "Bash"].into_iter().collect());

const CLAUDE_REVIEWER_TOOLS: [&str; 3] = ["Read", "Grep", "Glob"];

/// With no override, a reviewer gets the read-only set and anything else
/// gets the full safe set — the reviewer-forcing logic below still applies
/// on top of this for any explicit override.
fn default_allowed_tools(role: &str) -> Vec<String> {
    if role.to_lowercase().contains("review") {
        CLAUDE_REVIEWER_TOOLS.iter().map(|s| s.to_string()).collect()
    } else {
        CLAUDE_SAFE_TOOLS.iter().map(|s| s.to_string()).collect()
    }
}

fn claude_allowed_tools(ctx: &StepContext) -> Vec<String> {
    let role_is_reviewer = ctx.step.role.to_lowercase().contains("review");
    let Some(requested) = &ctx.step.allowed_tools else {
        return default_allowed_tools(&ctx.step.role);
    };

    let mut normalized = Vec::new();
    let mut seen = HashSet::new();
    for raw in requested {
        let tool = raw.trim();
        if tool.is_empty() || seen.contains(tool) {
            continue;
        }
        normalized.push(tool.to_string());
        seen.insert(tool.to_string());
    }

    if normalized.is_empty() {
        return default_allowed_tools(&ctx.step.role);
    }

    let mut unknown: Vec<&String> = normalized.iter().filter(|t| !CLAUDE_SAFE_TOOLS.contains(t.as_str())).collect();
    if !unknown.is_empty() {
        unknown.sort();
        tracing::warn!(step_id = %ctx.step.step_id, unknown = ?unknown, "step requested unknown Claude tools");
    }

    let filtered: Vec<String> = normalized.into_iter().filter(|t| CLAUDE_SAFE_TOOLS.contains(t.as_str())).collect();
    if filtered.is_empty() {
        return default_allowed_tools(&ctx.step.role);
    }

    if role_is_reviewer {
        let reviewer_filtered: Vec<String> =
            filtered.iter().filter(|t| CLAUDE_REVIEWER_TOOLS.contains(&t.as_str())).cloned().collect();
        let denied: Vec<&String> = filtered.iter().filter(|t| !CLAUDE_REVIEWER_TOOLS.contains(&t.as_str())).collect();
        if !denied.is_empty() {
            tracing::warn!(
                step_id = %ctx.step.step_id,
                denied = ?denied,
                "step requested mutating Claude tools for reviewer role; forcing read-only"
            );
        }
        return if reviewer_filtered.is_empty() {
            CLAUDE_REVIEWER_TOOLS.iter().map(|s| s.to_string()).collect()
        } else {
            reviewer_filtered
        };
    }

    filtered
}

fn content_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(content_text).filter(|s| !s.is_empty()).collect();
            parts.join("\n").trim().to_string()
        }
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(text)) = map.get("text") {
                return text.clone();
            }
            if let Some(content) = map.get("content") {
                return content_text(content);
            }
            String::new()
        }
        _ => String::new(),
    }
}

fn extract_claude_text(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(extract_claude_text).filter(|s| !s.is_empty()).collect();
            parts.join("\n").trim().to_string()
        }
        serde_json::Value::Object(map) => {
            for key in ["result", "output_text", "output", "text", "completion"] {
                if let Some(serde_json::Value::String(s)) = map.get(key) {
                    if !s.trim().is_empty() {
                        return s.clone();
                    }
                }
            }
            if let Some(content) = map.get("content") {
                let text = content_text(content);
                if !text.is_empty() {
                    return text;
                }
            }
            if let Some(message @ serde_json::Value::Object(_)) = map.get("message") {
                let text = content_text(message);
                if !text.is_empty() {
                    return text;
                }
            }
            if let Some(messages @ serde_json::Value::Array(_)) = map.get("messages") {
                let text = content_text(messages);
                if !text.is_empty() {
                    return text;
                }
            }
            String::new()
        }
        _ => String::new(),
    }
}

pub struct ClaudeWorker;

impl AgentExecutor for ClaudeWorker {
    fn agent_name(&self) -> &'static str {
        "claude"
    }

    fn build_cmd(&self, ctx: &StepContext, full_prompt: &str) -> Vec<String> {
        let tools = claude_allowed_tools(ctx);
        vec![
            "claude".to_string(),
            "-p".to_string(),
            full_prompt.to_string(),
            "--allowedTools".to_string(),
            tools.join(","),
            "--output-format".to_string(),
            "json".to_string(),
        ]
    }

    fn parse_output(&self, _ctx: &StepContext, result: &CommandOutput) -> ParsedOutput {
        let mut parse_error: Option<String> = None;
        let mut extracted_text = String::new();

        match serde_json::from_str::<serde_json::Value>(&result.stdout) {
            Ok(payload) => {
                extracted_text = extract_claude_text(&payload).trim().to_string();
                if extracted_text.is_empty() {
                    extracted_text = serde_json::to_string_pretty(&payload).unwrap_or_default();
                }
            }
            Err(e) => parse_error = Some(e.to_string()),
        }

        if result.exit_code != 0 && parse_error.is_none() {
            parse_error = Some(format!("claude exited with code {}", result.exit_code));
        }

        if let Some(parse_error) = parse_error {
            let stdout: String = result.stdout.chars().take(8000).collect();
            let stderr: String = result.stderr.chars().take(8000).collect();
            let report_md = format!(
                "# Claude review [parse_error]\n\n- exit_code: `{}`\n- parse_error: `{parse_error}`\n\n## Raw stdout\n\n```\n{stdout}\n```\n\n## Raw stderr\n\n```\n{stderr}\n```\n",
                result.exit_code
            );
            return ParsedOutput {
                report_md,
                summary: format!("Claude parse_error (exit_code={})", result.exit_code),
                status: Some(StepStatus::Failed),
                error: Some(
                    ErrorInfo::new("parse_error", parse_error)
                        .with_details(serde_json::json!({"exit_code": result.exit_code})),
                ),
            };
        }

        let report_md = format!("# Claude review\n\n## Parsed response\n\n{extracted_text}\n");
        let summary = extracted_text
            .trim()
            .lines()
            .next()
            .map(|l| l.chars().take(200).collect())
            .unwrap_or_else(|| "Claude response parsed".to_string());

        ParsedOutput { report_md, summary, status: Some(StepStatus::Success), error: None }
    }

    fn build_logs(&self, ctx: &StepContext, result: &CommandOutput, status: StepStatus) -> String {
        let tools = claude_allowed_tools(ctx);
        format!(
            "[{}] claude run\nexit_code={}\nduration_ms={}\nkilled_by_watchdog={}\nallowed_tools={}\nstatus={status:?}\n",
            ctx.step.step_id,
            result.exit_code,
            result.duration_ms,
            result.killed_by_watchdog,
            tools.join(",")
        )
    }
}

#[async_trait]
impl Worker for ClaudeWorker {
    fn agent_name(&self) -> &'static str {
        AgentExecutor::agent_name(self)
    }

    fn required_binaries(&self, _step: &Step) -> HashSet<String> {
        ["claude".to_string()].into_iter().collect()
    }

    async fn run(&self, ctx: &StepContext) -> StepResult {
        run_cli_agent(self, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use flow_core::{HandoffStrategy, Id, JobSource, NetworkPolicy, Policy};
    use flow_policy::ExecutionPolicy;

    use super::*;

    fn ctx_for(role: &str, allowed_tools: Option<Vec<String>>) -> StepContext {
        let job = flow_core::Job {
            job_id: Id::new(),
            goal: "fix the bug".to_string(),
            source: JobSource::manual(),
            project_id: None,
            workdir: ".".to_string(),
            steps: vec![],
            policy: Policy::default(),
            callback_url: None,
            context_window: vec![],
            context_strategy: None,
            handoff_strategy: HandoffStrategy::Manual,
            tags: vec![],
            metadata: HashMap::new(),
        };
        let step = Step {
            step_id: "s1".to_string(),
            agent: "claude".to_string(),
            role: role.to_string(),
            prompt: "do it".to_string(),
            timeout_sec: 60,
            max_retries: 0,
            retry_backoff_sec: 5,
            input_artifacts: vec![],
            apply_patches_from: vec![],
            allowed_tools,
            on_failure: "stop".to_string(),
        };
        StepContext {
            job,
            step,
            job_dir: PathBuf::from("."),
            step_dir: PathBuf::from("."),
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

    #[test]
    fn implementer_with_no_override_gets_full_safe_set() {
        let ctx = ctx_for("implementer", None);
        let tools = claude_allowed_tools(&ctx);
        assert!(tools.contains(&"Edit".to_string()));
        assert!(tools.contains(&"Write".to_string()));
    }

    #[test]
    fn reviewer_with_no_override_gets_read_only_set() {
        let ctx = ctx_for("reviewer", None);
        let tools = claude_allowed_tools(&ctx);
        assert_eq!(tools, vec!["Read".to_string(), "Grep".to_string(), "Glob".to_string()]);
    }

    #[test]
    fn reviewer_override_requesting_mutating_tools_is_forced_read_only() {
        let ctx = ctx_for("reviewer", Some(vec!["Edit".to_string(), "Read".to_string()]));
        let tools = claude_allowed_tools(&ctx);
        assert!(!tools.contains(&"Edit".to_string()));
        assert!(tools.contains(&"Read".to_string()));
    }

    #[test]
    fn implementer_override_with_unknown_tool_drops_it() {
        let ctx = ctx_for("implementer", Some(vec!["Edit".to_string(), "Nonexistent".to_string()]));
        let tools = claude_allowed_tools(&ctx);
        assert_eq!(tools, vec!["Edit".to_string()]);
    }

    #[test]
    fn empty_override_falls_back_to_role_default() {
        let ctx = ctx_for("implementer", Some(vec![]));
        let tools = claude_allowed_tools(&ctx);
        assert!(tools.contains(&"Write".to_string()));
    }

    #[test]
    fn extract_claude_text_walks_known_keys() {
        let payload = serde_json::json!({"result": "hello from result"});
        assert_eq!(extract_claude_text(&payload), "hello from result");

        let payload = serde_json::json!({"message": {"content": [{"text": "nested content"}]}});
        assert_eq!(extract_claude_text(&payload), "nested content");

        let payload = serde_json::json!({"messages": [{"content": "from messages array"}]});
        assert_eq!(extract_claude_text(&payload), "from messages array");
    }
}
