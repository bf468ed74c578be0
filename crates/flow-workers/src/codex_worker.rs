//! Codex CLI worker. Grounded on `workers/codex_worker.py`.

use std::collections::HashSet;

use async_trait::async_trait;
use flow_core::{Step, StepResult};
use flow_subprocess::CommandOutput;

use crate::agent_executor::{run_cli_agent, AgentExecutor, ParsedOutput};
use crate::context::StepContext;
use crate::worker::Worker;

pub struct CodexWorker;

impl AgentExecutor for CodexWorker {
    fn agent_name(&self) -> &'static str {
        "codex"
    }

    fn build_cmd(&self, _ctx: &StepContext, full_prompt: &str) -> Vec<String> {
        vec!["codex".to_string(), "exec".to_string(), "--json".to_string(), full_prompt.to_string()]
    }

    fn parse_output(&self, _ctx: &StepContext, result: &CommandOutput) -> ParsedOutput {
        let stdout: String = result.stdout.chars().take(8000).collect();
        let stderr: String = result.stderr.chars().take(8000).collect();
        ParsedOutput {
            report_md: format!(
                "# Codex implementer\n\n## Exit code\n\n`{}`\n\n## Raw stdout\n\n```\n{stdout}\n```\n\n## Raw stderr\n\n```\n{stderr}\n```\n",
                result.exit_code
            ),
            summary: format!("Codex exit_code={}", result.exit_code),
            status: None,
            error: None,
        }
    }
}

#[async_trait]
impl Worker for CodexWorker {
    fn agent_name(&self) -> &'static str {
        AgentExecutor::agent_name(self)
    }

    fn required_binaries(&self, _step: &Step) -> HashSet<String> {
        ["codex".to_string()].into_iter().collect()
    }

    async fn run(&self, ctx: &StepContext) -> StepResult {
        run_cli_agent(self, ctx).await
    }
}
