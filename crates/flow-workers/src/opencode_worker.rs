//! OpenCode CLI worker. Grounded on `workers/opencode_worker.py`.

use std::collections::HashSet;

use async_trait::async_trait;
use flow_core::{Step, StepResult};
use flow_subprocess::CommandOutput;

use crate::agent_executor::{run_cli_agent, AgentExecutor, ParsedOutput};
use crate::context::StepContext;
use crate::worker::Worker;

pub struct OpencodeWorker;

impl AgentExecutor for OpencodeWorker {
    fn agent_name(&self) -> &'static str {
        "opencode"
    }

    fn build_cmd(&self, _ctx: &StepContext, full_prompt: &str) -> Vec<String> {
        vec!["opencode".to_string(), "run".to_string(), "--format".to_string(), "json".to_string(), full_prompt.to_string()]
    }

    fn parse_output(&self, ctx: &StepContext, result: &CommandOutput) -> ParsedOutput {
        let stdout: String = result.stdout.chars().take(8000).collect();
        let stderr: String = result.stderr.chars().take(8000).collect();
        ParsedOutput {
            report_md: format!(
                "# OpenCode step {}\n\n## Exit code\n\n`{}`\n\n## Raw stdout\n\n```\n{stdout}\n```\n\n## Raw stderr\n\n```\n{stderr}\n```\n",
                ctx.step.step_id, result.exit_code
            ),
            summary: format!("OpenCode exit_code={}", result.exit_code),
            status: None,
            error: None,
        }
    }
}

#[async_trait]
impl Worker for OpencodeWorker {
    fn agent_name(&self) -> &'static str {
        AgentExecutor::agent_name(self)
    }

    fn required_binaries(&self, _step: &Step) -> HashSet<String> {
        ["opencode".to_string()].into_iter().collect()
    }

    async fn run(&self, ctx: &StepContext) -> StepResult {
        run_cli_agent(self, ctx).await
    }
}
