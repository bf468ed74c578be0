//! Kimi API worker. Grounded on `workers/kimi_worker.py`.
//!
//! The upstream orchestrator simulates this call pending a real Kimi API
//! key; we keep that deterministic placeholder rather than fabricate an HTTP
//! integration with no production credentials to ground it against.

use std::collections::HashSet;

use async_trait::async_trait;
use flow_core::{Step, StepResult};

use crate::api_worker::{run_api_agent, ApiAgent, ApiResponse};
use crate::context::StepContext;
use crate::worker::Worker;

pub struct KimiWorker;

#[async_trait]
impl ApiAgent for KimiWorker {
    fn agent_name(&self) -> &'static str {
        "kimi"
    }

    async fn call_api(&self, prompt: &str, _ctx: &StepContext) -> Result<ApiResponse, String> {
        let preview: String = prompt.chars().take(100).collect();
        let text = format!(
            "Kimi (Simulated): Hello! I received your prompt:\n\n> {preview}...\n\nI am ready to assist you with coding or analysis."
        );
        Ok(ApiResponse::success(text))
    }
}

#[async_trait]
impl Worker for KimiWorker {
    fn agent_name(&self) -> &'static str {
        ApiAgent::agent_name(self)
    }

    fn required_binaries(&self, _step: &Step) -> HashSet<String> {
        HashSet::new()
    }

    async fn run(&self, ctx: &StepContext) -> StepResult {
        run_api_agent(self, ctx).await
    }
}
