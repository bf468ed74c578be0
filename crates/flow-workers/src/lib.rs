//! Worker execution templates, concrete agent implementations, the worker
//! registry, and the daily budget ledger.

mod agent_executor;
mod api_worker;
mod base;
mod budget;
mod claude_worker;
mod codex_worker;
mod context;
mod kimi_worker;
mod opencode_worker;
mod prompt;
mod registry;
mod worker;

pub use agent_executor::{run_cli_agent, AgentExecutor, ParsedOutput};
pub use api_worker::{run_api_agent, ApiAgent, ApiResponse};
pub use base::{
    apply_requested_patches, artifact_paths, capture_base_commit, capture_patch_diff, early_failure, ensure_git_repo,
    full_prompt, redact_text, simulate, write_artifacts,
};
pub use budget::{BudgetError, BudgetSnapshot, BudgetTracker};
pub use claude_worker::ClaudeWorker;
pub use codex_worker::CodexWorker;
pub use context::StepContext;
pub use kimi_worker::KimiWorker;
pub use opencode_worker::OpencodeWorker;
pub use prompt::{build_full_prompt, load_system_prompt};
pub use registry::{register_builtin_workers, WorkerRegistry};
pub use worker::{Worker, WorkerError};
