use std::collections::HashSet;

use async_trait::async_trait;
use flow_core::{Step, StepResult};

use crate::context::StepContext;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A pluggable coding-agent worker. Implementors are registered by name in a
/// [`crate::registry::WorkerRegistry`] and dispatched to by the runner.
#[async_trait]
pub trait Worker: Send + Sync {
    fn agent_name(&self) -> &'static str;
    fn required_binaries(&self, step: &Step) -> HashSet<String>;
    async fn run(&self, ctx: &StepContext) -> StepResult;
}
