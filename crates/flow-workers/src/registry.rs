//! Worker lookup table. Grounded on `workers/registry.py`.
//!
//! Entry-point plugin loading (`load_worker_plugins` in the Python original)
//! has no Rust analog without dynamic loading (`libloading`) and is out of
//! scope; builtin workers are registered explicitly at startup instead, see
//! [`register_builtin_workers`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::claude_worker::ClaudeWorker;
use crate::codex_worker::CodexWorker;
use crate::kimi_worker::KimiWorker;
use crate::opencode_worker::OpencodeWorker;
use crate::worker::Worker;

struct Entry {
    worker: Arc<dyn Worker>,
    type_id: std::any::TypeId,
}

/// Maps agent name to worker implementation. Registration warns, but does
/// not refuse, when an agent name is re-registered with a different
/// concrete type — mirroring the upstream orchestrator's plugin-override
/// semantics.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<&'static str, Entry>>,
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.workers.lock().expect("registry lock poisoned").keys().copied().collect();
        f.debug_struct("WorkerRegistry").field("agents", &names).finish()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self { workers: Mutex::new(HashMap::new()) }
    }

    pub fn register<W>(&self, worker: W)
    where
        W: Worker + 'static,
    {
        let name = worker.agent_name();
        let type_id = std::any::TypeId::of::<W>();
        let mut workers = self.workers.lock().expect("registry lock poisoned");
        if let Some(previous) = workers.get(name) {
            if previous.type_id != type_id {
                tracing::warn!(agent = name, "worker was replaced with a different implementation");
            }
        }
        workers.insert(name, Entry { worker: Arc::new(worker), type_id });
    }

    pub fn get(&self, agent_name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.lock().expect("registry lock poisoned").get(agent_name).map(|e| Arc::clone(&e.worker))
    }

    pub fn list(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.workers.lock().expect("registry lock poisoned").keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Registers the shipped workers. Called once from `flowd`'s startup path.
pub fn register_builtin_workers(registry: &WorkerRegistry) {
    registry.register(ClaudeWorker);
    registry.register(CodexWorker);
    registry.register(OpencodeWorker);
    registry.register(KimiWorker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use async_trait::async_trait;
    use flow_core::{Step, StepResult};

    struct Probe(&'static str);

    #[async_trait]
    impl Worker for Probe {
        fn agent_name(&self) -> &'static str {
            self.0
        }
        fn required_binaries(&self, _step: &Step) -> HashSet<String> {
            HashSet::new()
        }
        async fn run(&self, ctx: &crate::context::StepContext) -> StepResult {
            crate::base::simulate(ctx)
        }
    }

    struct ProbeB(&'static str);

    #[async_trait]
    impl Worker for ProbeB {
        fn agent_name(&self) -> &'static str {
            self.0
        }
        fn required_binaries(&self, _step: &Step) -> HashSet<String> {
            HashSet::new()
        }
        async fn run(&self, ctx: &crate::context::StepContext) -> StepResult {
            crate::base::simulate(ctx)
        }
    }

    #[test]
    fn builtin_workers_are_registered_by_name() {
        let registry = WorkerRegistry::new();
        register_builtin_workers(&registry);
        assert_eq!(registry.list(), vec!["claude", "codex", "kimi", "opencode"]);
    }

    #[test]
    fn register_same_type_twice_is_silent() {
        let registry = WorkerRegistry::new();
        registry.register(Probe("x"));
        registry.register(Probe("x"));
        assert!(registry.get("x").is_some());
    }

    #[test]
    fn register_different_type_replaces_and_would_warn() {
        let registry = WorkerRegistry::new();
        registry.register(Probe("x"));
        registry.register(ProbeB("x"));
        assert!(registry.get("x").is_some());
    }
}
