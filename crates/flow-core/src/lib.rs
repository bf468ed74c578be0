//! Shared data model, error types, schema validation, and redaction for the
//! job orchestrator.

pub mod error;
pub mod ids;
pub mod redact;
pub mod schema;
pub mod types;

pub use error::{CoreError, Result};
pub use ids::Id;
pub use redact::{redact_env_values, redact_secrets, SENSITIVE_ENV_VARS};
pub use types::{
    ChangeStatus, ContextStrategy, ErrorInfo, HandoffStrategy, Job, JobResult, JobSource,
    JobSourceKind, JobStatus, Metrics, NetworkPolicy, OnFailure, Policy, QueueEntry, QueueState,
    SecretsCheck, Step, StepResult, StepStatus,
};
