//! The job/step/result data model described in the component spec's data
//! model section.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// Where a job originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSourceKind {
    Webhook,
    Manual,
    Cron,
}

/// A job's origin tag plus whatever free-form metadata the intake collaborator
/// attached (e.g. the remote address for a webhook, the schedule name for a
/// cron trigger).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSource {
    #[serde(rename = "type")]
    pub kind: JobSourceKind,
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}

impl JobSource {
    pub fn manual() -> Self {
        Self { kind: JobSourceKind::Manual, meta: HashMap::new() }
    }

    pub fn webhook(meta: HashMap<String, serde_json::Value>) -> Self {
        Self { kind: JobSourceKind::Webhook, meta }
    }

    pub fn cron(meta: HashMap<String, serde_json::Value>) -> Self {
        Self { kind: JobSourceKind::Cron, meta }
    }
}

impl Default for JobSource {
    fn default() -> Self {
        Self::manual()
    }
}

/// How accumulated context is carried between steps of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    Full,
    Summarize,
    Sliding,
}

/// How artifacts from one step are handed off as inputs to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStrategy {
    Manual,
    PatchFirst,
    WorkspaceFirst,
}

/// What a step's worker should do when it exhausts its retries.
///
/// Stored on [`Step`] as a plain string (`stop`, `continue`, `ask_human`, or
/// `goto:<step_id>`) and parsed on demand; see [`Step::on_failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnFailure {
    Stop,
    Continue,
    AskHuman,
    Goto(String),
}

impl OnFailure {
    pub fn parse(raw: &str) -> Self {
        if let Some(target) = raw.strip_prefix("goto:") {
            OnFailure::Goto(target.to_string())
        } else {
            match raw {
                "stop" => OnFailure::Stop,
                "continue" => OnFailure::Continue,
                "ask_human" => OnFailure::AskHuman,
                other => OnFailure::Goto(other.to_string()),
            }
        }
    }
}

/// Network policy, merged deny-wins across job and base policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    Allow,
    Deny,
}

/// A job's requested execution policy overrides. `None` fields inherit the
/// runner's base policy unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub sandbox: Option<bool>,
    #[serde(default)]
    pub network_policy: Option<NetworkPolicy>,
    #[serde(default)]
    pub allowed_binaries: Option<Vec<String>>,
    #[serde(default)]
    pub requires_approval: bool,
}

/// A single step within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub agent: String,
    #[serde(default = "default_role")]
    pub role: String,
    pub prompt: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_sec")]
    pub retry_backoff_sec: u32,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub apply_patches_from: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default = "default_on_failure")]
    pub on_failure: String,
}

fn default_role() -> String {
    "implementer".to_string()
}
fn default_timeout_sec() -> u32 {
    600
}
fn default_max_retries() -> u32 {
    0
}
fn default_retry_backoff_sec() -> u32 {
    5
}
fn default_on_failure() -> String {
    "stop".to_string()
}

impl Step {
    pub fn on_failure(&self) -> OnFailure {
        OnFailure::parse(&self.on_failure)
    }
}

/// A job submitted to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Id,
    pub goal: String,
    #[serde(default = "default_source")]
    pub source: JobSource,
    #[serde(default)]
    pub project_id: Option<String>,
    pub workdir: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Prior conversational turns carried into each step's prompt when
    /// `context_strategy` is set. Shape is agent-defined; the runner only
    /// threads it through unchanged.
    #[serde(default)]
    pub context_window: Vec<serde_json::Value>,
    #[serde(default)]
    pub context_strategy: Option<ContextStrategy>,
    #[serde(default = "default_handoff")]
    pub handoff_strategy: HandoffStrategy,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_source() -> JobSource {
    JobSource::manual()
}
fn default_handoff() -> HandoffStrategy {
    HandoffStrategy::Manual
}

impl Job {
    /// goal length must be in [1, 5000]; steps must be non-empty.
    pub fn validate_invariants(&self) -> Result<(), String> {
        if self.goal.is_empty() || self.goal.len() > 5000 {
            return Err(format!(
                "goal length {} out of bounds [1, 5000]",
                self.goal.len()
            ));
        }
        if self.steps.is_empty() {
            return Err("job must have at least one step".to_string());
        }
        if !self.job_id.is_safe_path_component() {
            return Err(format!("unsafe job_id: {}", self.job_id));
        }
        Ok(())
    }
}

/// Status of a completed or in-flight step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Retryable,
    Timeout,
    Cancelled,
    NeedsHuman,
    Running,
}

/// Whether a step produced a non-empty patch against the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Changed,
    NoChanges,
}

impl ChangeStatus {
    /// The `snake_case` wire form, also used when embedding the status in a
    /// human-readable summary line (e.g. `"tests passed (changed)"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Changed => "changed",
            Self::NoChanges => "no_changes",
        }
    }
}

/// Whether the post-step secrets check passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretsCheck {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// The result of running a single step, written as `steps/<step_id>/result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub job_id: Id,
    pub step_id: String,
    pub agent: String,
    pub role: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: String,
    #[serde(default)]
    pub change_status: Option<ChangeStatus>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub secrets_check: Option<SecretsCheck>,
    pub metrics: Metrics,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

/// Overall job status, the aggregate of all step results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failed,
    NeedsHuman,
    Cancelled,
}

/// The terminal result of a job, written as `result.json` at the job root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Id,
    pub status: JobStatus,
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// passed iff every step's secrets_check passed.
    pub secrets_check: SecretsCheck,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn aggregate_secrets_check(steps: &[StepResult]) -> SecretsCheck {
        if steps
            .iter()
            .all(|s| matches!(s.secrets_check, Some(SecretsCheck::Passed)))
        {
            SecretsCheck::Passed
        } else {
            SecretsCheck::Failed
        }
    }
}

/// Which queue directory a job currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Running,
    Done,
    Failed,
    AwaitingApproval,
}

impl QueueState {
    pub fn dir_name(self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Running => "running",
            QueueState::Done => "done",
            QueueState::Failed => "failed",
            QueueState::AwaitingApproval => "awaiting_approval",
        }
    }

    pub const ALL: [QueueState; 5] = [
        QueueState::Pending,
        QueueState::Running,
        QueueState::Done,
        QueueState::Failed,
        QueueState::AwaitingApproval,
    ];
}

/// The on-disk queue entry: the job itself plus lifecycle bookkeeping.
/// The filename carries the job_id for convenience only; this struct's
/// `job.job_id` field is the authoritative identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job: Job,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt: u32,
}
