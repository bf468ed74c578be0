//! HTTP intake gateway for `flowd`.
//!
//! Implements the webhook/status surface from spec.md §6: `POST /webhook`
//! enqueues a job, `GET /jobs/{id}` reports its current state, `GET /health`
//! and `GET /metrics` round out the operational surface. Grounded on
//! `loopd`'s `server.rs` router/auth/test shape, generalized to scoped
//! multi-token auth, a sliding-window rate limiter, and a body-size cap per
//! `gateway/webhook_server.py`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flow_core::{ContextStrategy, HandoffStrategy, Id, Job, JobSource, Policy, QueueState, Step};
use flow_store::ArtifactStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::Config;

/// Shared state for HTTP handlers. One rate-limit bucket per bearer token.
pub struct AppState {
    pub config: Config,
    pub queue: flow_queue::FileQueue,
    pub store: ArtifactStore,
    rate_limiter: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl AppState {
    pub fn new(config: Config, queue: flow_queue::FileQueue, store: ArtifactStore) -> Self {
        Self { config, queue, store, rate_limiter: Mutex::new(HashMap::new()) }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_webhook_body_bytes as usize;
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/webhook", post(webhook))
        .route("/jobs/{id}", get(job_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>) -> crate::AppResult<()> {
    let addr: SocketAddr = state.config.bind_addr.parse()?;
    info!(%addr, "HTTP intake gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_router(state).into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

/// A uniform error response carrying an optional `Retry-After` header, since
/// the rate limiter (unlike the teacher's plain auth failures) needs to set
/// one alongside its status code.
struct ApiError {
    status: StatusCode,
    message: String,
    retry_after_sec: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), retry_after_sec: None }
    }

    fn rate_limited(retry_after_sec: u64) -> Self {
        Self { status: StatusCode::TOO_MANY_REQUESTS, message: "rate limit exceeded".to_string(), retry_after_sec: Some(retry_after_sec) }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(ErrorResponse { error: self.message })).into_response();
        if let Some(secs) = self.retry_after_sec {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Compares two byte strings without short-circuiting on the first mismatch,
/// so a failed compare doesn't leak how many leading bytes matched. Spec.md
/// calls out a constant-time token compare explicitly; the teacher's own
/// `check_auth` uses plain `==` since it has no untrusted network exposure,
/// so this doesn't track the teacher beyond the overall auth shape.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extract and verify the bearer token, returning the matched token string
/// (used as the rate-limit bucket key). `401` when the header is absent or
/// malformed, `403` when a token is present but matches nothing configured.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    let Some(token) = provided else {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing Authorization: Bearer <token>"));
    };

    if state.config.webhook_tokens.is_empty() {
        return Ok(token.to_string());
    }
    for candidate in state.config.webhook_tokens.keys() {
        if constant_time_eq(token.as_bytes(), candidate.as_bytes()) {
            return Ok(candidate.clone());
        }
    }
    Err(ApiError::new(StatusCode::FORBIDDEN, "invalid token"))
}

/// A token scoped to `*` may submit for any project; otherwise the job's
/// `project_id` must appear in the token's scope list.
fn authorize_project(state: &AppState, token: &str, project_id: Option<&str>) -> Result<(), ApiError> {
    let Some(scopes) = state.config.webhook_tokens.get(token) else {
        return Ok(());
    };
    if scopes.iter().any(|s| s == "*") {
        return Ok(());
    }
    match project_id {
        Some(pid) if scopes.iter().any(|s| s == pid) => Ok(()),
        _ => Err(ApiError::new(StatusCode::FORBIDDEN, "token is not scoped to the requested project")),
    }
}

fn check_rate_limit(state: &AppState, key: &str) -> Result<(), ApiError> {
    let window = Duration::from_secs(state.config.webhook_rate_limit_window_sec);
    let max = state.config.webhook_rate_limit_max_requests;
    let now = Instant::now();

    let mut buckets = state.rate_limiter.lock().expect("rate limiter lock poisoned");
    let bucket = buckets.entry(key.to_string()).or_default();
    while let Some(&oldest) = bucket.front() {
        if now.duration_since(oldest) > window {
            bucket.pop_front();
        } else {
            break;
        }
    }
    if bucket.len() as u64 >= max {
        return Err(ApiError::rate_limited(state.config.webhook_rate_limit_window_sec));
    }
    bucket.push_back(now);
    Ok(())
}

/// The same three-agent pipeline the upstream orchestrator defaults to when
/// a webhook submission omits `steps`.
fn default_pipeline(goal: &str) -> Vec<Step> {
    vec![
        Step {
            step_id: "01_plan".to_string(),
            agent: "opencode".to_string(),
            role: "planner".to_string(),
            prompt: format!("Produce an implementation plan for the task:\n{goal}"),
            timeout_sec: 120,
            max_retries: 1,
            retry_backoff_sec: 5,
            input_artifacts: vec![],
            apply_patches_from: vec![],
            allowed_tools: None,
            on_failure: "stop".to_string(),
        },
        Step {
            step_id: "02_implement".to_string(),
            agent: "codex".to_string(),
            role: "implementer".to_string(),
            prompt: format!("Implement the task and prepare a patch:\n{goal}"),
            timeout_sec: 300,
            max_retries: 1,
            retry_backoff_sec: 5,
            input_artifacts: vec!["steps/01_plan/report.md".to_string()],
            apply_patches_from: vec![],
            allowed_tools: None,
            on_failure: "stop".to_string(),
        },
        Step {
            step_id: "03_review".to_string(),
            agent: "claude".to_string(),
            role: "reviewer".to_string(),
            prompt: format!("Review the changes and risks for the task:\n{goal}"),
            timeout_sec: 180,
            max_retries: 1,
            retry_backoff_sec: 5,
            input_artifacts: vec!["steps/01_plan/report.md".to_string(), "steps/02_implement/report.md".to_string(), "steps/02_implement/patch.diff".to_string()],
            apply_patches_from: vec![],
            allowed_tools: None,
            on_failure: "stop".to_string(),
        },
    ]
}

fn parse_handoff(raw: &str) -> Result<HandoffStrategy, ApiError> {
    match raw {
        "manual" => Ok(HandoffStrategy::Manual),
        "patch_first" => Ok(HandoffStrategy::PatchFirst),
        "workspace_first" => Ok(HandoffStrategy::WorkspaceFirst),
        other => Err(ApiError::new(StatusCode::BAD_REQUEST, format!("invalid artifact_handoff: {other}"))),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct WebhookRequest {
    goal: String,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    callback_url: Option<String>,
    #[serde(default)]
    steps: Option<Vec<Step>>,
    #[serde(default)]
    policy: Policy,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    context_window: Vec<serde_json::Value>,
    #[serde(default)]
    context_strategy: Option<ContextStrategy>,
    #[serde(default)]
    artifact_handoff: Option<String>,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: String,
    job_id: String,
    artifacts_dir: String,
    status_url: String,
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<WebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = authenticate(&state, &headers)?;
    authorize_project(&state, &token, req.project_id.as_deref())?;
    check_rate_limit(&state, &token)?;

    let goal = req.goal.trim().to_string();
    if goal.is_empty() || goal.len() > 5000 {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "'goal' must be 1-5000 characters"));
    }

    let steps = match req.steps {
        Some(steps) if !steps.is_empty() => steps,
        Some(_) => return Err(ApiError::new(StatusCode::BAD_REQUEST, "'steps' must not be empty when provided")),
        None => default_pipeline(&goal),
    };

    let handoff_strategy = match &req.artifact_handoff {
        Some(raw) => parse_handoff(raw)?,
        None => state.config.default_artifact_handoff,
    };

    let mut source_meta = HashMap::new();
    source_meta.insert("remote".to_string(), serde_json::Value::String(addr.ip().to_string()));

    let job = Job {
        job_id: Id::new(),
        goal,
        source: JobSource::webhook(source_meta),
        project_id: req.project_id,
        workdir: ".".to_string(),
        steps,
        policy: req.policy,
        callback_url: req.callback_url,
        context_window: req.context_window,
        context_strategy: req.context_strategy,
        handoff_strategy,
        tags: req.tags,
        metadata: req.metadata,
    };

    if let Err(msg) = job.validate_invariants() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, msg));
    }
    let job_value = serde_json::to_value(&job).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    if let Err(e) = flow_core::schema::validate_job(&job_value) {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, e.to_string()));
    }

    let requires_approval = job.policy.requires_approval;
    let job_id = job.job_id.to_string();

    match state.queue.enqueue(job) {
        Ok(_) => {}
        Err(flow_queue::QueueError::DuplicateJob(id)) => {
            return Err(ApiError::new(StatusCode::CONFLICT, format!("duplicate job id: {id}")));
        }
        Err(e) => return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }

    let status = if requires_approval { "awaiting_approval" } else { "queued" };
    info!(job_id = %job_id, status, "job enqueued via webhook");

    Ok((
        StatusCode::OK,
        Json(WebhookResponse {
            status: status.to_string(),
            artifacts_dir: state.config.artifacts_root.join(&job_id).to_string_lossy().into_owned(),
            status_url: format!("/jobs/{job_id}"),
            job_id,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    job_id: String,
    status: Option<String>,
    queue_state: Option<&'static str>,
    state: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
}

async fn job_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let queue_state =
        state.queue.queue_state(&id).map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let job_dir = state.store.job_dir(&id).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    if queue_state.is_none() && !job_dir.exists() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("unknown job_id: {id}")));
    }

    let state_json = read_json_opt(&job_dir.join("state.json"));
    let result_json = read_json_opt(&job_dir.join("result.json"));
    let status = result_json.as_ref().and_then(|v| v.get("status")).and_then(|s| s.as_str()).map(str::to_string);

    Ok(Json(JobStatusResponse {
        job_id: id,
        status,
        queue_state: queue_state.map(QueueState::dir_name),
        state: state_json,
        result: result_json,
    }))
}

fn read_json_opt(path: &std::path::Path) -> Option<serde_json::Value> {
    std::fs::read_to_string(path).ok().and_then(|raw| serde_json::from_str(&raw).ok())
}

/// Metrics are computed fresh from the filesystem on every scrape rather
/// than tracked as in-memory counters, matching `metrics.py`'s stateless
/// rendering: a restarted `flowd` reports the same numbers a second later.
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], render_metrics(&state))
}

fn render_metrics(state: &AppState) -> String {
    let mut out = String::new();

    out.push_str("# HELP orchestrator_queue_jobs Jobs currently sitting in each queue directory.\n");
    out.push_str("# TYPE orchestrator_queue_jobs gauge\n");
    for q in QueueState::ALL {
        let count = count_json_files(&state.config.queue_root.join(q.dir_name()));
        out.push_str(&format!("orchestrator_queue_jobs{{state=\"{}\"}} {count}\n", q.dir_name()));
    }

    let mut jobs_total: HashMap<String, u64> = HashMap::new();
    let mut steps_total: HashMap<String, u64> = HashMap::new();
    let mut duration_sum_ms: u64 = 0;
    let mut duration_count: u64 = 0;

    if let Ok(entries) = std::fs::read_dir(&state.config.artifacts_root) {
        for entry in entries.flatten() {
            let Some(result) = read_json_opt(&entry.path().join("result.json")) else { continue };

            if let Some(status) = result.get("status").and_then(|v| v.as_str()) {
                *jobs_total.entry(status.to_string()).or_insert(0) += 1;
            }
            if let Some(steps) = result.get("steps").and_then(|v| v.as_array()) {
                for step in steps {
                    if let Some(status) = step.get("status").and_then(|v| v.as_str()) {
                        *steps_total.entry(status.to_string()).or_insert(0) += 1;
                    }
                }
            }
            if let (Some(started), Some(finished)) = (
                result.get("started_at").and_then(|v| v.as_str()).and_then(parse_rfc3339),
                result.get("finished_at").and_then(|v| v.as_str()).and_then(parse_rfc3339),
            ) {
                duration_sum_ms += (finished - started).num_milliseconds().max(0) as u64;
                duration_count += 1;
            }
        }
    }

    out.push_str("# HELP orchestrator_jobs_total Terminal jobs observed, by final status.\n");
    out.push_str("# TYPE orchestrator_jobs_total counter\n");
    for (status, count) in &jobs_total {
        out.push_str(&format!("orchestrator_jobs_total{{status=\"{status}\"}} {count}\n"));
    }

    out.push_str("# HELP orchestrator_steps_total Completed steps observed, by status.\n");
    out.push_str("# TYPE orchestrator_steps_total counter\n");
    for (status, count) in &steps_total {
        out.push_str(&format!("orchestrator_steps_total{{status=\"{status}\"}} {count}\n"));
    }

    out.push_str("# HELP orchestrator_job_duration_ms Wall-clock duration of completed jobs.\n");
    out.push_str("# TYPE orchestrator_job_duration_ms summary\n");
    out.push_str(&format!("orchestrator_job_duration_ms_sum {duration_sum_ms}\n"));
    out.push_str(&format!("orchestrator_job_duration_ms_count {duration_count}\n"));

    out
}

fn parse_rfc3339(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&chrono::Utc))
}

fn count_json_files(dir: &std::path::Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|read_dir| {
            read_dir
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
                .count() as u64
        })
        .unwrap_or(0)
}
