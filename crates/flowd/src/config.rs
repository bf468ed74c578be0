//! Environment-sourced configuration. Grounded on spec.md §6's env var table
//! and the upstream `orchestrator/config.py`/`run_config.py` shape.

use std::collections::HashMap;
use std::path::PathBuf;

use flow_core::{HandoffStrategy, NetworkPolicy, StepStatus};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid boolean for {key}: {value:?}")]
    InvalidBool { key: &'static str, value: String },
    #[error("invalid integer for {key}: {value:?}")]
    InvalidInt { key: &'static str, value: String },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnum { key: &'static str, value: String },
}

type Result<T> = std::result::Result<T, ConfigError>;

fn env_str(key: &'static str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &'static str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool { key, value: raw }),
        },
    }
}

fn env_u64(key: &'static str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidInt { key, value: raw }),
    }
}

fn env_f64(key: &'static str, default: f64) -> Result<f64> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidInt { key, value: raw }),
    }
}

fn env_csv(key: &'static str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

/// `name=path,name=path` → map.
fn parse_project_aliases(raw: &str) -> HashMap<String, PathBuf> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, path) = pair.split_once('=')?;
            let name = name.trim();
            let path = path.trim();
            (!name.is_empty() && !path.is_empty()).then(|| (name.to_string(), PathBuf::from(path)))
        })
        .collect()
}

/// `token=proj1|proj2,…` (or a bare token meaning "any project"). `*` scopes
/// to every project.
fn parse_webhook_tokens(raw: &str) -> HashMap<String, Vec<String>> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            match entry.split_once('=') {
                Some((token, scopes)) => {
                    let scopes: Vec<String> = scopes.split('|').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
                    Some((token.trim().to_string(), scopes))
                }
                None => Some((entry.to_string(), vec!["*".to_string()])),
            }
        })
        .collect()
}

fn parse_handoff(raw: &str) -> Result<HandoffStrategy> {
    match raw {
        "manual" => Ok(HandoffStrategy::Manual),
        "patch_first" => Ok(HandoffStrategy::PatchFirst),
        "workspace_first" => Ok(HandoffStrategy::WorkspaceFirst),
        other => Err(ConfigError::InvalidEnum { key: "DEFAULT_ARTIFACT_HANDOFF", value: other.to_string() }),
    }
}

fn parse_network_policy(raw: &str) -> Result<NetworkPolicy> {
    match raw {
        "allow" => Ok(NetworkPolicy::Allow),
        "deny" => Ok(NetworkPolicy::Deny),
        other => Err(ConfigError::InvalidEnum { key: "NETWORK_POLICY", value: other.to_string() }),
    }
}

fn parse_non_git_status(raw: &str) -> Result<StepStatus> {
    match raw {
        "needs_human" => Ok(StepStatus::NeedsHuman),
        "failed" => Ok(StepStatus::Failed),
        other => Err(ConfigError::InvalidEnum { key: "NON_GIT_WORKDIR_STATUS", value: other.to_string() }),
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub queue_root: PathBuf,
    pub artifacts_root: PathBuf,
    pub workspaces_root: PathBuf,
    pub state_db_path: PathBuf,
    pub project_aliases: HashMap<String, PathBuf>,

    pub webhook_tokens: HashMap<String, Vec<String>>,
    pub webhook_rate_limit_window_sec: u64,
    pub webhook_rate_limit_max_requests: u64,
    pub max_webhook_body_bytes: u64,

    pub default_artifact_handoff: HandoffStrategy,

    pub runner_poll_interval_sec: u64,
    pub runner_max_idle_sec: u64,
    pub runner_reclaim_after_sec: u64,

    pub enable_real_cli: bool,

    pub sandbox: bool,
    pub sandbox_wrapper: Option<String>,
    pub sandbox_wrapper_args: Vec<String>,
    pub allowed_binaries: Vec<String>,
    pub network_policy: NetworkPolicy,

    pub env_allowlist: Vec<String>,
    pub sensitive_env_vars: Vec<String>,
    pub sandbox_clear_env: bool,

    pub max_input_artifacts_files: usize,
    pub max_input_artifact_chars: usize,
    pub max_input_artifacts_chars: usize,
    pub max_subprocess_output_chars: usize,

    pub max_daily_api_calls: i64,
    pub max_daily_cost_usd: f64,

    pub agent_prompts_dir: Option<PathBuf>,

    pub non_git_workdir_status: StepStatus,
    pub secrets_check_bin: String,

    pub retention_interval_sec: u64,
    pub artifacts_ttl_sec: u64,
    pub workspaces_ttl_sec: u64,

    pub log_level: String,
    pub log_json: bool,

    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            queue_root: PathBuf::from(env_str("QUEUE_ROOT", "./data/queue")),
            artifacts_root: PathBuf::from(env_str("ARTIFACTS_ROOT", "./data/artifacts")),
            workspaces_root: PathBuf::from(env_str("WORKSPACES_ROOT", "./data/workspaces")),
            state_db_path: PathBuf::from(env_str("STATE_DB_PATH", "./data/budget.db")),
            project_aliases: parse_project_aliases(&env_str("PROJECT_ALIASES", "")),

            webhook_tokens: parse_webhook_tokens(&env_str(
                "WEBHOOK_TOKENS",
                &std::env::var("WEBHOOK_TOKEN").unwrap_or_default(),
            )),
            webhook_rate_limit_window_sec: env_u64("WEBHOOK_RATE_LIMIT_WINDOW_SEC", 60)?,
            webhook_rate_limit_max_requests: env_u64("WEBHOOK_RATE_LIMIT_MAX_REQUESTS", 30)?,
            max_webhook_body_bytes: env_u64("MAX_WEBHOOK_BODY_BYTES", 1_048_576)?,

            default_artifact_handoff: parse_handoff(&env_str("DEFAULT_ARTIFACT_HANDOFF", "manual"))?,

            runner_poll_interval_sec: env_u64("RUNNER_POLL_INTERVAL_SEC", 2)?,
            runner_max_idle_sec: env_u64("RUNNER_MAX_IDLE_SEC", 300)?,
            runner_reclaim_after_sec: env_u64("RUNNER_RECLAIM_AFTER_SEC", 900)?,

            enable_real_cli: env_bool("ENABLE_REAL_CLI", false)?,

            sandbox: env_bool("SANDBOX", true)?,
            sandbox_wrapper: std::env::var("SANDBOX_WRAPPER").ok().filter(|s| !s.is_empty()),
            sandbox_wrapper_args: env_csv("SANDBOX_WRAPPER_ARGS"),
            allowed_binaries: env_csv("ALLOWED_BINARIES"),
            network_policy: parse_network_policy(&env_str("NETWORK_POLICY", "deny"))?,

            env_allowlist: env_csv("ENV_ALLOWLIST"),
            sensitive_env_vars: env_csv("SENSITIVE_ENV_VARS"),
            sandbox_clear_env: env_bool("SANDBOX_CLEAR_ENV", true)?,

            max_input_artifacts_files: env_u64("MAX_INPUT_ARTIFACTS_FILES", 20)? as usize,
            max_input_artifact_chars: env_u64("MAX_INPUT_ARTIFACT_CHARS", 20_000)? as usize,
            max_input_artifacts_chars: env_u64("MAX_INPUT_ARTIFACTS_CHARS", 100_000)? as usize,
            max_subprocess_output_chars: env_u64("MAX_SUBPROCESS_OUTPUT_CHARS", 200_000)? as usize,

            max_daily_api_calls: env_u64("MAX_DAILY_API_CALLS", 0)? as i64,
            max_daily_cost_usd: env_f64("MAX_DAILY_COST_USD", 0.0)?,

            agent_prompts_dir: std::env::var("AGENT_PROMPTS_DIR").ok().filter(|s| !s.is_empty()).map(PathBuf::from),

            non_git_workdir_status: parse_non_git_status(&env_str("NON_GIT_WORKDIR_STATUS", "needs_human"))?,
            secrets_check_bin: env_str("SECRETS_CHECK_BIN", crate::secrets_check::DEFAULT_SECRETS_CHECK_BIN),

            retention_interval_sec: env_u64("RETENTION_INTERVAL_SEC", 3600)?,
            artifacts_ttl_sec: env_u64("ARTIFACTS_TTL_SEC", 604_800)?,
            workspaces_ttl_sec: env_u64("WORKSPACES_TTL_SEC", 604_800)?,

            log_level: env_str("LOG_LEVEL", "info"),
            log_json: env_bool("LOG_JSON", false)?,

            bind_addr: env_str("BIND_ADDR", "0.0.0.0:8080"),
        })
    }
}
