//! Post-step secrets check: an external helper binary inspects a completed
//! step's artifact directory for leaked credentials. Grounded on spec.md
//! §4.8's "post-step secrets check" note — the upstream orchestrator has no
//! standalone module for this, so the invocation shape follows
//! `flow_subprocess::run_command`'s already-established pattern rather than
//! a bespoke one.
//!
//! Run unconditionally after every step attempt, independent of the worker's
//! own reported status: a nonzero exit from the helper always downgrades the
//! step to `failed` with `error.code = "secrets_check_failed"`.

use std::path::Path;

use flow_core::SecretsCheck;

/// Default helper: a no-op reference script that always exits 0. Operators
/// wire in a real scanner (gitleaks, trufflehog, a custom grep) via
/// `SECRETS_CHECK_BIN`.
pub const DEFAULT_SECRETS_CHECK_BIN: &str = "true";

pub struct SecretsCheckOutcome {
    pub result: SecretsCheck,
    pub detail: Option<String>,
}

/// Invoke `bin <step_dir>` and map its exit code to a [`SecretsCheck`]. Any
/// failure to even launch the helper (missing binary, permission error) is
/// treated as a check failure rather than silently passing.
pub async fn run_secrets_check(bin: &str, step_dir: &Path) -> SecretsCheckOutcome {
    let output = tokio::process::Command::new(bin).arg(step_dir).output().await;

    match output {
        Ok(out) if out.status.success() => SecretsCheckOutcome { result: SecretsCheck::Passed, detail: None },
        Ok(out) => SecretsCheckOutcome {
            result: SecretsCheck::Failed,
            detail: Some(format!(
                "secrets check exited {}: {}",
                out.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        },
        Err(e) => SecretsCheckOutcome {
            result: SecretsCheck::Failed,
            detail: Some(format!("failed to run secrets check helper '{bin}': {e}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn default_helper_always_passes() {
        let dir = TempDir::new().unwrap();
        let outcome = run_secrets_check(DEFAULT_SECRETS_CHECK_BIN, dir.path()).await;
        assert!(matches!(outcome.result, SecretsCheck::Passed));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_check() {
        let dir = TempDir::new().unwrap();
        let outcome = run_secrets_check("false", dir.path()).await;
        assert!(matches!(outcome.result, SecretsCheck::Failed));
    }

    #[tokio::test]
    async fn missing_binary_fails_the_check() {
        let dir = TempDir::new().unwrap();
        let outcome = run_secrets_check("no-such-binary-flow-test", dir.path()).await;
        assert!(matches!(outcome.result, SecretsCheck::Failed));
        assert!(outcome.detail.is_some());
    }
}
