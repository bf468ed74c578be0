//! Execution policy composition (component C4): binary allowlisting,
//! sandbox-wrapper composition, and per-job policy merging. Grounded on
//! `orchestrator/policy.py`.

use std::collections::HashSet;

use flow_core::{NetworkPolicy, Policy};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("ALLOWED_BINARIES is empty. Refusing to execute any external commands.")]
    EmptyAllowlist,
    #[error("binary '{0}' is not in allowlist (ALLOWED_BINARIES)")]
    BinaryNotAllowed(String),
    #[error("SANDBOX=1 but no sandbox wrapper is configured; refusing to run real commands without an isolation wrapper")]
    SandboxWrapperMissing,
    #[error("NETWORK_POLICY=deny requires sandbox + a configured wrapper when real CLI execution is enabled")]
    UnsafeRealCliNetworkDeny,
    #[error("refusing to run with an empty command")]
    EmptyCommand,
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// A fully-resolved execution policy: the base runner policy merged with any
/// per-job overrides.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub allowed_binaries: HashSet<String>,
    pub sandbox: bool,
    pub sandbox_wrapper: Option<String>,
    pub sandbox_wrapper_args: Vec<String>,
    pub network_policy: NetworkPolicy,
}

impl ExecutionPolicy {
    pub fn from_env(
        allowed_binaries: HashSet<String>,
        sandbox: bool,
        sandbox_wrapper: Option<String>,
        sandbox_wrapper_args: Vec<String>,
        network_policy: NetworkPolicy,
    ) -> Self {
        Self { allowed_binaries, sandbox, sandbox_wrapper, sandbox_wrapper_args, network_policy }
    }

    /// Merge this base policy with a job's requested overrides.
    ///
    /// - sandbox is AND-combined: a job can only ever narrow, never widen,
    ///   the runner's sandbox requirement.
    /// - network: `deny` wins if either side requests it.
    /// - allowed_binaries: intersected with the job's override when present;
    ///   the sandbox wrapper is always re-added when sandbox ends up on.
    pub fn for_job(&self, job_policy: &Policy) -> ExecutionPolicy {
        let sandbox = self.sandbox && job_policy.sandbox.unwrap_or(self.sandbox);

        let network_policy = match (self.network_policy, job_policy.network_policy) {
            (NetworkPolicy::Deny, _) | (_, Some(NetworkPolicy::Deny)) => NetworkPolicy::Deny,
            _ => NetworkPolicy::Allow,
        };

        let mut allowed_binaries = match &job_policy.allowed_binaries {
            Some(job_set) => {
                let job_set: HashSet<String> = job_set.iter().cloned().collect();
                self.allowed_binaries.intersection(&job_set).cloned().collect()
            }
            None => self.allowed_binaries.clone(),
        };
        if sandbox {
            if let Some(wrapper) = &self.sandbox_wrapper {
                allowed_binaries.insert(wrapper.clone());
            }
        }

        ExecutionPolicy {
            allowed_binaries,
            sandbox,
            sandbox_wrapper: self.sandbox_wrapper.clone(),
            sandbox_wrapper_args: self.sandbox_wrapper_args.clone(),
            network_policy,
        }
    }

    /// When real subprocess execution is enabled, a `deny` network policy
    /// must be backed by an actual isolation wrapper — otherwise "deny" is
    /// just a label nobody enforces.
    pub fn assert_real_cli_safe(&self, enable_real_cli: bool) -> Result<()> {
        if enable_real_cli
            && self.network_policy == NetworkPolicy::Deny
            && !(self.sandbox && self.sandbox_wrapper.is_some())
        {
            return Err(PolicyError::UnsafeRealCliNetworkDeny);
        }
        Ok(())
    }

    pub fn assert_binary_allowed(&self, binary: &str) -> Result<()> {
        if self.allowed_binaries.is_empty() {
            return Err(PolicyError::EmptyAllowlist);
        }
        if !self.allowed_binaries.contains(binary) {
            return Err(PolicyError::BinaryNotAllowed(binary.to_string()));
        }
        Ok(())
    }

    /// Check `argv[0]` against the allowlist, and if sandboxing is on, wrap
    /// the command with the sandbox wrapper (also allowlist-checked).
    pub fn wrap_command(&self, argv: Vec<String>) -> Result<Vec<String>> {
        let Some(bin) = argv.first() else { return Err(PolicyError::EmptyCommand) };
        self.assert_binary_allowed(bin)?;

        if self.sandbox {
            let wrapper = self.sandbox_wrapper.as_ref().ok_or(PolicyError::SandboxWrapperMissing)?;
            self.assert_binary_allowed(wrapper)?;
            let mut wrapped = Vec::with_capacity(1 + self.sandbox_wrapper_args.len() + argv.len());
            wrapped.push(wrapper.clone());
            wrapped.extend(self.sandbox_wrapper_args.iter().cloned());
            wrapped.extend(argv);
            return Ok(wrapped);
        }

        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binaries(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn base_policy() -> ExecutionPolicy {
        ExecutionPolicy::from_env(
            binaries(&["claude", "git"]),
            false,
            None,
            vec![],
            NetworkPolicy::Allow,
        )
    }

    #[test]
    fn network_deny_wins_either_side() {
        let base = ExecutionPolicy::from_env(binaries(&["git"]), false, None, vec![], NetworkPolicy::Allow);
        let mut job = Policy::default();
        job.network_policy = Some(NetworkPolicy::Deny);
        assert_eq!(base.for_job(&job).network_policy, NetworkPolicy::Deny);

        let base = ExecutionPolicy::from_env(binaries(&["git"]), false, None, vec![], NetworkPolicy::Deny);
        let mut job = Policy::default();
        job.network_policy = Some(NetworkPolicy::Allow);
        assert_eq!(base.for_job(&job).network_policy, NetworkPolicy::Deny);

        let base = ExecutionPolicy::from_env(binaries(&["git"]), false, None, vec![], NetworkPolicy::Allow);
        let mut job = Policy::default();
        job.network_policy = Some(NetworkPolicy::Allow);
        assert_eq!(base.for_job(&job).network_policy, NetworkPolicy::Allow);
    }

    #[test]
    fn sandbox_wrapper_always_preserved_when_sandbox_on() {
        let base = ExecutionPolicy::from_env(
            binaries(&["claude"]),
            true,
            Some("bwrap".to_string()),
            vec![],
            NetworkPolicy::Allow,
        );
        let mut job = Policy::default();
        job.allowed_binaries = Some(vec!["claude".to_string()]);
        let merged = base.for_job(&job);
        assert!(merged.allowed_binaries.contains("bwrap"));
    }

    #[test]
    fn allowed_binaries_intersect_job_override() {
        let base = base_policy();
        let mut job = Policy::default();
        job.allowed_binaries = Some(vec!["git".to_string(), "nonexistent".to_string()]);
        let merged = base.for_job(&job);
        assert_eq!(merged.allowed_binaries, binaries(&["git"]));
    }

    #[test]
    fn sandbox_is_and_combined() {
        let base = ExecutionPolicy::from_env(binaries(&["git"]), true, Some("bwrap".into()), vec![], NetworkPolicy::Allow);
        let mut job = Policy::default();
        job.sandbox = Some(false);
        assert!(!base.for_job(&job).sandbox);

        let base = ExecutionPolicy::from_env(binaries(&["git"]), false, None, vec![], NetworkPolicy::Allow);
        let mut job = Policy::default();
        job.sandbox = Some(true);
        assert!(!base.for_job(&job).sandbox);
    }

    #[test]
    fn wrap_command_rejects_unlisted_binary() {
        let policy = base_policy();
        let err = policy.wrap_command(vec!["rm".to_string()]).unwrap_err();
        assert_eq!(err, PolicyError::BinaryNotAllowed("rm".to_string()));
    }

    #[test]
    fn wrap_command_prepends_wrapper_when_sandboxed() {
        let policy = ExecutionPolicy::from_env(
            binaries(&["claude", "bwrap"]),
            true,
            Some("bwrap".to_string()),
            vec!["--ro-bind".to_string(), "/".to_string(), "/".to_string()],
            NetworkPolicy::Allow,
        );
        let wrapped = policy.wrap_command(vec!["claude".to_string(), "-p".to_string()]).unwrap();
        assert_eq!(
            wrapped,
            vec!["bwrap", "--ro-bind", "/", "/", "claude", "-p"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn sandbox_without_wrapper_is_refused() {
        let policy = ExecutionPolicy::from_env(binaries(&["claude"]), true, None, vec![], NetworkPolicy::Allow);
        let err = policy.wrap_command(vec!["claude".to_string()]).unwrap_err();
        assert_eq!(err, PolicyError::SandboxWrapperMissing);
    }

    #[test]
    fn real_cli_with_network_deny_requires_sandbox_and_wrapper() {
        let policy = ExecutionPolicy::from_env(binaries(&["claude"]), false, None, vec![], NetworkPolicy::Deny);
        assert_eq!(
            policy.assert_real_cli_safe(true).unwrap_err(),
            PolicyError::UnsafeRealCliNetworkDeny
        );

        let policy = ExecutionPolicy::from_env(
            binaries(&["claude", "bwrap"]),
            true,
            Some("bwrap".to_string()),
            vec![],
            NetworkPolicy::Deny,
        );
        assert!(policy.assert_real_cli_safe(true).is_ok());
    }

    #[test]
    fn empty_allowlist_refuses_everything() {
        let policy = ExecutionPolicy::from_env(HashSet::new(), false, None, vec![], NetworkPolicy::Allow);
        assert_eq!(
            policy.assert_binary_allowed("git").unwrap_err(),
            PolicyError::EmptyAllowlist
        );
    }
}
