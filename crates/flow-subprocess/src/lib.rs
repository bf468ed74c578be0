//! Subprocess execution (component C5): env hygiene, process-group isolation,
//! dual hard/idle watchdogs, and output capping. Grounded on
//! `orchestrator/subprocess_utils.py`, with the tokio idiom carried over from
//! `loopd::runner`'s `claude` invocation.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("refusing to run with an empty command")]
    EmptyCommand,
    #[error(transparent)]
    Policy(#[from] flow_policy::PolicyError),
}

pub type Result<T> = std::result::Result<T, SubprocessError>;

/// Base env keys always forwarded (unless `clear_env`, which trims to just
/// `PATH`). Mirrors `_safe_base_env_keys_default` / `_safe_base_env_keys_clear`.
const SAFE_BASE_ENV_KEYS_DEFAULT: &[&str] = &["PATH", "HOME", "TMPDIR"];
const SAFE_BASE_ENV_KEYS_CLEAR: &[&str] = &["PATH"];

const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const WATCHDOG_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub killed_by_watchdog: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    pub cwd: &'a Path,
    pub env_overrides: &'a HashMap<String, String>,
    pub env_allowlist: &'a [String],
    pub clear_env: bool,
    pub timeout_sec: u64,
    pub idle_timeout_sec: Option<u64>,
    /// Caps each of stdout/stderr; excess bytes are dropped and the relevant
    /// `*_truncated` flag is set.
    pub max_output_bytes: usize,
}

/// Build the env a child process will see: base keys, then allowlisted keys
/// from the current process env, then allowlisted overrides. Non-allowlisted
/// overrides are dropped with a warning — this is the one place secrets can
/// leak into a child, so nothing bypasses the allowlist.
fn build_safe_env(opts: &RunOptions<'_>) -> HashMap<String, String> {
    let allowlist: HashSet<&str> = opts.env_allowlist.iter().map(String::as_str).collect();
    let base_keys = if opts.clear_env { SAFE_BASE_ENV_KEYS_CLEAR } else { SAFE_BASE_ENV_KEYS_DEFAULT };

    let mut safe_env = HashMap::new();
    for key in base_keys {
        if let Ok(val) = std::env::var(key) {
            safe_env.insert((*key).to_string(), val);
        }
    }
    for key in &allowlist {
        if let Ok(val) = std::env::var(key) {
            safe_env.insert((*key).to_string(), val);
        } else {
            warn!(env_var = %key, "env allowlist variable is missing in process env");
        }
    }
    for (key, val) in opts.env_overrides {
        if !allowlist.contains(key.as_str()) {
            warn!(env_var = %key, "ignoring non-allowlisted env override");
            continue;
        }
        safe_env.insert(key.clone(), val.clone());
    }
    safe_env
}

#[cfg(unix)]
fn detach_new_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid() is async-signal-safe and only called in the forked
    // child before exec, as required by `pre_exec`.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach_new_session(_cmd: &mut Command) {}

#[cfg(unix)]
async fn terminate_process_group(child: &mut Child) {
    let Some(pid) = child.id() else { return };
    let pgid = pid as libc::pid_t;

    // SAFETY: killpg targets the process group we created via setsid; a
    // failed signal (e.g. ESRCH because it already exited) is harmless.
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }

    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
        return;
    }

    // SAFETY: same process group, escalating to SIGKILL after the grace period.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

struct CappedSink {
    buf: String,
    truncated: bool,
    cap: usize,
}

impl CappedSink {
    fn new(cap: usize) -> Self {
        Self { buf: String::new(), truncated: false, cap }
    }

    fn push(&mut self, line: &str) {
        if self.buf.len() >= self.cap {
            self.truncated = true;
            return;
        }
        let remaining = self.cap - self.buf.len();
        if line.len() > remaining {
            // Slice on a char boundary: take the longest prefix of whole
            // chars that fits, rather than an arbitrary byte offset that
            // could land mid-UTF-8-sequence and panic.
            let fit = line
                .char_indices()
                .map(|(i, c)| i + c.len_utf8())
                .take_while(|&end| end <= remaining)
                .last()
                .unwrap_or(0);
            self.buf.push_str(&line[..fit]);
            self.truncated = true;
        } else {
            self.buf.push_str(line);
        }
    }
}

async fn pump_lines<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    sink: std::sync::Arc<Mutex<CappedSink>>,
    last_output: std::sync::Arc<Mutex<Instant>>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(mut line)) => {
                line.push('\n');
                sink.lock().await.push(&line);
                *last_output.lock().await = Instant::now();
            }
            _ => break,
        }
    }
}

/// Run `cmd` (already policy-checked / sandbox-wrapped by the caller) with
/// process-group isolation, a hard wall-clock timeout, and an optional idle
/// watchdog. `cmd[0]` is never interpreted by a shell.
pub async fn run_command(cmd: &[String], opts: RunOptions<'_>) -> Result<CommandOutput> {
    let Some(program) = cmd.first() else { return Err(SubprocessError::EmptyCommand) };

    let start = Instant::now();
    let safe_env = build_safe_env(&opts);

    let mut command = Command::new(program);
    command
        .args(&cmd[1..])
        .current_dir(opts.cwd)
        .env_clear()
        .envs(&safe_env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    detach_new_session(&mut command);

    let mut child = command.spawn()?;
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let stdout_sink = std::sync::Arc::new(Mutex::new(CappedSink::new(opts.max_output_bytes)));
    let stderr_sink = std::sync::Arc::new(Mutex::new(CappedSink::new(opts.max_output_bytes)));
    let last_output = std::sync::Arc::new(Mutex::new(Instant::now()));

    let t_out = tokio::spawn(pump_lines(stdout, stdout_sink.clone(), last_output.clone()));
    let t_err = tokio::spawn(pump_lines(stderr, stderr_sink.clone(), last_output.clone()));

    let mut killed_by_watchdog = false;

    if let Some(idle_sec) = opts.idle_timeout_sec {
        let idle = Duration::from_secs(idle_sec);
        let hard_timeout = Duration::from_secs(opts.timeout_sec);
        let deadline = Instant::now() + hard_timeout;
        loop {
            if let Ok(status) = tokio::time::timeout(WATCHDOG_POLL, child.wait()).await {
                let _ = status?;
                break;
            }
            if Instant::now() >= deadline {
                terminate_process_group(&mut child).await;
                break;
            }
            if last_output.lock().await.elapsed() > idle {
                killed_by_watchdog = true;
                terminate_process_group(&mut child).await;
                break;
            }
        }
    } else {
        let hard_timeout = Duration::from_secs(opts.timeout_sec);
        if tokio::time::timeout(hard_timeout, child.wait()).await.is_err() {
            terminate_process_group(&mut child).await;
        }
    }

    let _ = t_out.await;
    let _ = t_err.await;

    let exit_code = child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1);
    let duration_ms = start.elapsed().as_millis() as u64;

    let stdout_sink = stdout_sink.lock().await;
    let stderr_sink = stderr_sink.lock().await;

    let mut stdout = stdout_sink.buf.clone();
    if stdout_sink.truncated {
        stdout.push_str(&format!("\n[truncated: output exceeded {} chars]", opts.max_output_bytes));
    }
    let mut stderr = stderr_sink.buf.clone();
    if stderr_sink.truncated {
        stderr.push_str(&format!("\n[truncated: output exceeded {} chars]", opts.max_output_bytes));
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        duration_ms,
        killed_by_watchdog,
        stdout_truncated: stdout_sink.truncated,
        stderr_truncated: stderr_sink.truncated,
    })
}
