//! Filesystem-backed artifact store with fixed paths.
//!
//! Layout under `ARTIFACTS_ROOT`:
//! ```text
//! <job_id>/
//!   job.json
//!   state.json
//!   context.json            (optional)
//!   result.json
//!   report.md
//!   patch.diff
//!   logs.txt
//!   steps/<step_id>/
//!     result.json
//!     report.md
//!     patch.diff
//!     logs.txt
//!     raw_stdout.txt        (optional)
//!     raw_stderr.txt        (optional)
//! ```
//!
//! Every write goes through a per-directory temp file followed by an atomic
//! rename. There is no locking: the runner is single-writer by construction
//! because only one process owns a given job's `running` queue entry at a
//! time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flow_core::{JobResult, StepResult};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid job_id: {0}")]
    InvalidJobId(String),
    #[error("invalid step_id: {0}")]
    InvalidStepId(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn is_safe_component(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && !id.contains('\\') && id != "." && id != ".."
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory for a job. Rejects any `job_id` that could escape the
    /// artifacts root (`..`, `/`, `\`).
    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        if !is_safe_component(job_id) {
            return Err(StoreError::InvalidJobId(job_id.to_string()));
        }
        Ok(self.root.join(job_id))
    }

    /// The directory for a step within a job.
    pub fn step_dir(&self, job_id: &str, step_id: &str) -> Result<PathBuf> {
        if !is_safe_component(step_id) {
            return Err(StoreError::InvalidStepId(step_id.to_string()));
        }
        Ok(self.job_dir(job_id)?.join("steps").join(step_id))
    }

    pub fn ensure_job_layout(&self, job_id: &str) -> Result<()> {
        fs::create_dir_all(self.job_dir(job_id)?.join("steps"))?;
        Ok(())
    }

    pub fn ensure_step_layout(&self, job_id: &str, step_id: &str) -> Result<()> {
        fs::create_dir_all(self.step_dir(job_id, step_id)?)?;
        Ok(())
    }

    pub fn write_job_spec<T: Serialize>(&self, job_id: &str, job: &T) -> Result<()> {
        self.write_json(&self.job_dir(job_id)?.join("job.json"), job)
    }

    /// `state` is deliberately loosely-typed (any serializable value) since
    /// the runner's operational state shape evolves independently of the
    /// artifact store.
    pub fn write_state<T: Serialize>(&self, job_id: &str, state: &T) -> Result<()> {
        self.write_json(&self.job_dir(job_id)?.join("state.json"), state)
    }

    pub fn write_context<T: Serialize>(&self, job_id: &str, context: &T) -> Result<()> {
        self.write_json(&self.job_dir(job_id)?.join("context.json"), context)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_job_artifacts(
        &self,
        job_id: &str,
        report_md: &str,
        patch_diff: &str,
        logs_txt: &str,
        result: &JobResult,
    ) -> Result<()> {
        let dir = self.job_dir(job_id)?;
        self.write_text(&dir.join("report.md"), report_md)?;
        self.write_text(&dir.join("patch.diff"), patch_diff)?;
        self.write_text(&dir.join("logs.txt"), logs_txt)?;
        self.write_json(&dir.join("result.json"), result)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_step_artifacts(
        &self,
        job_id: &str,
        step_id: &str,
        report_md: &str,
        patch_diff: &str,
        logs_txt: &str,
        result: &StepResult,
        raw_stdout: Option<&str>,
        raw_stderr: Option<&str>,
    ) -> Result<()> {
        let dir = self.step_dir(job_id, step_id)?;
        self.write_text(&dir.join("report.md"), report_md)?;
        self.write_text(&dir.join("patch.diff"), patch_diff)?;
        self.write_text(&dir.join("logs.txt"), logs_txt)?;
        self.write_json(&dir.join("result.json"), result)?;
        if let Some(stdout) = raw_stdout {
            self.write_text(&dir.join("raw_stdout.txt"), stdout)?;
        }
        if let Some(stderr) = raw_stderr {
            self.write_text(&dir.join("raw_stderr.txt"), stderr)?;
        }
        Ok(())
    }

    /// Path relative to this job's directory, for recording in artifact
    /// lists (`StepResult::artifacts`, `JobResult::artifacts`).
    pub fn relpath(&self, path: &Path, job_id: &str) -> Result<String> {
        let job_dir = self.job_dir(job_id)?;
        Ok(path
            .strip_prefix(&job_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned())
    }

    fn write_text(&self, path: &Path, text: &str) -> Result<()> {
        self.atomic_write(path, text.as_bytes())
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let body = serde_json::to_string_pretty(value)? + "\n";
        self.atomic_write(path, body.as_bytes())
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path.parent().expect("artifact path always has a parent dir");
        fs::create_dir_all(dir)?;
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let tmp = dir.join(format!(".tmp.{nanos}"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flow_core::{Id, JobStatus, Metrics, SecretsCheck, StepStatus};
    use tempfile::TempDir;

    fn sample_step_result() -> StepResult {
        StepResult {
            job_id: Id::from_string("job-1"),
            step_id: "s1".to_string(),
            agent: "claude".to_string(),
            role: "implementer".to_string(),
            status: StepStatus::Success,
            attempts: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            summary: "ok".to_string(),
            change_status: None,
            artifacts: vec![],
            secrets_check: Some(SecretsCheck::Passed),
            metrics: Metrics { duration_ms: 10, cost_usd: None, tokens_in: None, tokens_out: None },
            error: None,
        }
    }

    #[test]
    fn rejects_path_traversal_job_id() {
        let store = ArtifactStore::new("/tmp/artifacts");
        assert!(store.job_dir("../escape").is_err());
        assert!(store.job_dir("a/b").is_err());
        assert!(store.job_dir("job-1").is_ok());
    }

    #[test]
    fn ensure_layout_creates_steps_dir() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure_job_layout("job-1").unwrap();
        assert!(dir.path().join("job-1/steps").is_dir());
    }

    #[test]
    fn write_step_artifacts_writes_all_fixed_files() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure_step_layout("job-1", "s1").unwrap();
        store
            .write_step_artifacts(
                "job-1",
                "s1",
                "# report",
                "diff --git a/x b/x",
                "log line",
                &sample_step_result(),
                Some("stdout"),
                None,
            )
            .unwrap();

        let step_dir = dir.path().join("job-1/steps/s1");
        assert_eq!(fs::read_to_string(step_dir.join("report.md")).unwrap(), "# report");
        assert_eq!(fs::read_to_string(step_dir.join("raw_stdout.txt")).unwrap(), "stdout");
        assert!(!step_dir.join("raw_stderr.txt").exists());
        let result: StepResult =
            serde_json::from_str(&fs::read_to_string(step_dir.join("result.json")).unwrap()).unwrap();
        assert_eq!(result.step_id, "s1");
    }

    #[test]
    fn relpath_strips_job_dir_prefix() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = store.job_dir("job-1").unwrap().join("steps/s1/report.md");
        assert_eq!(store.relpath(&path, "job-1").unwrap(), "steps/s1/report.md");
    }

    #[test]
    fn write_job_artifacts_overwrites_atomically() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure_job_layout("job-1").unwrap();
        let result = JobResult {
            job_id: Id::from_string("job-1"),
            status: JobStatus::Success,
            steps: vec![sample_step_result()],
            artifacts: vec![],
            secrets_check: SecretsCheck::Passed,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        store.write_job_artifacts("job-1", "report v1", "", "", &result).unwrap();
        store.write_job_artifacts("job-1", "report v2", "", "", &result).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("job-1/report.md")).unwrap(),
            "report v2"
        );
    }
}
