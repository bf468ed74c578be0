//! The durable, filesystem-backed job queue (component C1).
//!
//! State is directory membership: a job file's parent directory IS its
//! state. The only synchronization primitive is an atomic rename between
//! directories on the same filesystem; there is no locking anywhere in this
//! module. See `spec.md` §4.1 for the exact contract this implements.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flow_core::{Id, Job, QueueEntry, QueueState};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("job '{0}' already exists in the queue")]
    DuplicateJob(String),
    #[error("enqueue target must be pending or awaiting_approval, got {0:?}")]
    InvalidEnqueueState(QueueState),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A job claimed out of `pending` and moved into `running`.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub job_id: Id,
    pub path: PathBuf,
    pub entry: QueueEntry,
}

/// The five queue-state directories under `QUEUE_ROOT`.
#[derive(Debug, Clone)]
pub struct FileQueue {
    root: PathBuf,
}

impl FileQueue {
    /// Open (creating if necessary) the queue rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for state in QueueState::ALL {
            fs::create_dir_all(root.join(state.dir_name()))?;
        }
        Ok(Self { root })
    }

    fn dir(&self, state: QueueState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    /// Enqueue a job. Target directory is `awaiting_approval` when the job's
    /// policy requests approval, `pending` otherwise.
    pub fn enqueue(&self, job: Job) -> Result<Id> {
        let state = if job.policy.requires_approval {
            QueueState::AwaitingApproval
        } else {
            QueueState::Pending
        };
        self.enqueue_into(job, state)
    }

    /// Enqueue a job directly into a chosen state. Only `pending` and
    /// `awaiting_approval` are legal targets.
    pub fn enqueue_into(&self, job: Job, state: QueueState) -> Result<Id> {
        if !matches!(state, QueueState::Pending | QueueState::AwaitingApproval) {
            return Err(QueueError::InvalidEnqueueState(state));
        }
        if self.find_exact(job.job_id.as_ref()).is_some() {
            return Err(QueueError::DuplicateJob(job.job_id.to_string()));
        }

        let job_id = job.job_id.clone();
        let entry = QueueEntry { job, enqueued_at: chrono::Utc::now(), claimed_at: None, attempt: 0 };
        let dir = self.dir(state);
        let final_path = dir.join(format!("{job_id}.json"));
        atomic_write_json(&dir, &final_path, &entry)?;
        Ok(job_id)
    }

    /// List `pending` ordered by mtime ascending and attempt to claim the
    /// first file that successfully renames into `running`. Races with other
    /// claimers resolve silently: a rename that fails with `NotFound` means
    /// another worker already took it.
    pub fn claim(&self) -> Result<Option<Claimed>> {
        let mut candidates = mtime_sorted_entries(&self.dir(QueueState::Pending))?;
        candidates.sort_by_key(|(_, mtime)| *mtime);

        let running = self.dir(QueueState::Running);
        for (path, _) in candidates {
            let Some(file_name) = path.file_name().map(|n| n.to_owned()) else { continue };
            let target = running.join(&file_name);
            match fs::rename(&path, &target) {
                Ok(()) => {
                    let mut entry = read_entry(&target)?;
                    entry.claimed_at = Some(chrono::Utc::now());
                    write_json_in_place(&target, &entry)?;
                    let job_id = entry.job.job_id.clone();
                    return Ok(Some(Claimed { job_id, path: target, entry }));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Re-read a claimed entry's current on-disk content.
    pub fn read_claimed(&self, claimed: &Claimed) -> Result<QueueEntry> {
        read_entry(&claimed.path)
    }

    /// Move a claimed job into `done`.
    pub fn ack(&self, claimed: &Claimed) -> Result<PathBuf> {
        Ok(move_no_overwrite(&claimed.path, &self.dir(QueueState::Done))?)
    }

    /// Move a claimed job into `failed`.
    pub fn fail(&self, claimed: &Claimed) -> Result<PathBuf> {
        Ok(move_no_overwrite(&claimed.path, &self.dir(QueueState::Failed))?)
    }

    /// Move a claimed job back into `pending` (e.g. for a retry from scratch).
    pub fn requeue(&self, claimed: &Claimed) -> Result<PathBuf> {
        Ok(move_no_overwrite(&claimed.path, &self.dir(QueueState::Pending))?)
    }

    /// Move a claimed job into `awaiting_approval`, parking it until a human
    /// calls `approve`.
    pub fn await_approval(&self, claimed: &Claimed) -> Result<PathBuf> {
        Ok(move_no_overwrite(&claimed.path, &self.dir(QueueState::AwaitingApproval))?)
    }

    /// Move a job from `awaiting_approval` back into `pending`, matching the
    /// job_id exactly (via file content, never a filename prefix). Returns
    /// `true` iff a matching file was found and moved.
    pub fn approve(&self, job_id: &str) -> Result<bool> {
        let Some(path) = self.find_exact_in(QueueState::AwaitingApproval, job_id)? else {
            return Ok(false);
        };
        move_no_overwrite(&path, &self.dir(QueueState::Pending))?;
        Ok(true)
    }

    /// Move a job stuck in `running` back into `pending`, matching the
    /// job_id exactly. Returns `true` iff a matching file was found.
    pub fn unlock(&self, job_id: &str) -> Result<bool> {
        let Some(path) = self.find_exact_in(QueueState::Running, job_id)? else {
            return Ok(false);
        };
        move_no_overwrite(&path, &self.dir(QueueState::Pending))?;
        Ok(true)
    }

    /// Move every `running` file whose mtime is at least `threshold` old
    /// back into `pending`. Returns the number reclaimed.
    pub fn reclaim_stale_running(&self, threshold: Duration) -> Result<usize> {
        let running = self.dir(QueueState::Running);
        let mut reclaimed = 0usize;
        for (path, mtime) in mtime_sorted_entries(&running)? {
            let age = SystemTime::now().duration_since(mtime).unwrap_or_default();
            if age < threshold {
                continue;
            }
            match move_no_overwrite(&path, &self.dir(QueueState::Pending)) {
                Ok(_) => reclaimed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reclaimed)
    }

    /// Which of the five directories currently holds this job_id, if any.
    pub fn queue_state(&self, job_id: &str) -> Result<Option<QueueState>> {
        for state in QueueState::ALL {
            if self.find_exact_in(state, job_id)?.is_some() {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    fn find_exact(&self, job_id: &str) -> Option<PathBuf> {
        for state in QueueState::ALL {
            if let Ok(Some(path)) = self.find_exact_in(state, job_id) {
                return Some(path);
            }
        }
        None
    }

    fn find_exact_in(&self, state: QueueState, job_id: &str) -> Result<Option<PathBuf>> {
        let dir = self.dir(state);
        let Ok(read_dir) = fs::read_dir(&dir) else { return Ok(None) };
        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(parsed) = read_entry(&path) {
                if parsed.job.job_id.as_ref() == job_id {
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }
}

fn mtime_sorted_entries(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>> {
    let mut out = Vec::new();
    let Ok(read_dir) = fs::read_dir(dir) else { return Ok(out) };
    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);
        out.push((path, mtime));
    }
    Ok(out)
}

fn read_entry(path: &Path) -> Result<QueueEntry> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json_in_place(path: &Path, entry: &QueueEntry) -> Result<()> {
    let dir = path.parent().expect("queue file always has a parent dir");
    atomic_write_json(dir, path, entry)
}

fn atomic_write_json(dir: &Path, final_path: &Path, entry: &QueueEntry) -> Result<()> {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let tmp = dir.join(format!(".{}.tmp", nanos));
    let body = serde_json::to_string_pretty(entry)? + "\n";
    fs::write(&tmp, body)?;
    fs::rename(&tmp, final_path)?;
    Ok(())
}

/// Move `src` into `target_dir`, never overwriting an existing file. On a
/// name collision the moved file gains a `.{monotonic_nanos}.json` suffix;
/// its content is untouched.
fn move_no_overwrite(src: &Path, target_dir: &Path) -> io::Result<PathBuf> {
    let file_name = src.file_name().expect("queue file always has a name").to_owned();
    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let target = target_dir.join(&file_name);
    if !target.exists() {
        fs::rename(src, &target)?;
        return Ok(target);
    }
    loop {
        let suffix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let alt = target_dir.join(format!("{stem}.{suffix}.json"));
        if !alt.exists() {
            fs::rename(src, &alt)?;
            return Ok(alt);
        }
    }
}

/// Read the raw JSON value of a queue entry without requiring it to parse as
/// a full `QueueEntry` (used by `flowctl doctor` to surface malformed files
/// without crashing).
pub fn read_raw(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::{JobSource, Policy, Step};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample_job(job_id: &str) -> Job {
        Job {
            job_id: Id::from_string(job_id),
            goal: "fix the bug".to_string(),
            source: JobSource::manual(),
            project_id: None,
            workdir: ".".to_string(),
            steps: vec![Step {
                step_id: "s1".to_string(),
                agent: "claude".to_string(),
                role: "implementer".to_string(),
                prompt: "do it".to_string(),
                timeout_sec: 600,
                max_retries: 0,
                retry_backoff_sec: 5,
                input_artifacts: vec![],
                apply_patches_from: vec![],
                allowed_tools: None,
                on_failure: "stop".to_string(),
            }],
            policy: Policy::default(),
            callback_url: None,
            context_window: vec![],
            context_strategy: None,
            handoff_strategy: flow_core::HandoffStrategy::Manual,
            tags: vec![],
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn enqueue_then_claim_round_trips() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        queue.enqueue(sample_job("job-1")).unwrap();

        assert!(dir.path().join("pending/job-1.json").exists());

        let claimed = queue.claim().unwrap().expect("should claim the job");
        assert_eq!(claimed.job_id.as_ref(), "job-1");
        assert!(dir.path().join("running/job-1.json").exists());
        assert!(!dir.path().join("pending/job-1.json").exists());
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        queue.enqueue(sample_job("job-1")).unwrap();
        let err = queue.enqueue(sample_job("job-1")).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJob(_)));
    }

    #[test]
    fn requires_approval_routes_to_awaiting_approval() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        let mut job = sample_job("job-1");
        job.policy.requires_approval = true;
        queue.enqueue(job).unwrap();

        assert!(dir.path().join("awaiting_approval/job-1.json").exists());
        assert_eq!(
            queue.queue_state("job-1").unwrap(),
            Some(QueueState::AwaitingApproval)
        );

        assert!(queue.approve("job-1").unwrap());
        assert!(dir.path().join("pending/job-1.json").exists());
    }

    #[test]
    fn claim_returns_none_when_empty() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        assert!(queue.claim().unwrap().is_none());
    }

    #[test]
    fn ack_moves_to_done_preserving_content() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        queue.enqueue(sample_job("job-1")).unwrap();
        let claimed = queue.claim().unwrap().unwrap();
        queue.ack(&claimed).unwrap();
        assert!(dir.path().join("done/job-1.json").exists());
        let entry = read_entry(&dir.path().join("done/job-1.json")).unwrap();
        assert_eq!(entry.job.goal, "fix the bug");
    }

    #[test]
    fn reclaim_stale_running_moves_aged_entries_back() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        queue.enqueue(sample_job("job-2")).unwrap();
        queue.claim().unwrap().unwrap();

        let running_file = dir.path().join("running/job-2.json");
        let old = std::time::SystemTime::now() - Duration::from_secs(3600);
        let old_ft = filetime::FileTime::from_system_time(old);
        filetime::set_file_mtime(&running_file, old_ft).unwrap();

        let reclaimed = queue.reclaim_stale_running(Duration::from_secs(60)).unwrap();
        assert_eq!(reclaimed, 1);
        assert!(dir.path().join("pending/job-2.json").exists());
        assert!(!running_file.exists());
    }

    #[test]
    fn approve_never_matches_a_prefix() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        let mut job = sample_job("job-1");
        job.policy.requires_approval = true;
        queue.enqueue(job).unwrap();
        let mut job2 = sample_job("job-12");
        job2.policy.requires_approval = true;
        queue.enqueue(job2).unwrap();

        assert!(queue.approve("job-1").unwrap());
        assert!(dir.path().join("pending/job-1.json").exists());
        assert!(dir.path().join("awaiting_approval/job-12.json").exists());
    }

    #[test]
    fn unlock_never_matches_a_prefix() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::open(dir.path()).unwrap();
        queue.enqueue(sample_job("job-1")).unwrap();
        queue.enqueue(sample_job("job-12")).unwrap();
        queue.claim().unwrap().unwrap();
        queue.claim().unwrap().unwrap();

        assert!(queue.unlock("job-1").unwrap());
        assert!(dir.path().join("pending/job-1.json").exists());
        assert!(dir.path().join("running/job-12.json").exists());
    }

    #[test]
    fn move_no_overwrite_preserves_both_files_on_collision() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let src = src_dir.path().join("job-1.json");
        fs::write(&src, "{\"a\":1}").unwrap();
        let existing = dst_dir.path().join("job-1.json");
        fs::write(&existing, "{\"a\":0}").unwrap();

        let moved = move_no_overwrite(&src, dst_dir.path()).unwrap();
        assert_ne!(moved, existing);
        assert_eq!(fs::read_to_string(existing).unwrap(), "{\"a\":0}");
        assert_eq!(fs::read_to_string(moved).unwrap(), "{\"a\":1}");
    }
}
