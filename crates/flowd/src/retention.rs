//! Periodic artifact/workspace garbage collection. Grounded on
//! `orchestrator/retention.py`.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::warn;

#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionStats {
    pub removed_artifacts: usize,
    pub removed_workspaces: usize,
}

fn is_within(base: &Path, target: &Path) -> bool {
    target == base || target.ancestors().any(|a| a == base)
}

/// job_ids currently sitting in `pending` or `running` — never eligible for
/// collection regardless of age.
pub fn active_job_ids(queue_root: &Path) -> HashSet<String> {
    let mut out = HashSet::new();
    for state in ["pending", "running"] {
        let dir = queue_root.join(state);
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    out.insert(stem.split('.').next().unwrap_or(stem).to_string());
                }
            }
        }
    }
    out
}

fn cleanup_root(root: &Path, ttl: Duration, protected: &HashSet<String>) -> usize {
    if ttl.is_zero() || !root.exists() {
        return 0;
    }

    let Ok(root_resolved) = root.canonicalize() else { return 0 };
    let Ok(entries) = std::fs::read_dir(root) else { return 0 };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else { continue };
        if !metadata.is_dir() || metadata.file_type().is_symlink() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if protected.contains(name) {
            continue;
        }
        let Ok(resolved) = path.canonicalize() else { continue };
        if !is_within(&root_resolved, &resolved) {
            continue;
        }
        let Ok(modified) = metadata.modified() else { continue };
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age < ttl {
            continue;
        }
        if let Err(e) = std::fs::remove_dir_all(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove stale directory during retention GC");
            continue;
        }
        removed += 1;
    }
    removed
}

pub fn run_retention(
    queue_root: &Path,
    artifacts_root: &Path,
    workspaces_root: &Path,
    artifacts_ttl: Duration,
    workspaces_ttl: Duration,
) -> RetentionStats {
    let protected = active_job_ids(queue_root);
    RetentionStats {
        removed_artifacts: cleanup_root(artifacts_root, artifacts_ttl, &protected),
        removed_workspaces: cleanup_root(workspaces_root, workspaces_ttl, &protected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn leaves_protected_job_dirs_alone() {
        let queue = TempDir::new().unwrap();
        std::fs::create_dir_all(queue.path().join("pending")).unwrap();
        std::fs::create_dir_all(queue.path().join("running")).unwrap();
        std::fs::write(queue.path().join("pending/job-1.json"), "{}").unwrap();

        let artifacts = TempDir::new().unwrap();
        std::fs::create_dir(artifacts.path().join("job-1")).unwrap();
        std::fs::create_dir(artifacts.path().join("job-2")).unwrap();

        let old = SystemTime::now() - Duration::from_secs(1000);
        filetime::set_file_mtime(
            artifacts.path().join("job-1"),
            filetime::FileTime::from_system_time(old),
        )
        .unwrap();
        filetime::set_file_mtime(
            artifacts.path().join("job-2"),
            filetime::FileTime::from_system_time(old),
        )
        .unwrap();

        let workspaces = TempDir::new().unwrap();
        let stats = run_retention(
            queue.path(),
            artifacts.path(),
            workspaces.path(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        assert_eq!(stats.removed_artifacts, 1);
        assert!(artifacts.path().join("job-1").exists());
        assert!(!artifacts.path().join("job-2").exists());
    }

    #[test]
    fn zero_ttl_disables_collection() {
        let queue = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();
        std::fs::create_dir(artifacts.path().join("job-1")).unwrap();
        let workspaces = TempDir::new().unwrap();

        let stats = run_retention(
            queue.path(),
            artifacts.path(),
            workspaces.path(),
            Duration::ZERO,
            Duration::ZERO,
        );
        assert_eq!(stats.removed_artifacts, 0);
        assert!(artifacts.path().join("job-1").exists());
    }
}
