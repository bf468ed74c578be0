//! Per-job workspace isolation. Grounded on `orchestrator/workspace.py`:
//! path-escape and symlink-component checks, secure directory creation, and
//! git-clone-local-or-copy source resolution.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown project_id '{0}'")]
    UnknownProjectAlias(String),
    #[error("configured project path does not exist: {0}")]
    ProjectPathMissing(PathBuf),
    #[error("invalid job_id for workspace path: {0}")]
    InvalidJobId(String),
    #[error("path escapes workspaces root: {0}")]
    EscapesRoot(PathBuf),
    #[error("refusing symlink path component: {0}")]
    SymlinkComponent(PathBuf),
    #[error("source workdir does not exist: {0}")]
    SourceMissing(PathBuf),
    #[error("workspace already exists and is not empty: {0}")]
    NotEmpty(PathBuf),
    #[error("refusing source with symlink entry: {0}")]
    SourceHasSymlink(PathBuf),
    #[error("failed to clone git source: {0}")]
    GitCloneFailed(String),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
    pub workdir: PathBuf,
}

fn is_within(base: &Path, target: &Path) -> bool {
    target == base || target.ancestors().any(|a| a == base)
}

/// Walk from `base` down to `target`, rejecting any intermediate component
/// that is itself a symlink. `target` need not exist yet.
fn assert_no_symlink_components(base: &Path, target: &Path) -> Result<()> {
    let relative = target
        .strip_prefix(base)
        .map_err(|_| WorkspaceError::EscapesRoot(target.to_path_buf()))?;

    let mut cursor = base.to_path_buf();
    for part in relative.components() {
        cursor.push(part);
        if cursor.exists() && fs::symlink_metadata(&cursor)?.file_type().is_symlink() {
            return Err(WorkspaceError::SymlinkComponent(cursor));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn mkdir_secure(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let old_umask = unsafe { libc::umask(0o027) };
    let result = fs::create_dir_all(path);
    unsafe { libc::umask(old_umask) };
    result?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn mkdir_secure(path: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(path)
}

fn is_git_repo(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Resolves project aliases to source paths and prepares an isolated,
/// symlink-free workspace for a job.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    workspaces_root: PathBuf,
    project_aliases: HashMap<String, PathBuf>,
}

impl WorkspaceManager {
    pub fn new(
        workspaces_root: impl Into<PathBuf>,
        project_aliases: HashMap<String, PathBuf>,
    ) -> Result<Self> {
        let workspaces_root = workspaces_root.into();
        mkdir_secure(&workspaces_root, 0o750)?;
        let workspaces_root = workspaces_root.canonicalize()?;
        Ok(Self { workspaces_root, project_aliases })
    }

    pub fn resolve_project_alias(&self, project_id: &str) -> Result<PathBuf> {
        let path = self
            .project_aliases
            .get(project_id)
            .ok_or_else(|| WorkspaceError::UnknownProjectAlias(project_id.to_string()))?;
        let resolved = path
            .canonicalize()
            .map_err(|_| WorkspaceError::ProjectPathMissing(path.clone()))?;
        if !resolved.is_dir() {
            return Err(WorkspaceError::ProjectPathMissing(path.clone()));
        }
        Ok(resolved)
    }

    /// Prepare `<workspaces_root>/<job_id>/work` as the job's working
    /// directory, importing `source_hint` (a directory) into it if given.
    pub fn prepare_workspace(&self, job_id: &str, source_hint: Option<&Path>) -> Result<WorkspaceLayout> {
        if job_id.is_empty() || job_id.contains("..") || job_id.contains('/') || job_id.contains('\\') {
            return Err(WorkspaceError::InvalidJobId(job_id.to_string()));
        }

        let root = self.workspaces_root.join(job_id);
        let workdir = root.join("work");

        self.check_no_symlink_escape(&root)?;
        mkdir_secure(&root, 0o750)?;
        self.check_no_symlink_escape(&workdir)?;

        match source_hint {
            None => mkdir_secure(&workdir, 0o750)?,
            Some(hint) => {
                let src = hint
                    .canonicalize()
                    .map_err(|_| WorkspaceError::SourceMissing(hint.to_path_buf()))?;
                if !src.is_dir() {
                    return Err(WorkspaceError::SourceMissing(hint.to_path_buf()));
                }
                if workdir.exists() {
                    if !workdir.is_dir() || workdir.read_dir()?.next().is_some() {
                        return Err(WorkspaceError::NotEmpty(workdir));
                    }
                } else {
                    self.copy_source(&src, &workdir)?;
                }
            }
        }

        let final_workdir = workdir.canonicalize()?;
        if !is_within(&self.workspaces_root, &final_workdir) {
            return Err(WorkspaceError::EscapesRoot(final_workdir));
        }

        Ok(WorkspaceLayout { root: root.canonicalize()?, workdir: final_workdir })
    }

    fn check_no_symlink_escape(&self, target: &Path) -> Result<()> {
        assert_no_symlink_components(&self.workspaces_root, target)?;
        if target.exists() && fs::symlink_metadata(target)?.file_type().is_symlink() {
            return Err(WorkspaceError::SymlinkComponent(target.to_path_buf()));
        }
        if let Some(parent) = target.parent() {
            if parent.exists() && fs::symlink_metadata(parent)?.file_type().is_symlink() {
                return Err(WorkspaceError::SymlinkComponent(parent.to_path_buf()));
            }
        }
        Ok(())
    }

    fn copy_source(&self, src: &Path, workdir: &Path) -> Result<()> {
        if is_git_repo(src) {
            let output = Command::new("git")
                .args(["clone", "--local", "--quiet", &src.to_string_lossy(), &workdir.to_string_lossy()])
                .output()?;
            if output.status.success() {
                return Ok(());
            }
            return Err(WorkspaceError::GitCloneFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        assert_no_symlinks_in_tree(src)?;
        copy_dir_recursive(src, workdir)
    }
}

fn assert_no_symlinks_in_tree(root: &Path) -> Result<()> {
    for entry in walk_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_symlink() {
            return Err(WorkspaceError::SourceHasSymlink(entry.path()));
        }
    }
    Ok(())
}

fn walk_dir(root: &Path) -> io::Result<Vec<io::Result<fs::DirEntry>>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_symlink = entry.file_type()?.is_symlink();
            if path.is_dir() && !is_symlink {
                stack.push(path.clone());
            }
            out.push(Ok(entry));
        }
    }
    Ok(out)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn prepare_workspace_creates_empty_workdir_without_source() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path(), HashMap::new()).unwrap();
        let layout = manager.prepare_workspace("job-1", None).unwrap();
        assert!(layout.workdir.is_dir());
        assert!(layout.workdir.ends_with("work"));
    }

    #[test]
    fn prepare_workspace_rejects_traversal_job_id() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path(), HashMap::new()).unwrap();
        assert!(manager.prepare_workspace("../escape", None).is_err());
        assert!(manager.prepare_workspace("a/b", None).is_err());
    }

    #[test]
    fn prepare_workspace_copies_plain_directory_source() {
        let root = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("file.txt"), "hello").unwrap();
        fs::create_dir(source.path().join("sub")).unwrap();
        fs::write(source.path().join("sub/nested.txt"), "world").unwrap();

        let manager = WorkspaceManager::new(root.path(), HashMap::new()).unwrap();
        let layout = manager.prepare_workspace("job-1", Some(source.path())).unwrap();

        assert_eq!(fs::read_to_string(layout.workdir.join("file.txt")).unwrap(), "hello");
        assert_eq!(fs::read_to_string(layout.workdir.join("sub/nested.txt")).unwrap(), "world");
    }

    #[test]
    fn prepare_workspace_rejects_nonempty_existing_workdir() {
        let root = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("file.txt"), "hello").unwrap();

        let manager = WorkspaceManager::new(root.path(), HashMap::new()).unwrap();
        manager.prepare_workspace("job-1", Some(source.path())).unwrap();
        let err = manager.prepare_workspace("job-1", Some(source.path())).unwrap_err();
        assert!(matches!(err, WorkspaceError::NotEmpty(_)));
    }

    #[test]
    fn prepare_workspace_rejects_source_with_symlink() {
        let root = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("real.txt"), "hello").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(
                source.path().join("real.txt"),
                source.path().join("link.txt"),
            )
            .unwrap();

            let manager = WorkspaceManager::new(root.path(), HashMap::new()).unwrap();
            let err = manager.prepare_workspace("job-1", Some(source.path())).unwrap_err();
            assert!(matches!(err, WorkspaceError::SourceHasSymlink(_)));
        }
    }

    #[test]
    fn resolve_project_alias_rejects_unknown_id() {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path(), HashMap::new()).unwrap();
        assert!(matches!(
            manager.resolve_project_alias("nope"),
            Err(WorkspaceError::UnknownProjectAlias(_))
        ));
    }
}
