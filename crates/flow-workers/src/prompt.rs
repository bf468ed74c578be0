//! Artifact-bounded prompt assembly. Ported from
//! `workers/base.py::build_full_prompt`.

use std::path::{Component, Path, PathBuf};

pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Joins `rel_path` onto `base_dir` and collapses `..`/`.` components before
/// checking containment, so a lexical prefix match (`starts_with`) cannot be
/// fooled by an unresolved `../..` escape.
pub(crate) fn resolve_within(base_dir: &Path, rel_path: &str) -> Option<PathBuf> {
    let base_dir = normalize(base_dir);
    let candidate = normalize(&base_dir.join(rel_path));
    (candidate == base_dir || candidate.starts_with(&base_dir)).then_some(candidate)
}

/// Loads `<dir>/<agent>.md`, the static system prompt prepended ahead of a
/// step's own prompt text. Ported from `workers/base.py::load_prompt`
/// (minus the `lru_cache`: step volume here doesn't warrant it).
pub fn load_system_prompt(prompts_dir: Option<&Path>, agent: &str) -> Option<String> {
    let dir = prompts_dir?;
    let path = dir.join(format!("{agent}.md"));
    let text = std::fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Append the requested `artifacts` (paths relative to `job_dir`) to
/// `base_prompt` under an `## Input artifacts` section, applying the three
/// caps described in spec.md: max file count, max chars per file, max total
/// chars across all files.
pub fn build_full_prompt(
    base_prompt: &str,
    job_dir: &Path,
    artifacts: &[String],
    max_files: usize,
    max_chars_per_file: usize,
    max_total_chars: usize,
) -> String {
    if artifacts.is_empty() {
        return base_prompt.to_string();
    }

    let mut parts = vec![base_prompt.trim_end().to_string(), String::new(), "## Input artifacts".to_string()];
    let mut remaining_total = max_total_chars;
    let mut used_files = 0usize;
    let mut truncated = false;

    for rel_path in artifacts {
        if used_files >= max_files {
            truncated = true;
            break;
        }

        let header = format!("=== BEGIN ARTIFACT: {rel_path} ===");
        let footer = "=== END ARTIFACT ===".to_string();

        let Some(abs_path) = resolve_within(job_dir, rel_path) else {
            parts.extend([header, "[invalid_path]".to_string(), footer]);
            used_files += 1;
            continue;
        };

        let Ok(bytes) = std::fs::read(&abs_path) else {
            parts.extend([header, "[missing]".to_string(), footer]);
            used_files += 1;
            continue;
        };
        let mut text = String::from_utf8_lossy(&bytes).into_owned();

        let mut notes: Vec<&str> = Vec::new();
        if max_chars_per_file == 0 {
            text.clear();
            notes.push("[truncated:file_limit]");
        } else if text.chars().count() > max_chars_per_file {
            text = text.chars().take(max_chars_per_file).collect();
            notes.push("[truncated:file_limit]");
        }

        if remaining_total == 0 {
            parts.extend([header, "[truncated:total_limit]".to_string(), footer]);
            truncated = true;
            used_files += 1;
            continue;
        }

        if text.chars().count() > remaining_total {
            text = text.chars().take(remaining_total).collect();
            notes.push("[truncated:total_limit]");
            remaining_total = 0;
            truncated = true;
        } else {
            remaining_total -= text.chars().count();
        }

        if !notes.is_empty() {
            text.push('\n');
            text.push_str(&notes.join("\n"));
            truncated = true;
        }

        parts.extend([header, text, footer]);
        used_files += 1;
    }

    if truncated {
        parts.push("[artifacts_truncated_or_limited]".to_string());
    }

    parts.join("\n").trim_end().to_string() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn no_artifacts_returns_base_prompt_unchanged() {
        assert_eq!(build_full_prompt("do the thing", Path::new("/tmp/job"), &[], 10, 100, 1000), "do the thing");
    }

    #[test]
    fn missing_file_emits_marker_and_consumes_slot() {
        let dir = TempDir::new().unwrap();
        let out = build_full_prompt("x", dir.path(), &["nope.txt".to_string()], 10, 100, 1000);
        assert!(out.contains("[missing]"));
        assert!(out.contains("[artifacts_truncated_or_limited]"));
    }

    #[test]
    fn escaping_path_is_invalid() {
        let dir = TempDir::new().unwrap();
        let out = build_full_prompt("x", dir.path(), &["../escape.txt".to_string()], 10, 100, 1000);
        assert!(out.contains("[invalid_path]"));
    }

    #[test]
    fn present_file_is_embedded_verbatim_when_under_caps() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();
        let out = build_full_prompt("x", dir.path(), &["a.txt".to_string()], 10, 100, 1000);
        assert!(out.contains("hello world"));
        assert!(!out.contains("[artifacts_truncated_or_limited]"));
    }

    #[test]
    fn per_file_cap_truncates_and_flags() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "0123456789").unwrap();
        let out = build_full_prompt("x", dir.path(), &["a.txt".to_string()], 10, 4, 1000);
        assert!(out.contains("[truncated:file_limit]"));
        assert!(out.contains("[artifacts_truncated_or_limited]"));
    }

    #[test]
    fn max_files_cap_stops_silently_without_marker_block() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let out = build_full_prompt(
            "x",
            dir.path(),
            &["a.txt".to_string(), "b.txt".to_string()],
            1,
            100,
            1000,
        );
        assert!(out.contains("a.txt"));
        assert!(!out.contains("BEGIN ARTIFACT: b.txt"));
        assert!(out.contains("[artifacts_truncated_or_limited]"));
    }

    #[test]
    fn total_cap_truncates_across_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "01234").unwrap();
        std::fs::write(dir.path().join("b.txt"), "56789").unwrap();
        let out = build_full_prompt(
            "x",
            dir.path(),
            &["a.txt".to_string(), "b.txt".to_string()],
            10,
            100,
            7,
        );
        assert!(out.contains("[truncated:total_limit]"));
    }

    #[test]
    fn load_system_prompt_reads_trimmed_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("claude.md"), "  Be concise.\n\n").unwrap();
        assert_eq!(load_system_prompt(Some(dir.path()), "claude"), Some("Be concise.".to_string()));
    }

    #[test]
    fn load_system_prompt_is_none_when_missing_or_unset() {
        let dir = TempDir::new().unwrap();
        assert_eq!(load_system_prompt(Some(dir.path()), "nonexistent-agent"), None);
        assert_eq!(load_system_prompt(None, "claude"), None);
    }

    #[test]
    fn escaping_patch_path_with_double_parent_is_rejected_after_normalization() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_within(dir.path(), "../../etc/evil.diff"), None);
    }
}
