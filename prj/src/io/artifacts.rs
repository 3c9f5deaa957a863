//! Artifact storage for `.prj/artifacts/<project>/<run-id>-<action>/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::core::context::{RunStatus, StepResult};
use crate::core::types::Strategy;

/// Persists step output and run metadata.
pub trait ArtifactStore: Send + Sync {
    /// Create (or reuse) the artifact directory for one run.
    fn create_run_dir(&self, project: &str, run_id: &str, action: &str) -> Result<PathBuf>;
    /// Write `content` to `dir[/subdir]/filename`, returning the written path.
    fn store_content(
        &self,
        dir: &Path,
        content: &str,
        filename: &str,
        subdir: Option<&str>,
    ) -> Result<PathBuf>;
}

/// [`ArtifactStore`] on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    base_dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Delete run directories last modified at or before `cutoff`, then any
    /// project directory left empty. Returns the removed run directories.
    #[instrument(skip_all, fields(base = %self.base_dir.display()))]
    pub fn prune_before(&self, cutoff: SystemTime) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        if !self.base_dir.is_dir() {
            return Ok(removed);
        }
        for project in subdirs(&self.base_dir)? {
            for run in subdirs(&project)? {
                let modified = fs::metadata(&run)
                    .and_then(|m| m.modified())
                    .with_context(|| format!("stat {}", run.display()))?;
                if modified <= cutoff {
                    fs::remove_dir_all(&run)
                        .with_context(|| format!("remove {}", run.display()))?;
                    debug!(dir = %run.display(), "pruned run artifacts");
                    removed.push(run);
                }
            }
            if subdirs(&project)?.is_empty() && fs::remove_dir(&project).is_ok() {
                debug!(dir = %project.display(), "removed empty project dir");
            }
        }
        info!(removed = removed.len(), "artifact prune finished");
        Ok(removed)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

impl ArtifactStore for FsArtifactStore {
    fn create_run_dir(&self, project: &str, run_id: &str, action: &str) -> Result<PathBuf> {
        let dir = self
            .base_dir
            .join(safe_component(project)?)
            .join(safe_component(&format!("{run_id}-{action}"))?);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create artifact dir {}", dir.display()))?;
        Ok(dir)
    }

    fn store_content(
        &self,
        dir: &Path,
        content: &str,
        filename: &str,
        subdir: Option<&str>,
    ) -> Result<PathBuf> {
        let target_dir = match subdir {
            Some(sub) => dir.join(safe_component(sub)?),
            None => dir.to_path_buf(),
        };
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("create artifact dir {}", target_dir.display()))?;
        let path = target_dir.join(safe_component(filename)?);
        write_text(&path, content)?;
        Ok(path)
    }
}

/// Summary written as `metadata.json` when a run ends.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata<'a> {
    pub run_id: &'a str,
    pub action: &'a str,
    pub strategy: Strategy,
    pub status: RunStatus,
    pub success: bool,
    pub error: Option<&'a str>,
    pub failed_step: Option<&'a str>,
    pub workspace: Option<&'a Path>,
    pub session: Option<&'a str>,
    pub warnings: &'a [String],
    pub history: &'a [StepResult],
}

impl RunMetadata<'_> {
    pub fn to_json(&self) -> Result<String> {
        let mut buf = serde_json::to_string_pretty(self).context("serialize run metadata")?;
        buf.push('\n');
        Ok(buf)
    }
}

/// File name for one step's captured output: `step-<n>-<name>.log`.
pub fn step_log_name(index: usize, step_name: &str) -> String {
    let name: String = step_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("step-{index:02}-{name}.log")
}

/// Reject anything that would not stay a single path component.
fn safe_component(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(anyhow!("invalid artifact path component {raw:?}"));
    }
    Ok(trimmed.replace(['/', '\\'], "_"))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_dir_layout_is_project_then_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(temp.path());
        let dir = store
            .create_run_dir("app", "app-20250101T000000Z-abcd1234", "build")
            .expect("create");
        assert!(dir.is_dir());
        assert!(dir.ends_with(Path::new("app/app-20250101T000000Z-abcd1234-build")));
    }

    #[test]
    fn prune_removes_only_runs_at_or_before_cutoff() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(temp.path());
        let old = store.create_run_dir("app", "run-1", "build").expect("create");
        let cutoff = SystemTime::now();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let fresh = store.create_run_dir("web", "run-2", "test").expect("create");
        fs::write(fresh.join("metadata.json"), "{}").expect("write");

        let removed = store.prune_before(cutoff).expect("prune");

        assert_eq!(removed, vec![old]);
        assert!(!temp.path().join("app").exists());
        assert!(fresh.join("metadata.json").is_file());
    }

    #[test]
    fn prune_without_artifacts_is_a_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(temp.path().join("missing"));
        assert!(store.prune_before(SystemTime::now()).expect("prune").is_empty());
    }

    #[test]
    fn store_content_writes_into_subdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(temp.path());
        let path = store
            .store_content(temp.path(), "hello", "out.txt", Some("logs"))
            .expect("store");
        assert_eq!(path, temp.path().join("logs").join("out.txt"));
        assert_eq!(fs::read_to_string(path).expect("read"), "hello");
    }

    #[test]
    fn filenames_cannot_escape_the_run_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsArtifactStore::new(temp.path());
        let path = store
            .store_content(temp.path(), "x", "../escape.txt", None)
            .expect("store");
        assert_eq!(path.parent(), Some(temp.path()));
        assert!(store.store_content(temp.path(), "x", "..", None).is_err());
    }

    #[test]
    fn step_log_names_are_ordered_and_safe() {
        assert_eq!(step_log_name(1, "build app"), "step-01-build_app.log");
        assert_eq!(step_log_name(12, "lint"), "step-12-lint.log");
    }
}
