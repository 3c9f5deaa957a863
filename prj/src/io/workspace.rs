//! Workspace manager: isolated git worktrees for a run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::io::git::{Git, WorktreeEntry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkspaceError {
    #[error("branch '{0}' already exists")]
    BranchExists(String),
    #[error("worktree path {} already exists", .0.display())]
    PathExists(PathBuf),
    #[error("not a git repository: {}", .0.display())]
    NotARepository(PathBuf),
    #[error("worktree {} has uncommitted changes", .0.display())]
    DirtyTree(PathBuf),
    #[error("base branch '{0}' does not exist")]
    MissingBase(String),
    #[error("git command failed: {0}")]
    Command(String),
}

/// Creates and removes isolated working trees.
pub trait WorkspaceManager: Send + Sync {
    /// Create a new branch from `base_branch` checked out in a fresh worktree.
    fn create(&self, branch: &str, base_branch: &str) -> Result<PathBuf, WorkspaceError>;
    /// Remove a worktree. `Ok(false)` means there was nothing to remove.
    fn remove(&self, path: &Path, force: bool) -> Result<bool, WorkspaceError>;
    fn list(&self) -> Result<Vec<WorktreeEntry>, WorkspaceError>;
}

/// [`WorkspaceManager`] backed by `git worktree`.
#[derive(Debug, Clone)]
pub struct GitWorkspaceManager {
    project_root: PathBuf,
    base_dir: PathBuf,
    timeout: Duration,
}

impl GitWorkspaceManager {
    /// Worktrees go under `base_dir`, defaulting to `<project-parent>/worktrees`.
    pub fn new(project_root: impl Into<PathBuf>, base_dir: Option<PathBuf>, timeout: Duration) -> Self {
        let project_root = project_root.into();
        let base_dir = base_dir.unwrap_or_else(|| default_base_dir(&project_root));
        Self {
            project_root,
            base_dir,
            timeout,
        }
    }

    /// Path a worktree for `branch` would be created at.
    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        let project = self
            .project_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        self.base_dir
            .join(format!("{project}-{}", branch.replace('/', "-")))
    }

    fn git(&self) -> Git {
        Git::new(&self.project_root, self.timeout)
    }
}

fn default_base_dir(project_root: &Path) -> PathBuf {
    project_root
        .parent()
        .map(|p| p.join("worktrees"))
        .unwrap_or_else(|| project_root.join(".prj").join("worktrees"))
}

impl WorkspaceManager for GitWorkspaceManager {
    #[instrument(skip_all, fields(branch, base_branch))]
    fn create(&self, branch: &str, base_branch: &str) -> Result<PathBuf, WorkspaceError> {
        let git = self.git();
        if !git.is_repository() {
            return Err(WorkspaceError::NotARepository(self.project_root.clone()));
        }
        if git.branch_exists(branch).map_err(command_error)? {
            return Err(WorkspaceError::BranchExists(branch.to_string()));
        }
        if !git.rev_exists(base_branch).map_err(command_error)? {
            return Err(WorkspaceError::MissingBase(base_branch.to_string()));
        }
        let path = self.worktree_path(branch);
        if path.exists() {
            return Err(WorkspaceError::PathExists(path));
        }
        std::fs::create_dir_all(&self.base_dir).map_err(|e| {
            WorkspaceError::Command(format!("create {}: {e}", self.base_dir.display()))
        })?;

        git.worktree_add(branch, &path, base_branch)
            .map_err(command_error)?;
        info!(path = %path.display(), "worktree created");
        Ok(path)
    }

    #[instrument(skip_all, fields(path = %path.display(), force))]
    fn remove(&self, path: &Path, force: bool) -> Result<bool, WorkspaceError> {
        if !path.exists() {
            warn!("worktree already gone");
            return Ok(false);
        }
        if !force {
            let clean = Git::new(path, self.timeout)
                .is_clean()
                .map_err(command_error)?;
            if !clean {
                return Err(WorkspaceError::DirtyTree(path.to_path_buf()));
            }
        }
        self.git()
            .worktree_remove(path, force)
            .map_err(command_error)?;
        info!("worktree removed");
        Ok(true)
    }

    fn list(&self) -> Result<Vec<WorktreeEntry>, WorkspaceError> {
        let git = self.git();
        if !git.is_repository() {
            return Err(WorkspaceError::NotARepository(self.project_root.clone()));
        }
        git.worktree_list().map_err(command_error)
    }
}

fn command_error(err: anyhow::Error) -> WorkspaceError {
    WorkspaceError::Command(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_path_is_sibling_directory_by_default() {
        let manager = GitWorkspaceManager::new("/src/app", None, Duration::from_secs(5));
        assert_eq!(
            manager.worktree_path("feature/login"),
            PathBuf::from("/src/worktrees/app-feature-login")
        );
    }

    #[test]
    fn worktree_path_honours_configured_base() {
        let manager = GitWorkspaceManager::new(
            "/src/app",
            Some(PathBuf::from("/scratch")),
            Duration::from_secs(5),
        );
        assert_eq!(manager.worktree_path("fix"), PathBuf::from("/scratch/app-fix"));
    }

    #[test]
    fn create_outside_repository_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("plain");
        std::fs::create_dir_all(&root).expect("mkdir");
        let manager = GitWorkspaceManager::new(&root, None, Duration::from_secs(10));
        let err = manager.create("feature", "main").unwrap_err();
        assert_eq!(err, WorkspaceError::NotARepository(root));
    }

    #[test]
    fn removing_missing_worktree_is_a_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = GitWorkspaceManager::new(temp.path(), None, Duration::from_secs(10));
        let removed = manager
            .remove(&temp.path().join("gone"), false)
            .expect("remove");
        assert!(!removed);
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }

    /// Repository with one commit on `main`, plus a manager placing worktrees
    /// under `<temp>/worktrees`.
    fn repository() -> (tempfile::TempDir, GitWorkspaceManager) {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("app");
        std::fs::create_dir_all(&root).expect("mkdir");
        git(&root, &["init", "-q", "-b", "main"]);
        git(&root, &["config", "user.email", "dev@example.com"]);
        git(&root, &["config", "user.name", "Dev"]);
        std::fs::write(root.join("README.md"), "app\n").expect("write");
        git(&root, &["add", "README.md"]);
        git(&root, &["commit", "-q", "-m", "init"]);
        let manager = GitWorkspaceManager::new(
            &root,
            Some(temp.path().join("worktrees")),
            Duration::from_secs(30),
        );
        (temp, manager)
    }

    #[test]
    fn worktree_lifecycle_against_real_git() {
        let (_temp, manager) = repository();

        let path = manager.create("feature", "main").expect("create");
        assert_eq!(path, manager.worktree_path("feature"));
        assert!(path.join("README.md").is_file());
        let listed = manager.list().expect("list");
        assert!(listed.iter().any(|w| w.branch.as_deref() == Some("feature")), "{listed:?}");

        let again = manager.create("feature", "main").unwrap_err();
        assert_eq!(again, WorkspaceError::BranchExists("feature".to_string()));

        std::fs::write(path.join("scratch.txt"), "wip\n").expect("write");
        let dirty = manager.remove(&path, false).unwrap_err();
        assert_eq!(dirty, WorkspaceError::DirtyTree(path.clone()));
        assert!(path.exists());

        assert!(manager.remove(&path, true).expect("forced remove"));
        assert!(!path.exists());
        let listed = manager.list().expect("list");
        assert!(listed.iter().all(|w| w.branch.as_deref() != Some("feature")));
    }

    #[test]
    fn create_rejects_missing_base_and_occupied_path() {
        let (_temp, manager) = repository();

        let missing = manager.create("topic", "develop").unwrap_err();
        assert_eq!(missing, WorkspaceError::MissingBase("develop".to_string()));

        let occupied = manager.worktree_path("taken");
        std::fs::create_dir_all(&occupied).expect("mkdir");
        let err = manager.create("taken", "main").unwrap_err();
        assert_eq!(err, WorkspaceError::PathExists(occupied));
    }

    #[test]
    fn clean_worktree_removes_without_force() {
        let (_temp, manager) = repository();
        let path = manager.create("tidy", "main").expect("create");
        assert!(manager.remove(&path, false).expect("remove"));
        assert!(!path.exists());
    }
}
