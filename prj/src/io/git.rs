//! Git adapter used for worktree provisioning and repository checks.
//!
//! Every call goes through [`run_process`] so a wedged git invocation is
//! bounded by the provisioning timeout instead of hanging a run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, ProcessSpec, run_process};

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name, `None` for detached or bare worktrees.
    pub branch: Option<String>,
    pub head: Option<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when `workdir` is inside a git work tree.
    pub fn is_repository(&self) -> bool {
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out.success() && out.stdout_text().trim() == "true",
            Err(err) => {
                debug!(err = %err, "git unavailable");
                false
            }
        }
    }

    /// Absolute path of the repository top level.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Current branch name, `None` on detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Ok(None);
        }
        Ok(Some(name))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(out.success())
    }

    /// Check whether `rev` resolves to a commit.
    pub fn rev_exists(&self, rev: &str) -> Result<bool> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.success())
    }

    /// True when the work tree at `workdir` has no changes (including untracked files).
    pub fn is_clean(&self) -> Result<bool> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out.trim().is_empty())
    }

    /// `git worktree add -b <branch> <path> <base>`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add(&self, branch: &str, path: &Path, base: &str) -> Result<()> {
        debug!(branch, base, "adding worktree");
        let path_arg = path.display().to_string();
        self.run_checked(&["worktree", "add", "-b", branch, &path_arg, base])?;
        Ok(())
    }

    /// `git worktree remove [--force] <path>`.
    #[instrument(skip_all, fields(path = %path.display(), force))]
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path_arg = path.display().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_arg);
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_porcelain(&out))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let spec = ProcessSpec::new("git", &self.workdir, self.timeout).args(args.iter().copied());
        run_process(&spec)
    }
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
                head: None,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                entry.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                entry.branch = Some(short.to_string());
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_list() {
        let raw = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\n\
                   worktree /worktrees/repo-feature\nHEAD def456\nbranch refs/heads/feature/x\n\n\
                   worktree /worktrees/detached\nHEAD 0123\ndetached\n";
        let entries = parse_worktree_porcelain(raw);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, PathBuf::from("/repo"));
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch.as_deref(), Some("feature/x"));
        assert_eq!(entries[1].head.as_deref(), Some("def456"));
        assert_eq!(entries[2].branch, None);
    }

    #[test]
    fn empty_output_has_no_entries() {
        assert!(parse_worktree_porcelain("").is_empty());
    }

    #[test]
    fn non_repository_is_detected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path(), Duration::from_secs(10));
        assert!(!git.is_repository());
    }
}
