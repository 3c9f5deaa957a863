//! Engine configuration stored under `.prj/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// How Shell steps containing shell metacharacters are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellPolicy {
    /// Tokenize and exec directly; metacharacters are refused.
    #[default]
    Direct,
    /// Hand metacharacter-bearing commands to `bash -c`.
    Interpret,
}

/// Engine configuration (TOML).
///
/// Resolved once by the caller and passed into the engine. Missing fields
/// default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Run-level budget when a definition declares none.
    pub default_timeout_secs: u64,

    /// Timeout for each cleanup step. Cleanup ignores the exhausted run budget.
    pub cleanup_step_timeout_secs: u64,

    /// Bound for each git/tmux call made while provisioning or tearing down.
    pub provisioning_timeout_secs: u64,

    /// Truncate captured step output beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    pub shell_policy: ShellPolicy,

    /// Base for new worktree branches.
    pub base_branch: String,

    /// Parent directory for worktrees (defaults to `<project-parent>/worktrees`).
    pub worktree_base_dir: Option<PathBuf>,

    /// Task segment of generated session names.
    pub session_task: String,

    /// Prefix for exported environment variables.
    pub env_prefix: String,

    /// Remove worktrees with uncommitted changes at teardown.
    pub force_worktree_removal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30 * 60,
            cleanup_step_timeout_secs: 60,
            provisioning_timeout_secs: 60,
            output_limit_bytes: 1_000_000,
            shell_policy: ShellPolicy::Direct,
            base_branch: "main".to_string(),
            worktree_base_dir: None,
            session_task: "dev".to_string(),
            env_prefix: "PRJ".to_string(),
            force_worktree_removal: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            return Err(anyhow!("default_timeout_secs must be > 0"));
        }
        if self.cleanup_step_timeout_secs == 0 {
            return Err(anyhow!("cleanup_step_timeout_secs must be > 0"));
        }
        if self.provisioning_timeout_secs == 0 {
            return Err(anyhow!("provisioning_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.base_branch.trim().is_empty() {
            return Err(anyhow!("base_branch must be non-empty"));
        }
        if self.session_task.trim().is_empty() {
            return Err(anyhow!("session_task must be non-empty"));
        }
        if self.env_prefix.is_empty()
            || !self
                .env_prefix
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(anyhow!("env_prefix must match [A-Z0-9_]+"));
        }
        Ok(())
    }

    pub fn cleanup_step_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_step_timeout_secs)
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }
}

/// Canonical paths under `.prj/` for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub prj_dir: PathBuf,
    pub config_path: PathBuf,
    pub actions_dir: PathBuf,
    pub steps_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub events_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let prj_dir = root.join(".prj");
        Self {
            root: root.clone(),
            prj_dir: prj_dir.clone(),
            config_path: prj_dir.join("config.toml"),
            actions_dir: prj_dir.join("actions"),
            steps_dir: prj_dir.join("steps"),
            artifacts_dir: prj_dir.join("artifacts"),
            events_path: prj_dir.join("events.jsonl"),
        }
    }

    /// Project name used in run ids, artifact paths, and session names.
    pub fn project_name(&self) -> String {
        project_name(&self.root)
    }
}

pub fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "project".to_string())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_preserves_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".prj").join("config.toml");
        let cfg = EngineConfig {
            shell_policy: ShellPolicy::Interpret,
            worktree_base_dir: Some(PathBuf::from("/scratch/wt")),
            force_worktree_removal: true,
            ..EngineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "base_branch = \"develop\"\nshell_policy = \"interpret\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.base_branch, "develop");
        assert_eq!(cfg.shell_policy, ShellPolicy::Interpret);
        assert_eq!(cfg.default_timeout_secs, 1800);
    }

    #[test]
    fn rejects_zero_timeouts_and_bad_prefix() {
        let zero = EngineConfig {
            cleanup_step_timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert!(zero.validate().is_err());

        let prefix = EngineConfig {
            env_prefix: "prj-x".to_string(),
            ..EngineConfig::default()
        };
        assert!(prefix.validate().is_err());
    }

    #[test]
    fn project_paths_live_under_prj_dir() {
        let paths = ProjectPaths::new("/src/app");
        assert_eq!(paths.steps_dir, PathBuf::from("/src/app/.prj/steps"));
        assert_eq!(paths.events_path, PathBuf::from("/src/app/.prj/events.jsonl"));
        assert_eq!(paths.project_name(), "app");
        assert_eq!(project_name(Path::new("/")), "project");
    }
}
