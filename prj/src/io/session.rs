//! Session manager: persistent tmux sessions bound to a working directory.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{info, instrument};

use crate::io::process::{CommandOutput, ProcessSpec, run_process};

const MAX_SESSION_NAME_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("terminal multiplexer unavailable: {0}")]
    Unavailable(String),
    #[error("session '{0}' already exists")]
    NameCollision(String),
    #[error("tmux {command} timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    #[error("tmux command failed: {0}")]
    Command(String),
}

/// Listed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub path: Option<String>,
    pub attached: bool,
}

/// Creates and kills persistent terminal sessions.
pub trait SessionManager: Send + Sync {
    /// Create a detached session. Existing names are rejected, never reused.
    fn create(&self, name: &str, working_dir: &Path) -> Result<String, SessionError>;
    fn exists(&self, name: &str) -> Result<bool, SessionError>;
    /// Kill a session. `Ok(false)` means it was already gone.
    fn kill(&self, name: &str) -> Result<bool, SessionError>;
    fn list(&self) -> Result<Vec<SessionInfo>, SessionError>;
}

/// [`SessionManager`] backed by the `tmux` binary.
#[derive(Debug, Clone)]
pub struct TmuxSessionManager {
    timeout: Duration,
}

impl TmuxSessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn tmux(&self, args: &[&str]) -> Result<CommandOutput, SessionError> {
        // tmux ignores its cwd for these commands; "/" keeps it independent of the caller.
        let spec = ProcessSpec::new("tmux", "/", self.timeout).args(args.iter().copied());
        let output = run_process(&spec).map_err(|e| SessionError::Unavailable(format!("{e:#}")))?;
        if output.timed_out {
            return Err(SessionError::Timeout {
                command: args.join(" "),
                timeout: self.timeout,
            });
        }
        Ok(output)
    }
}

impl SessionManager for TmuxSessionManager {
    #[instrument(skip_all, fields(name, working_dir = %working_dir.display()))]
    fn create(&self, name: &str, working_dir: &Path) -> Result<String, SessionError> {
        let version = self.tmux(&["-V"])?;
        if !version.success() {
            return Err(SessionError::Unavailable(version.stderr_text().trim().to_string()));
        }
        if self.exists(name)? {
            return Err(SessionError::NameCollision(name.to_string()));
        }
        let dir = working_dir.display().to_string();
        let output = self.tmux(&["new-session", "-d", "-s", name, "-c", &dir])?;
        if !output.success() {
            let stderr = output.stderr_text();
            if stderr.contains("duplicate session") {
                return Err(SessionError::NameCollision(name.to_string()));
            }
            return Err(SessionError::Command(stderr.trim().to_string()));
        }
        info!("session created");
        Ok(name.to_string())
    }

    fn exists(&self, name: &str) -> Result<bool, SessionError> {
        let target = format!("={name}");
        Ok(self.tmux(&["has-session", "-t", &target])?.success())
    }

    #[instrument(skip_all, fields(name))]
    fn kill(&self, name: &str) -> Result<bool, SessionError> {
        if !self.exists(name)? {
            return Ok(false);
        }
        let target = format!("={name}");
        let output = self.tmux(&["kill-session", "-t", &target])?;
        if !output.success() {
            return Err(SessionError::Command(output.stderr_text().trim().to_string()));
        }
        info!("session killed");
        Ok(true)
    }

    fn list(&self) -> Result<Vec<SessionInfo>, SessionError> {
        let output = self.tmux(&[
            "list-sessions",
            "-F",
            "#{session_name}|#{session_path}|#{session_attached}",
        ])?;
        if !output.success() {
            let stderr = output.stderr_text().to_lowercase();
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            return Err(SessionError::Command(stderr.trim().to_string()));
        }
        Ok(parse_session_list(&output.stdout_text()))
    }
}

/// Parse `tmux list-sessions -F '#{session_name}|#{session_path}|#{session_attached}'`.
pub fn parse_session_list(output: &str) -> Vec<SessionInfo> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.split('|');
            let name = parts.next()?.to_string();
            let path = parts.next().filter(|p| !p.is_empty()).map(str::to_string);
            let attached = parts.next().is_some_and(|a| a.trim() != "0");
            Some(SessionInfo {
                name,
                path,
                attached,
            })
        })
        .collect()
}

/// Lowercase, map anything outside `[a-z0-9_-]` to `-`, collapse and trim dashes.
pub fn sanitize_session_name(raw: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    static DASHES: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-z0-9_-]").expect("valid regex"));
    let dashes = DASHES.get_or_init(|| Regex::new(r"-+").expect("valid regex"));

    let lower = raw.to_lowercase();
    let replaced = invalid.replace_all(&lower, "-");
    let collapsed = dashes.replace_all(&replaced, "-");
    let trimmed = collapsed.trim_matches('-');
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<project>-<worktree>-<task>`, shortening the worktree part to stay under 50 chars.
pub fn format_session_name(project: &str, worktree: &str, task: &str) -> String {
    let project = sanitize_session_name(project);
    let mut worktree = sanitize_session_name(worktree);
    let task = sanitize_session_name(task);

    let name = format!("{project}-{worktree}-{task}");
    if name.len() <= MAX_SESSION_NAME_LEN {
        return name;
    }
    let budget = MAX_SESSION_NAME_LEN.saturating_sub(project.len() + task.len() + 2);
    if budget > 5 {
        worktree.truncate(budget);
        let worktree = worktree.trim_end_matches('-');
        return format!("{project}-{worktree}-{task}");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_names_for_tmux() {
        assert_eq!(sanitize_session_name("My Project.v2"), "my-project-v2");
        assert_eq!(sanitize_session_name("feature/login--x"), "feature-login-x");
        assert_eq!(sanitize_session_name("..."), "session");
        assert_eq!(sanitize_session_name("keep_under"), "keep_under");
    }

    #[test]
    fn formats_session_name_from_parts() {
        assert_eq!(format_session_name("App", "feature/x", "dev"), "app-feature-x-dev");
    }

    #[test]
    fn long_worktree_segment_is_truncated() {
        let name = format_session_name("app", &"w".repeat(80), "dev");
        assert!(name.len() <= MAX_SESSION_NAME_LEN, "{name}");
        assert!(name.starts_with("app-www"));
        assert!(name.ends_with("-dev"));
    }

    #[test]
    fn parses_session_listing() {
        let sessions = parse_session_list("app-main-dev|/src/app|1\nscratch||0\n\n");
        assert_eq!(
            sessions,
            vec![
                SessionInfo {
                    name: "app-main-dev".to_string(),
                    path: Some("/src/app".to_string()),
                    attached: true,
                },
                SessionInfo {
                    name: "scratch".to_string(),
                    path: None,
                    attached: false,
                },
            ]
        );
    }
}
