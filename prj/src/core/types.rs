//! Shared result types for the execution engine.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::context::StepResult;

/// Provisioning strategy selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Steps run directly against the project.
    Bare,
    /// A terminal session is provisioned around the steps.
    Session,
    /// A worktree is provisioned, then a session bound to it.
    WorkspaceSession,
}

impl Strategy {
    pub fn needs_workspace(self) -> bool {
        matches!(self, Strategy::WorkspaceSession)
    }

    pub fn needs_session(self) -> bool {
        matches!(self, Strategy::Session | Strategy::WorkspaceSession)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Strategy::Bare => "bare",
            Strategy::Session => "session",
            Strategy::WorkspaceSession => "workspace-session",
        };
        f.write_str(label)
    }
}

/// Terminal, caller-visible outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Run identifier, `None` for dry runs.
    pub run_id: Option<String>,
    /// First error encountered, if the run failed.
    pub error: Option<String>,
    /// Name of the step that failed the run.
    pub failed_step: Option<String>,
    /// Rendered output (dry runs only).
    pub output: Option<String>,
    pub artifact_dir: Option<PathBuf>,
    /// Cleanup and teardown problems. Never the primary failure cause.
    pub warnings: Vec<String>,
    /// Step results in execution order, cleanup steps included.
    pub history: Vec<StepResult>,
}

impl ExecutionResult {
    pub fn succeeded(artifact_dir: Option<PathBuf>) -> Self {
        Self {
            success: true,
            run_id: None,
            error: None,
            failed_step: None,
            output: None,
            artifact_dir,
            warnings: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>, artifact_dir: Option<PathBuf>) -> Self {
        Self {
            success: false,
            run_id: None,
            error: Some(error.into()),
            failed_step: None,
            output: None,
            artifact_dir,
            warnings: Vec::new(),
            history: Vec::new(),
        }
    }
}
