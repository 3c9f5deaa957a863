//! Run-scoped execution state.
//!
//! An [`ExecutionContext`] is owned by exactly one run. It is never shared
//! between runs, so none of its state needs locking.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::definition::Phase;

/// Lifecycle status of a run as seen by steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
}

/// Status of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Record of an executed step. Immutable once appended to the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub phase: Phase,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub output: String,
    pub error: Option<String>,
}

impl StepResult {
    /// Result for a step that ran to completion (successfully or not).
    pub fn finished(
        name: impl Into<String>,
        phase: Phase,
        started_at: DateTime<Utc>,
        output: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        let status = if error.is_none() {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        Self {
            name: name.into(),
            phase,
            status,
            started_at,
            ended_at: Utc::now(),
            output: output.into(),
            error,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// Mutable state for a single run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    run_id: String,
    command_name: String,
    project_root: PathBuf,
    base_dir: PathBuf,
    workspace: Option<PathBuf>,
    session: Option<String>,
    environment: BTreeMap<String, String>,
    shared: HashMap<String, Value>,
    history: Vec<StepResult>,
    status: RunStatus,
    artifact_dir: PathBuf,
    created_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        run_id: impl Into<String>,
        command_name: impl Into<String>,
        project_root: impl Into<PathBuf>,
        artifact_dir: impl Into<PathBuf>,
    ) -> Self {
        let project_root = project_root.into();
        Self {
            run_id: run_id.into(),
            command_name: command_name.into(),
            base_dir: project_root.clone(),
            project_root,
            workspace: None,
            session: None,
            environment: BTreeMap::new(),
            shared: HashMap::new(),
            history: Vec::new(),
            status: RunStatus::Active,
            artifact_dir: artifact_dir.into(),
            created_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn history(&self) -> &[StepResult] {
        &self.history
    }

    /// Directory steps run in: the workspace when bound, else the base directory.
    pub fn working_dir(&self) -> &Path {
        self.workspace.as_deref().unwrap_or(&self.base_dir)
    }

    /// Override the directory used when no workspace is bound.
    pub fn set_base_dir(&mut self, dir: impl Into<PathBuf>) {
        self.base_dir = dir.into();
    }

    pub fn set_environment(&mut self, environment: BTreeMap<String, String>) {
        self.environment = environment;
    }

    pub fn bind_workspace(&mut self, path: impl Into<PathBuf>) {
        self.workspace = Some(path.into());
    }

    pub fn bind_session(&mut self, name: impl Into<String>) {
        self.session = Some(name.into());
    }

    /// Append a step result. History is append-only.
    pub fn add_step_result(&mut self, result: StepResult) {
        self.history.push(result);
    }

    pub fn set_shared_data(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.shared.insert(key.into(), value.into());
    }

    pub fn shared_data(&self, key: &str) -> Option<&Value> {
        self.shared.get(key)
    }

    /// Shared value for `key`, or `default` when unset.
    pub fn get_shared_data(&self, key: &str, default: Value) -> Value {
        self.shared.get(key).cloned().unwrap_or(default)
    }

    /// Shared value for `key` when it is a string.
    pub fn shared_str(&self, key: &str) -> Option<&str> {
        self.shared.get(key).and_then(Value::as_str)
    }

    /// Validated run argument by name.
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.shared
            .get("args")
            .and_then(|args| args.get(name))
            .and_then(Value::as_str)
    }

    /// Move an active run to `Failed`. Terminal states are left untouched.
    pub fn mark_failed(&mut self) {
        if self.status == RunStatus::Active {
            self.status = RunStatus::Failed;
        }
    }

    /// Move an active run to `Completed`. A failed run stays failed.
    pub fn mark_completed(&mut self) {
        if self.status == RunStatus::Active {
            self.status = RunStatus::Completed;
        }
    }

    /// Flattened read-only view handed to steps.
    pub fn view(&self) -> ContextView<'_> {
        ContextView {
            run_id: &self.run_id,
            command_name: &self.command_name,
            project_root: &self.project_root,
            working_dir: self.working_dir(),
            workspace: self.workspace.as_deref(),
            session: self.session.as_deref(),
            artifact_dir: &self.artifact_dir,
            environment: &self.environment,
            shared: &self.shared,
            history: &self.history,
        }
    }
}

/// Borrowed snapshot of a context used for argument and environment substitution.
#[derive(Debug, Clone, Copy)]
pub struct ContextView<'a> {
    pub run_id: &'a str,
    pub command_name: &'a str,
    pub project_root: &'a Path,
    pub working_dir: &'a Path,
    pub workspace: Option<&'a Path>,
    pub session: Option<&'a str>,
    pub artifact_dir: &'a Path,
    pub environment: &'a BTreeMap<String, String>,
    pub shared: &'a HashMap<String, Value>,
    pub history: &'a [StepResult],
}
