//! In-process builtin steps, dispatched by action identifier.
//!
//! Builtins run on the run's own thread and are not preemptible. Any external
//! call they make is bounded by the step timeout passed in [`BuiltinCall`].

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde_json::{Value, json};

use crate::core::context::ExecutionContext;
use crate::core::definition::Step;
use crate::io::artifacts::ArtifactStore;
use crate::io::config::project_name;
use crate::io::git::Git;

/// Everything a builtin may touch while it runs.
pub struct BuiltinCall<'a> {
    pub step: &'a Step,
    pub ctx: &'a mut ExecutionContext,
    pub artifacts: &'a dyn ArtifactStore,
    pub timeout: Duration,
}

/// A builtin returns its output text, or an error that fails the step.
pub type BuiltinFn = fn(&mut BuiltinCall<'_>) -> Result<String>;

/// Lookup table from action identifier to builtin.
#[derive(Clone)]
pub struct BuiltinRegistry {
    entries: BTreeMap<String, BuiltinFn>,
}

impl std::fmt::Debug for BuiltinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

impl BuiltinRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry with every builtin shipped with the engine.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("echo", echo);
        registry.register("setup-environment", setup_environment);
        registry.register("validate-prerequisites", validate_prerequisites);
        registry.register("gather-context", gather_context);
        registry.register("store-artifacts", store_artifacts);
        registry.register("cleanup", cleanup);
        registry.register("create-worktree", report_worktree);
        registry.register("start-worktree-session", report_worktree_session);
        registry.register("start-session", report_session);
        registry.register("session-create", report_session);
        registry.register("set-data", set_data);
        registry.register("fail", fail);
        registry
    }

    /// Add or replace a builtin.
    pub fn register(&mut self, name: impl Into<String>, builtin: BuiltinFn) {
        self.entries.insert(name.into(), builtin);
    }

    pub fn get(&self, name: &str) -> Option<BuiltinFn> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn echo(call: &mut BuiltinCall<'_>) -> Result<String> {
    let message = call
        .ctx
        .argument("message")
        .map(str::to_string)
        .or_else(|| call.step.args.get("message").cloned())
        .unwrap_or_default();
    Ok(message)
}

fn setup_environment(call: &mut BuiltinCall<'_>) -> Result<String> {
    let dir = call.ctx.artifact_dir().to_path_buf();
    for sub in ["logs", "outputs"] {
        let path = dir.join(sub);
        fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;
    }
    Ok("Environment setup complete".to_string())
}

fn validate_prerequisites(call: &mut BuiltinCall<'_>) -> Result<String> {
    let git = Git::new(call.ctx.project_root(), call.timeout);
    if !git.is_repository() {
        bail!("prerequisites not met: not in a git repository");
    }
    Ok("Prerequisites validated".to_string())
}

fn gather_context(call: &mut BuiltinCall<'_>) -> Result<String> {
    let project = project_name(call.ctx.project_root());
    let git = Git::new(call.ctx.working_dir(), call.timeout);
    let branch = if git.is_repository() {
        git.current_branch().ok().flatten()
    } else {
        None
    };
    let info = json!({
        "project_name": project,
        "git_branch": branch.unwrap_or_else(|| "unknown".to_string()),
        "timestamp": Utc::now().to_rfc3339(),
    });

    let mut body = serde_json::to_string_pretty(&info).context("serialize context info")?;
    body.push('\n');
    call.artifacts
        .store_content(call.ctx.artifact_dir(), &body, "context.json", Some("specs"))?;
    call.ctx.set_shared_data("context_info", info);
    Ok(format!("Context gathered for {project}"))
}

fn store_artifacts(call: &mut BuiltinCall<'_>) -> Result<String> {
    let dir = call.ctx.artifact_dir().display().to_string();
    match call.ctx.shared_str("event_id") {
        Some(event_id) => Ok(format!("Artifacts stored in {dir} (event {event_id})")),
        None => Ok(format!("Artifacts stored in {dir}")),
    }
}

fn cleanup(_call: &mut BuiltinCall<'_>) -> Result<String> {
    Ok("Cleanup completed".to_string())
}

fn report_worktree(call: &mut BuiltinCall<'_>) -> Result<String> {
    let path = call
        .ctx
        .workspace()
        .ok_or_else(|| anyhow!("no worktree is bound to this run"))?;
    let branch = call.ctx.shared_str("branch_name").unwrap_or("unknown");
    Ok(format!("Created worktree at {} on branch {branch}", path.display()))
}

fn report_session(call: &mut BuiltinCall<'_>) -> Result<String> {
    let session = call
        .ctx
        .session()
        .ok_or_else(|| anyhow!("no session is bound to this run"))?;
    Ok(format!("Started tmux session: {session}"))
}

fn report_worktree_session(call: &mut BuiltinCall<'_>) -> Result<String> {
    let worktree = report_worktree(call)?;
    let session = report_session(call)?;
    Ok(format!("{worktree}\n{session}"))
}

fn set_data(call: &mut BuiltinCall<'_>) -> Result<String> {
    if call.step.args.is_empty() {
        bail!("set-data needs at least one step argument");
    }
    for (key, value) in &call.step.args {
        if key == "args" {
            bail!("shared key 'args' is reserved");
        }
        call.ctx.set_shared_data(key.clone(), Value::String(value.clone()));
    }
    let keys: Vec<&str> = call.step.args.keys().map(String::as_str).collect();
    Ok(format!("Stored {}", keys.join(", ")))
}

fn fail(call: &mut BuiltinCall<'_>) -> Result<String> {
    let message = call
        .step
        .args
        .get("message")
        .map(String::as_str)
        .unwrap_or("step requested failure");
    Err(anyhow!("{message}"))
}
