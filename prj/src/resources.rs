//! Workspace and session provisioning with guaranteed LIFO teardown.
//!
//! Every resource that was successfully created is pushed onto a
//! [`ResourceGuard`]. Teardown pops them in reverse creation order; if the
//! guard is dropped without an explicit teardown (early return, panic while
//! unwinding), `Drop` performs it and logs the outcome.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::context::ExecutionContext;
use crate::core::types::Strategy;
use crate::error::EngineError;
use crate::io::config::{EngineConfig, project_name};
use crate::io::session::{SessionManager, format_session_name};
use crate::io::workspace::{WorkspaceError, WorkspaceManager};

/// A resource owned by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Workspace(PathBuf),
    Session(String),
}

/// Owns the resources provisioned for one run and tears them down LIFO.
pub struct ResourceGuard<'a> {
    workspaces: &'a dyn WorkspaceManager,
    sessions: &'a dyn SessionManager,
    force_worktree_removal: bool,
    stack: Vec<Resource>,
}

impl<'a> ResourceGuard<'a> {
    pub fn new(
        workspaces: &'a dyn WorkspaceManager,
        sessions: &'a dyn SessionManager,
        force_worktree_removal: bool,
    ) -> Self {
        Self {
            workspaces,
            sessions,
            force_worktree_removal,
            stack: Vec::new(),
        }
    }

    /// Resources currently held, in creation order.
    pub fn held(&self) -> &[Resource] {
        &self.stack
    }

    /// Provision what `strategy` needs and bind it to `ctx`.
    ///
    /// On error, resources created before the failure stay on the guard so
    /// teardown still removes them.
    #[instrument(skip_all, fields(run_id = %ctx.run_id(), strategy = %strategy))]
    pub fn provision(
        &mut self,
        strategy: Strategy,
        ctx: &mut ExecutionContext,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        if strategy.needs_workspace() {
            self.provision_workspace(ctx, config)?;
        }
        if strategy.needs_session() {
            self.provision_session(ctx, config)?;
        }
        Ok(())
    }

    fn provision_workspace(
        &mut self,
        ctx: &mut ExecutionContext,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        let branch = workspace_branch(ctx);
        let base = ctx
            .argument("base_branch")
            .map_or_else(|| config.base_branch.clone(), str::to_string);

        let path = self
            .workspaces
            .create(&branch, &base)
            .map_err(|err| EngineError::Provisioning(format!("create worktree: {err}")))?;
        info!(branch = %branch, path = %path.display(), "worktree provisioned");
        self.stack.push(Resource::Workspace(path.clone()));

        ctx.set_shared_data("branch_name", branch);
        ctx.set_shared_data("worktree_path", path.display().to_string());
        ctx.bind_workspace(path);
        Ok(())
    }

    fn provision_session(
        &mut self,
        ctx: &mut ExecutionContext,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        let label = match ctx.shared_str("branch_name") {
            Some(branch) if ctx.workspace().is_some() => branch.to_string(),
            _ => dir_label(ctx.working_dir()),
        };
        let name = format_session_name(
            &project_name(ctx.project_root()),
            &label,
            &config.session_task,
        );

        let session = self
            .sessions
            .create(&name, ctx.working_dir())
            .map_err(|err| EngineError::Provisioning(format!("create session: {err}")))?;
        info!(session = %session, "session provisioned");
        self.stack.push(Resource::Session(session.clone()));
        ctx.bind_session(session);
        Ok(())
    }

    /// Tear down every held resource, most recent first.
    ///
    /// Failures do not stop the remaining teardown; each one is returned as a
    /// warning message.
    #[instrument(skip_all, fields(resources = self.stack.len()))]
    pub fn teardown(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        while let Some(resource) = self.stack.pop() {
            if let Err(err) = self.release(&resource) {
                warn!(err = %err, "teardown failed");
                warnings.push(err.to_string());
            }
        }
        warnings
    }

    fn release(&self, resource: &Resource) -> Result<(), EngineError> {
        match resource {
            Resource::Session(name) => {
                let killed = self
                    .sessions
                    .kill(name)
                    .map_err(|err| EngineError::Teardown(format!("kill session {name}: {err}")))?;
                info!(session = %name, killed, "session released");
            }
            Resource::Workspace(path) => {
                let removed = self
                    .workspaces
                    .remove(path, self.force_worktree_removal)
                    .map_err(|err| match err {
                        WorkspaceError::DirtyTree(_) => EngineError::Teardown(format!(
                            "{err}; left in place (set force_worktree_removal to discard)"
                        )),
                        other => EngineError::Teardown(format!(
                            "remove worktree {}: {other}",
                            path.display()
                        )),
                    })?;
                info!(path = %path.display(), removed, "worktree released");
            }
        }
        Ok(())
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        if self.stack.is_empty() {
            return;
        }
        warn!(
            resources = self.stack.len(),
            "resource guard dropped with live resources, tearing down"
        );
        self.teardown();
    }
}

/// Branch for a new worktree: `branch`/`name` argument, a `branch_name` set
/// earlier in shared data, or a generated `prj-<command>-<timestamp>`.
fn workspace_branch(ctx: &ExecutionContext) -> String {
    ctx.argument("branch")
        .or_else(|| ctx.argument("name"))
        .or_else(|| ctx.shared_str("branch_name"))
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "prj-{}-{}",
                ctx.command_name(),
                Utc::now().format("%Y%m%d-%H%M%S")
            )
        })
}

fn dir_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}
