//! Lifecycle controller: the single entry point that runs an action.
//!
//! A run moves through `Created -> Provisioning -> Running -> {Completed |
//! Failed} -> TornDown`. Resources are held by a [`ResourceGuard`] so they are
//! released in reverse creation order whatever happens in between. Only
//! definition errors escape [`Engine::execute`]; every other failure is folded
//! into the returned [`ExecutionResult`].

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::builtins::BuiltinRegistry;
use crate::core::arguments::resolve_arguments;
use crate::core::classifier::select_strategy;
use crate::core::context::{ExecutionContext, RunStatus, StepResult};
use crate::core::definition::{ActionDefinition, Phase, Step};
use crate::core::lifecycle::LifecycleState;
use crate::core::types::{ExecutionResult, Strategy};
use crate::error::EngineError;
use crate::io::artifacts::{ArtifactStore, FsArtifactStore, RunMetadata, step_log_name};
use crate::io::config::{EngineConfig, ProjectPaths};
use crate::io::events::{EventStatus, EventStore, JsonlEventStore, NewEvent};
use crate::io::session::{SessionManager, TmuxSessionManager};
use crate::io::workspace::{GitWorkspaceManager, WorkspaceManager};
use crate::resources::ResourceGuard;
use crate::step_exec::{StepExecutor, StepOutcome};

/// External collaborators the engine delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub sessions: Arc<dyn SessionManager>,
    pub events: Arc<dyn EventStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl Collaborators {
    /// git worktrees, tmux sessions, and `.prj/` storage for one project.
    pub fn for_project(paths: &ProjectPaths, config: &EngineConfig) -> Self {
        Self {
            workspaces: Arc::new(GitWorkspaceManager::new(
                &paths.root,
                config.worktree_base_dir.clone(),
                config.provisioning_timeout(),
            )),
            sessions: Arc::new(TmuxSessionManager::new(config.provisioning_timeout())),
            events: Arc::new(JsonlEventStore::new(&paths.events_path)),
            artifacts: Arc::new(FsArtifactStore::new(&paths.artifacts_dir)),
        }
    }
}

/// Executes action definitions. Shareable across threads; every call to
/// [`Engine::execute`] owns its own context.
pub struct Engine {
    config: EngineConfig,
    collaborators: Collaborators,
    builtins: BuiltinRegistry,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            builtins: BuiltinRegistry::standard(),
        }
    }

    /// Replace the builtin registry.
    pub fn with_builtins(mut self, builtins: BuiltinRegistry) -> Self {
        self.builtins = builtins;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Render what a run would do without touching any resource.
    pub fn plan(
        &self,
        definition: &ActionDefinition,
        arguments: &BTreeMap<String, String>,
    ) -> Result<ExecutionResult, EngineError> {
        let resolved = check_definition(definition, arguments)?;
        let strategy = select_strategy(definition);
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "action: {}", definition.name);
        let _ = writeln!(out, "strategy: {strategy}");
        let _ = writeln!(out, "timeout: {}s", self.run_timeout(definition).as_secs());
        if !resolved.is_empty() {
            let _ = writeln!(out, "arguments:");
            for (key, value) in &resolved {
                let _ = writeln!(out, "  {key} = {value}");
            }
        }
        for (label, phase) in [
            ("pre", Phase::Pre),
            ("main", Phase::Main),
            ("post", Phase::Post),
            ("cleanup_on_failure", Phase::Cleanup),
        ] {
            let steps = definition.phase_steps(phase);
            if steps.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{label}:");
            for (index, step) in steps.iter().enumerate() {
                let _ = writeln!(out, "  {}. [{}] {}", index + 1, step.kind, describe(step));
            }
        }
        let mut result = ExecutionResult::succeeded(None);
        result.output = Some(out);
        Ok(result)
    }

    /// Run `definition` with `arguments` against the project at `project_root`.
    #[instrument(skip_all, fields(action = %definition.name))]
    pub fn execute(
        &self,
        definition: &ActionDefinition,
        arguments: &BTreeMap<String, String>,
        project_root: &Path,
    ) -> Result<ExecutionResult, EngineError> {
        let resolved = check_definition(definition, arguments)?;
        let strategy = select_strategy(definition);
        let paths = ProjectPaths::new(project_root);
        let project = paths.project_name();
        let run_id = new_run_id(&project);
        info!(run_id = %run_id, strategy = %strategy, "run starting");

        let artifact_dir = match self.collaborators.artifacts.create_run_dir(
            &project,
            &run_id,
            &definition.name,
        ) {
            Ok(dir) => dir,
            Err(err) => {
                error!(err = %format!("{err:#}"), "cannot create artifact directory");
                let mut result = ExecutionResult::failed(
                    EngineError::Provisioning(format!("artifact directory: {err:#}")).to_string(),
                    None,
                );
                result.run_id = Some(run_id);
                return Ok(result);
            }
        };

        let mut ctx = ExecutionContext::new(&run_id, &definition.name, project_root, &artifact_dir);
        if let Some(dir) = &definition.working_directory {
            ctx.set_base_dir(project_root.join(dir));
        }
        ctx.set_environment(definition.environment.clone());
        let args: Map<String, Value> = resolved
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        ctx.set_shared_data("args", Value::Object(args));

        let event_id = self.start_event(&ctx);
        if let Some(id) = &event_id {
            ctx.set_shared_data("event_id", id.clone());
        }

        let mut run = Run {
            engine: self,
            definition,
            executor: StepExecutor::new(
                &self.builtins,
                self.collaborators.artifacts.as_ref(),
                &paths.steps_dir,
                &self.config,
            ),
            ctx,
            state: LifecycleState::Created,
            step_no: 0,
            first_error: None,
            failed_step: None,
            warnings: Vec::new(),
        };
        run.drive(strategy);

        let result = run.finish(strategy);
        self.end_event(event_id.as_deref(), &result);
        info!(
            run_id = %run_id,
            success = result.success,
            warnings = result.warnings.len(),
            "run finished"
        );
        Ok(result)
    }

    fn run_timeout(&self, definition: &ActionDefinition) -> Duration {
        let secs = if definition.timeout_secs == 0 {
            self.config.default_timeout_secs
        } else {
            definition.timeout_secs
        };
        Duration::from_secs(secs)
    }

    fn start_event(&self, ctx: &ExecutionContext) -> Option<String> {
        let event = NewEvent {
            command: ctx.command_name().to_string(),
            project_path: ctx.project_root().to_path_buf(),
            session_id: ctx.run_id().to_string(),
            artifacts_path: ctx.artifact_dir().to_path_buf(),
            worktree_name: None,
        };
        match self.collaborators.events.start_event(&event) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "event store unavailable");
                None
            }
        }
    }

    fn end_event(&self, event_id: Option<&str>, result: &ExecutionResult) {
        let Some(event_id) = event_id else {
            return;
        };
        let (status, exit_code) = if result.success {
            (EventStatus::Completed, 0)
        } else {
            (EventStatus::Failed, 1)
        };
        if let Err(err) =
            self.collaborators
                .events
                .end_event(event_id, status, exit_code, result.error.as_deref())
        {
            warn!(err = %format!("{err:#}"), event_id, "failed to record event end");
        }
    }
}

/// State of one in-flight run.
struct Run<'a> {
    engine: &'a Engine,
    definition: &'a ActionDefinition,
    executor: StepExecutor<'a>,
    ctx: ExecutionContext,
    state: LifecycleState,
    step_no: usize,
    first_error: Option<EngineError>,
    failed_step: Option<String>,
    warnings: Vec<String>,
}

impl Run<'_> {
    fn drive(&mut self, strategy: Strategy) {
        let engine = self.engine;
        let mut guard = ResourceGuard::new(
            engine.collaborators.workspaces.as_ref(),
            engine.collaborators.sessions.as_ref(),
            engine.config.force_worktree_removal,
        );

        self.transition(LifecycleState::Provisioning);
        match guard.provision(strategy, &mut self.ctx, &engine.config) {
            Ok(()) => {
                self.transition(LifecycleState::Running);
                self.run_steps();
                if self.first_error.is_some() {
                    self.transition(LifecycleState::Failed);
                    self.run_cleanup_steps();
                } else {
                    self.transition(LifecycleState::Completed);
                    self.ctx.mark_completed();
                }
            }
            Err(err) => {
                warn!(err = %err, "provisioning failed");
                self.ctx.mark_failed();
                self.first_error = Some(err);
                self.transition(LifecycleState::Failed);
            }
        }

        self.warnings.extend(guard.teardown());
        self.transition(LifecycleState::TornDown);
    }

    fn run_steps(&mut self) {
        let run_timeout = self.engine.run_timeout(self.definition);
        let deadline = Instant::now() + run_timeout;
        let definition = self.definition;
        for (phase, step) in definition.run_steps() {
            let started_at = Utc::now();
            let outcome = match remaining_budget(deadline) {
                Some(remaining) => {
                    // Steps without their own timeout inherit the run's.
                    let timeout = step
                        .timeout_secs
                        .map_or(run_timeout, Duration::from_secs)
                        .min(remaining);
                    self.executor.execute(step, &mut self.ctx, timeout)
                }
                None => StepOutcome {
                    output: String::new(),
                    failure: Some(EngineError::Timeout {
                        step: step.name.clone(),
                        timeout: run_timeout,
                    }),
                },
            };
            let failure = self.record(step, phase, started_at, outcome);
            if let Some(err) = failure {
                self.ctx.mark_failed();
                self.failed_step = Some(step.name.clone());
                self.first_error = Some(err);
                break;
            }
        }
    }

    /// Best-effort: every cleanup step is attempted once, failures become warnings.
    fn run_cleanup_steps(&mut self) {
        let definition = self.definition;
        for step in &definition.cleanup_on_failure {
            let started_at = Utc::now();
            let timeout = step
                .timeout_secs
                .map_or_else(|| self.engine.config.cleanup_step_timeout(), Duration::from_secs);
            let outcome = self.executor.execute(step, &mut self.ctx, timeout);
            if let Some(err) = self.record(step, Phase::Cleanup, started_at, outcome) {
                warn!(step = %step.name, err = %err, "cleanup step failed");
                self.warnings.push(format!("cleanup {err}"));
            }
        }
    }

    /// Append the step result, persist its output, and hand back its failure.
    fn record(
        &mut self,
        step: &Step,
        phase: Phase,
        started_at: chrono::DateTime<Utc>,
        outcome: StepOutcome,
    ) -> Option<EngineError> {
        self.step_no += 1;
        let error = outcome.failure.as_ref().map(ToString::to_string);
        let mut log = outcome.output.clone();
        if let Some(error) = &error {
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(&format!("error: {error}\n"));
        }
        if let Err(err) = self.engine.collaborators.artifacts.store_content(
            self.ctx.artifact_dir(),
            &log,
            &step_log_name(self.step_no, &step.name),
            Some("logs"),
        ) {
            warn!(err = %format!("{err:#}"), step = %step.name, "failed to store step log");
            self.warnings
                .push(format!("artifact for step '{}' not stored: {err:#}", step.name));
        }
        self.ctx.add_step_result(StepResult::finished(
            &step.name,
            phase,
            started_at,
            outcome.output,
            error,
        ));
        outcome.failure
    }

    fn transition(&mut self, to: LifecycleState) {
        match self.state.advance(to) {
            Ok(next) => {
                debug!(from = %self.state, to = %next, "lifecycle transition");
                self.state = next;
            }
            Err(err) => error!(err = %err, "lifecycle violation"),
        }
    }

    fn finish(mut self, strategy: Strategy) -> ExecutionResult {
        let success = self.first_error.is_none() && self.ctx.status() == RunStatus::Completed;
        let error = self.first_error.as_ref().map(ToString::to_string);

        let metadata = RunMetadata {
            run_id: self.ctx.run_id(),
            action: &self.definition.name,
            strategy,
            status: self.ctx.status(),
            success,
            error: error.as_deref(),
            failed_step: self.failed_step.as_deref(),
            workspace: self.ctx.workspace(),
            session: self.ctx.session(),
            warnings: &self.warnings,
            history: self.ctx.history(),
        };
        let stored = metadata.to_json().and_then(|json| {
            self.engine.collaborators.artifacts.store_content(
                self.ctx.artifact_dir(),
                &json,
                "metadata.json",
                None,
            )
        });
        if let Err(err) = stored {
            warn!(err = %format!("{err:#}"), "failed to store run metadata");
            self.warnings.push(format!("metadata not stored: {err:#}"));
        }

        ExecutionResult {
            success,
            run_id: Some(self.ctx.run_id().to_string()),
            error,
            failed_step: self.failed_step,
            output: None,
            artifact_dir: Some(self.ctx.artifact_dir().to_path_buf()),
            warnings: self.warnings,
            history: self.ctx.history().to_vec(),
        }
    }
}

/// Validate the definition and the supplied arguments before anything runs.
fn check_definition(
    definition: &ActionDefinition,
    arguments: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, EngineError> {
    let problems = definition.validate();
    if !problems.is_empty() {
        return Err(EngineError::Definition(format!(
            "action '{}' is invalid: {}",
            definition.name,
            problems.join("; ")
        )));
    }
    resolve_arguments(&definition.arguments, arguments).map_err(|problems| {
        EngineError::Definition(format!(
            "invalid arguments for '{}': {}",
            definition.name,
            problems.join("; ")
        ))
    })
}

fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

/// `<project>-<utc timestamp>-<8 hex chars>`.
pub fn new_run_id(project: &str) -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        project.replace(['/', '\\', ' '], "_"),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        &short[..8]
    )
}

fn describe(step: &Step) -> String {
    let mut text = if step.name == step.action {
        step.action.clone()
    } else {
        format!("{} ({})", step.name, step.action)
    };
    if let Some(secs) = step.timeout_secs {
        text.push_str(&format!(" timeout={secs}s"));
    }
    for (key, value) in &step.args {
        text.push_str(&format!(" {key}={value}"));
    }
    text
}
