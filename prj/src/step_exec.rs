//! Dispatch of a single step by kind.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};

use crate::builtins::{BuiltinCall, BuiltinRegistry};
use crate::core::context::ExecutionContext;
use crate::core::definition::{Step, StepKind};
use crate::core::env::build_step_env;
use crate::core::tokenize::{ShellWords, split_command};
use crate::error::EngineError;
use crate::io::artifacts::ArtifactStore;
use crate::io::config::{EngineConfig, ShellPolicy};
use crate::io::process::{ProcessSpec, run_process};
use crate::io::steps::resolve_script;

/// Result of one step execution. The caller records it in the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub output: String,
    pub failure: Option<EngineError>,
}

impl StepOutcome {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            failure: None,
        }
    }

    fn failed(output: impl Into<String>, failure: EngineError) -> Self {
        Self {
            output: output.into(),
            failure: Some(failure),
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs builtin, script and shell steps for one run.
pub struct StepExecutor<'a> {
    builtins: &'a BuiltinRegistry,
    artifacts: &'a dyn ArtifactStore,
    steps_dir: PathBuf,
    shell_policy: ShellPolicy,
    env_prefix: &'a str,
    output_limit_bytes: usize,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        builtins: &'a BuiltinRegistry,
        artifacts: &'a dyn ArtifactStore,
        steps_dir: impl Into<PathBuf>,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            builtins,
            artifacts,
            steps_dir: steps_dir.into(),
            shell_policy: config.shell_policy,
            env_prefix: &config.env_prefix,
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    /// Execute `step` against `ctx` under `timeout`.
    ///
    /// Never panics on step failure; the outcome carries the error instead.
    #[instrument(skip_all, fields(step = %step.name, kind = %step.kind, timeout_secs = timeout.as_secs()))]
    pub fn execute(&self, step: &Step, ctx: &mut ExecutionContext, timeout: Duration) -> StepOutcome {
        let outcome = match step.kind {
            StepKind::Builtin => self.run_builtin(step, ctx, timeout),
            StepKind::Script => self.run_script(step, ctx, timeout),
            StepKind::Shell => self.run_shell(step, ctx, timeout),
        };
        match &outcome.failure {
            Some(err) if err.is_security_violation() => {
                error!(security_violation = true, action = %step.action, err = %err, "step rejected");
            }
            Some(err) => warn!(err = %err, "step failed"),
            None => debug!("step completed"),
        }
        outcome
    }

    fn run_builtin(&self, step: &Step, ctx: &mut ExecutionContext, timeout: Duration) -> StepOutcome {
        let Some(builtin) = self.builtins.get(&step.action) else {
            return StepOutcome::failed(
                "",
                EngineError::StepNotFound {
                    step: step.name.clone(),
                    action: step.action.clone(),
                },
            );
        };

        let started = Instant::now();
        let mut call = BuiltinCall {
            step,
            ctx,
            artifacts: self.artifacts,
            timeout,
        };
        let result = builtin(&mut call);
        // Builtins cannot be interrupted, so an overrun is reported after the fact.
        if started.elapsed() > timeout {
            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(step = %step.name, err = %message, "builtin failed after overrunning its timeout");
                    message + "\n"
                }
            };
            return StepOutcome::failed(
                output,
                EngineError::Timeout {
                    step: step.name.clone(),
                    timeout,
                },
            );
        }
        match result {
            Ok(output) => StepOutcome::ok(output),
            Err(err) => StepOutcome::failed("", EngineError::step(&step.name, format!("{err:#}"))),
        }
    }

    fn run_script(&self, step: &Step, ctx: &ExecutionContext, timeout: Duration) -> StepOutcome {
        let command = match resolve_script(&self.steps_dir, &step.action) {
            Ok(command) => command,
            Err(err) if err.is_containment_violation() => {
                return StepOutcome::failed("", EngineError::security(&step.name, err.to_string()));
            }
            Err(err) => return StepOutcome::failed("", EngineError::step(&step.name, err.to_string())),
        };
        debug!(script = %command.path.display(), "resolved script");
        self.spawn(step, ctx, command.program, command.args, timeout)
    }

    fn run_shell(&self, step: &Step, ctx: &ExecutionContext, timeout: Duration) -> StepOutcome {
        let words = match split_command(&step.action) {
            Ok(words) => words,
            Err(err) => {
                return StepOutcome::failed(
                    "",
                    EngineError::step(&step.name, format!("cannot parse command: {err}")),
                );
            }
        };
        match words {
            ShellWords::Direct(mut argv) => {
                let program = argv.remove(0);
                self.spawn(step, ctx, program, argv, timeout)
            }
            ShellWords::NeedsShell { operator } => match self.shell_policy {
                ShellPolicy::Interpret => {
                    debug!(operator = %operator, "interpreting command with bash");
                    let args = vec!["-c".to_string(), step.action.clone()];
                    self.spawn(step, ctx, "bash".to_string(), args, timeout)
                }
                ShellPolicy::Direct => StepOutcome::failed(
                    "",
                    EngineError::security(
                        &step.name,
                        format!(
                            "shell operator '{operator}' requires shell_policy = \"interpret\""
                        ),
                    ),
                ),
            },
        }
    }

    fn spawn(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        program: String,
        args: Vec<String>,
        timeout: Duration,
    ) -> StepOutcome {
        let env = build_step_env(self.env_prefix, &ctx.view(), step);
        if !env.rejected.is_empty() {
            warn!(rejected = ?env.rejected, "dropped environment keys that sanitize to nothing");
        }
        let spec = ProcessSpec::new(program, ctx.working_dir(), timeout)
            .args(args)
            .env(env.vars)
            .output_limit(self.output_limit_bytes);

        let output = match run_process(&spec) {
            Ok(output) => output,
            Err(err) => return StepOutcome::failed("", EngineError::step(&step.name, format!("{err:#}"))),
        };
        let text = output.combined();
        if output.timed_out {
            return StepOutcome::failed(
                text,
                EngineError::Timeout {
                    step: step.name.clone(),
                    timeout,
                },
            );
        }
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return StepOutcome::failed(
                text,
                EngineError::step(&step.name, format!("exited with status {code}")),
            );
        }
        StepOutcome::ok(text)
    }
}
