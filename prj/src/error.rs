//! Caller-facing error taxonomy.
//!
//! Only [`EngineError::Definition`] ever escapes [`Engine::execute`](crate::engine::Engine::execute);
//! every other variant is folded into a failed
//! [`ExecutionResult`](crate::core::types::ExecutionResult) at the lifecycle boundary.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Malformed or unresolvable action. No run is attempted.
    #[error("definition error: {0}")]
    Definition(String),

    /// Workspace or session setup failed.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// A step ran and reported failure.
    #[error("step '{step}' failed: {message}")]
    Step { step: String, message: String },

    /// A step or the run exceeded its time budget.
    #[error("step '{step}' timed out after {}s", timeout.as_secs())]
    Timeout { step: String, timeout: Duration },

    /// No builtin is registered under the requested identifier.
    #[error("step '{step}' not found: no builtin named '{action}'")]
    StepNotFound { step: String, action: String },

    /// Path traversal or a disallowed invocation. Handled like a step failure.
    #[error("security violation in step '{step}': {message}")]
    SecurityViolation { step: String, message: String },

    /// Resource removal or cleanup failed. Reported as a warning only.
    #[error("teardown failed: {0}")]
    Teardown(String),
}

impl EngineError {
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Step {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn security(step: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::SecurityViolation {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn is_security_violation(&self) -> bool {
        matches!(self, EngineError::SecurityViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_step() {
        let timeout = EngineError::Timeout {
            step: "build".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(timeout.to_string(), "step 'build' timed out after 30s");

        let violation = EngineError::security("run", "path escapes steps directory");
        assert!(violation.is_security_violation());
        assert_eq!(
            violation.to_string(),
            "security violation in step 'run': path escapes steps directory"
        );
    }
}
