//! Lifecycle state machine for a single run.
//!
//! ```text
//! Created -> Provisioning -> Running -> Completed -> TornDown
//!                 |             |
//!                 +--> Failed <-+----------------> TornDown
//! ```

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Created,
    Provisioning,
    Running,
    Completed,
    Failed,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Created => "created",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Running => "running",
            LifecycleState::Completed => "completed",
            LifecycleState::Failed => "failed",
            LifecycleState::TornDown => "torn-down",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal lifecycle transition {from} -> {to}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

impl LifecycleState {
    pub fn can_transition(self, to: LifecycleState) -> bool {
        use LifecycleState::{Completed, Created, Failed, Provisioning, Running, TornDown};
        matches!(
            (self, to),
            (Created, Provisioning)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, TornDown)
                | (Failed, TornDown)
        )
    }

    pub fn advance(self, to: LifecycleState) -> Result<LifecycleState, TransitionError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::TornDown
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::{Completed, Created, Failed, Provisioning, Running, TornDown};
    use super::*;

    #[test]
    fn happy_path_reaches_torn_down() {
        let state = Created
            .advance(Provisioning)
            .and_then(|s| s.advance(Running))
            .and_then(|s| s.advance(Completed))
            .and_then(|s| s.advance(TornDown))
            .expect("valid path");
        assert!(state.is_terminal());
    }

    #[test]
    fn provisioning_may_fail_directly() {
        assert_eq!(Provisioning.advance(Failed), Ok(Failed));
        assert_eq!(Failed.advance(TornDown), Ok(TornDown));
    }

    #[test]
    fn skipping_teardown_or_reopening_is_rejected() {
        assert!(Created.advance(Running).is_err());
        assert!(Completed.advance(Running).is_err());
        assert!(TornDown.advance(Created).is_err());
        let err = Running.advance(TornDown).unwrap_err();
        assert_eq!(err.to_string(), "illegal lifecycle transition running -> torn-down");
    }
}
