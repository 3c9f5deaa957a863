//! One-time strategy classification for an action definition.

use crate::core::definition::ActionDefinition;
use crate::core::types::Strategy;

/// Step identifiers that require a worktree.
pub const WORKSPACE_MARKERS: &[&str] = &["create-worktree", "start-worktree-session"];
/// Step identifiers that require a terminal session.
pub const SESSION_MARKERS: &[&str] = &["start-session", "session-create"];

const WORKSPACE_NAME_HINTS: &[&str] = &["worktree", "feature-branch"];
const SESSION_NAME_HINTS: &[&str] = &["session"];

/// Select the provisioning strategy for `definition`.
///
/// Looks at the action and name of every `pre`/`main`/`post` step, then at the
/// definition name. A workspace always implies a session. Cleanup steps are not
/// consulted.
pub fn select_strategy(definition: &ActionDefinition) -> Strategy {
    let identifiers: Vec<&str> = definition
        .run_steps()
        .flat_map(|(_, step)| [step.action.as_str(), step.name.as_str()])
        .collect();
    let name = definition.name.to_lowercase();

    let needs_workspace = identifiers.iter().any(|id| WORKSPACE_MARKERS.contains(id))
        || WORKSPACE_NAME_HINTS.iter().any(|hint| name.contains(hint));
    let needs_session = needs_workspace
        || identifiers.iter().any(|id| SESSION_MARKERS.contains(id))
        || SESSION_NAME_HINTS.iter().any(|hint| name.contains(hint));

    if needs_workspace {
        Strategy::WorkspaceSession
    } else if needs_session {
        Strategy::Session
    } else {
        Strategy::Bare
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::definition::Step;

    fn definition(name: &str, steps: Vec<Step>) -> ActionDefinition {
        let mut def = ActionDefinition::new(name);
        def.steps = steps;
        def
    }

    #[test]
    fn plain_steps_are_bare() {
        let def = definition("lint", vec![Step::shell("check", "cargo check")]);
        assert_eq!(select_strategy(&def), Strategy::Bare);
    }

    #[test]
    fn session_marker_selects_session() {
        let def = definition("review", vec![Step::builtin("start-session")]);
        assert_eq!(select_strategy(&def), Strategy::Session);
    }

    #[test]
    fn workspace_marker_in_pre_steps_selects_workspace() {
        let mut def = definition("build", Vec::new());
        def.pre_steps.push(Step::builtin("create-worktree"));
        assert_eq!(select_strategy(&def), Strategy::WorkspaceSession);
    }

    #[test]
    fn marker_in_step_name_counts() {
        let def = definition(
            "build",
            vec![Step::shell("session-create", "echo starting")],
        );
        assert_eq!(select_strategy(&def), Strategy::Session);
    }

    #[test]
    fn name_hints_select_strategy() {
        assert_eq!(
            select_strategy(&definition("Feature-Branch", Vec::new())),
            Strategy::WorkspaceSession
        );
        assert_eq!(
            select_strategy(&definition("pair-session", Vec::new())),
            Strategy::Session
        );
    }

    #[test]
    fn cleanup_markers_are_ignored() {
        let mut def = definition("lint", vec![Step::builtin("echo")]);
        def.cleanup_on_failure.push(Step::builtin("create-worktree"));
        assert_eq!(select_strategy(&def), Strategy::Bare);
    }
}
