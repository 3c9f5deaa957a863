//! Environment overlay construction for step processes.
//!
//! Every key that reaches a child environment passes through
//! [`sanitize_env_key`], so argument names cannot smuggle `=` or NUL bytes
//! into the overlay or collide with unrelated variables by case.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::context::ContextView;
use crate::core::definition::Step;

/// Turn an arbitrary key into an environment-safe identifier.
///
/// Uppercases ASCII letters, maps every other character to `_`, collapses
/// runs of `_` and trims them from both ends. Returns `None` when nothing
/// usable remains.
pub fn sanitize_env_key(key: &str) -> Option<String> {
    let mut out = String::with_capacity(key.len());
    for ch in key.chars() {
        let mapped = if ch.is_ascii_alphanumeric() {
            ch.to_ascii_uppercase()
        } else {
            '_'
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        return Some(format!("_{trimmed}"));
    }
    Some(trimmed.to_string())
}

/// Build the ordered overlay exported to a step process.
///
/// Later entries win on collision: definition environment, then context
/// values (`<P>_RUN_ID`, ...), then run arguments (`<P>_ARG_*`), then
/// scalar shared data (`<P>_DATA_*`), then step arguments (`<P>_STEP_*`).
/// Keys that sanitize to nothing are dropped and reported.
pub fn build_step_env(prefix: &str, view: &ContextView<'_>, step: &Step) -> StepEnv {
    let mut env = StepEnv::default();

    for (key, value) in view.environment {
        env.insert(None, key, value.clone());
    }

    env.insert(Some(prefix), "run_id", view.run_id.to_string());
    env.insert(Some(prefix), "command_name", view.command_name.to_string());
    env.insert(
        Some(prefix),
        "project_path",
        view.project_root.display().to_string(),
    );
    env.insert(
        Some(prefix),
        "working_directory",
        view.working_dir.display().to_string(),
    );
    env.insert(
        Some(prefix),
        "artifact_dir",
        view.artifact_dir.display().to_string(),
    );
    if let Some(workspace) = view.workspace {
        env.insert(Some(prefix), "worktree_path", workspace.display().to_string());
    }
    if let Some(session) = view.session {
        env.insert(Some(prefix), "session", session.to_string());
    }

    let arg_prefix = format!("{prefix}_ARG");
    if let Some(Value::Object(args)) = view.shared.get("args") {
        for (key, value) in args {
            if let Some(text) = scalar_text(value) {
                env.insert(Some(&arg_prefix), key, text);
            }
        }
    }

    let data_prefix = format!("{prefix}_DATA");
    let mut shared: Vec<(&String, &Value)> = view.shared.iter().collect();
    shared.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in shared {
        if key == "args" {
            continue;
        }
        if let Some(text) = scalar_text(value) {
            env.insert(Some(&data_prefix), key, text);
        }
    }

    let step_prefix = format!("{prefix}_STEP");
    for (key, value) in &step.args {
        env.insert(Some(&step_prefix), key, value.clone());
    }

    env
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Sanitized environment overlay plus the keys that had to be dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepEnv {
    pub vars: BTreeMap<String, String>,
    pub rejected: Vec<String>,
}

impl StepEnv {
    fn insert(&mut self, prefix: Option<&str>, key: &str, value: String) {
        match sanitize_env_key(key) {
            Some(clean) => {
                let name = match prefix {
                    Some(prefix) => format!("{prefix}_{clean}"),
                    None => clean,
                };
                self.vars.insert(name, value);
            }
            None => self.rejected.push(key.to_string()),
        }
    }
}
