//! Immutable action definition model.
//!
//! Definitions are produced by a [`DefinitionSource`](crate::io::definitions::DefinitionSource)
//! already flattened (no `extends` left to resolve) and are never mutated once
//! a run starts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Command-level timeout applied when a definition does not declare one.
pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 1800;

/// How a step is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// In-process function looked up in the builtin registry.
    #[default]
    Builtin,
    /// Script file under the permitted steps directory.
    Script,
    /// Command text tokenized into an argument vector.
    Shell,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepKind::Builtin => "builtin",
            StepKind::Script => "script",
            StepKind::Shell => "shell",
        };
        f.write_str(label)
    }
}

/// Phase a step belongs to. Phases run in declaration order of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Main,
    Post,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Pre => "pre",
            Phase::Main => "main",
            Phase::Post => "post",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(label)
    }
}

/// A single unit of execution within an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: StepKind,
    /// Builtin identifier, script path relative to the steps directory, or shell text.
    pub action: String,
    /// Step arguments, exported to processes as `<PREFIX>_STEP_<KEY>`.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Per-step timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            action: action.into(),
            args: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    pub fn builtin(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(action.clone(), StepKind::Builtin, action)
    }

    pub fn shell(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, StepKind::Shell, command)
    }

    pub fn script(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, StepKind::Script, path)
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Build a step from its shorthand string form.
    ///
    /// Text with whitespace or shell operators is a shell step, `*.sh` / `*.py`
    /// is a script step, anything else names a builtin.
    pub fn from_shorthand(text: &str) -> Self {
        let text = text.trim();
        let is_shell = text.contains(char::is_whitespace)
            || ["|", "&&", ";", ">", "<", "$"]
                .iter()
                .any(|op| text.contains(op));
        if is_shell {
            Self::shell(text, text)
        } else if text.ends_with(".sh") || text.ends_with(".py") {
            Self::script(text, text)
        } else {
            Self::builtin(text)
        }
    }
}

/// Declared argument accepted by an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_required() -> bool {
    true
}

impl ArgumentSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Option<&str>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: default.map(str::to_string),
            description: None,
        }
    }
}

/// Complete, inheritance-flattened action definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Name of the definition this one was flattened from, kept for display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub pre_steps: Vec<Step>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub post_steps: Vec<Step>,
    #[serde(default)]
    pub cleanup_on_failure: Vec<Step>,
    /// Working directory relative to the project root for runs without a workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_category() -> String {
    "workflow".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_ACTION_TIMEOUT_SECS
}

impl ActionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category: default_category(),
            extends: None,
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            pre_steps: Vec::new(),
            steps: Vec::new(),
            post_steps: Vec::new(),
            cleanup_on_failure: Vec::new(),
            working_directory: None,
            timeout_secs: DEFAULT_ACTION_TIMEOUT_SECS,
        }
    }

    /// Steps of one phase, in declaration order.
    pub fn phase_steps(&self, phase: Phase) -> &[Step] {
        match phase {
            Phase::Pre => &self.pre_steps,
            Phase::Main => &self.steps,
            Phase::Post => &self.post_steps,
            Phase::Cleanup => &self.cleanup_on_failure,
        }
    }

    /// Executable steps (`pre`, `main`, `post`) in run order, paired with their phase.
    pub fn run_steps(&self) -> impl Iterator<Item = (Phase, &Step)> {
        [Phase::Pre, Phase::Main, Phase::Post]
            .into_iter()
            .flat_map(move |phase| self.phase_steps(phase).iter().map(move |s| (phase, s)))
    }

    /// Check structural invariants. Returns every violation found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("action name must not be empty".to_string());
        }

        let mut seen = BTreeSet::new();
        for arg in &self.arguments {
            if arg.name.trim().is_empty() {
                errors.push("argument name must not be empty".to_string());
            }
            if !seen.insert(arg.name.as_str()) {
                errors.push(format!("duplicate argument '{}'", arg.name));
            }
            if arg.required && arg.default.is_some() {
                errors.push(format!(
                    "required argument '{}' must not declare a default",
                    arg.name
                ));
            }
        }

        for phase in [Phase::Pre, Phase::Main, Phase::Post, Phase::Cleanup] {
            for step in self.phase_steps(phase) {
                if step.name.trim().is_empty() {
                    errors.push(format!("{phase} step with empty name"));
                }
                if step.action.trim().is_empty() {
                    errors.push(format!("{phase} step '{}' has an empty action", step.name));
                }
                if step.timeout_secs == Some(0) {
                    errors.push(format!("{phase} step '{}' has a zero timeout", step.name));
                }
            }
        }
        errors
    }
}
