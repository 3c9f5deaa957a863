//! Action definitions stored as `.prj/actions/<name>.toml`.
//!
//! Files may `extends` another definition. Chains are flattened here so the
//! engine only ever sees a complete [`ActionDefinition`]. Merge policy:
//!
//! - scalars (`description`, `category`, `timeout_secs`, `working_directory`)
//!   from the derived file win when present;
//! - `environment` maps merge, derived keys winning;
//! - step lists append derived steps after the base steps;
//! - `arguments` append, except that an argument redeclared by the derived
//!   file replaces the base declaration in place.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::definition::{
    ActionDefinition, ArgumentSpec, DEFAULT_ACTION_TIMEOUT_SECS, Step, StepKind,
};
use crate::error::EngineError;

/// Supplies fully-resolved definitions by name.
pub trait DefinitionSource: Send + Sync {
    fn load(&self, name: &str) -> Result<ActionDefinition, EngineError>;
    fn list(&self) -> Result<DefinitionListing, EngineError>;
}

/// One entry of [`DefinitionSource::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionSummary {
    pub name: String,
    pub description: String,
    pub category: String,
}

/// Result of [`DefinitionSource::list`]. Files that fail to load are kept
/// apart so one bad file does not hide the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinitionListing {
    pub actions: Vec<DefinitionSummary>,
    pub invalid: Vec<InvalidDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDefinition {
    pub name: String,
    pub error: String,
}

/// [`DefinitionSource`] reading TOML files from one directory.
#[derive(Debug, Clone)]
pub struct TomlDefinitionSource {
    dir: PathBuf,
}

impl TomlDefinitionSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, EngineError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(EngineError::Definition(format!(
                "invalid action name '{name}'"
            )));
        }
        Ok(self.dir.join(format!("{name}.toml")))
    }

    fn read_raw(&self, name: &str) -> Result<RawDefinition, EngineError> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(EngineError::Definition(format!(
                "action '{name}' not found in {}",
                self.dir.display()
            )));
        }
        let contents = fs::read_to_string(&path).map_err(|e| {
            EngineError::Definition(format!("read {}: {e}", path.display()))
        })?;
        parse_raw(&contents)
            .map_err(|e| EngineError::Definition(format!("parse {}: {e}", path.display())))
    }

    /// Resolve `name` and everything it extends, base first.
    fn resolve_raw(&self, name: &str, chain: &mut Vec<String>) -> Result<RawDefinition, EngineError> {
        if chain.iter().any(|seen| seen == name) {
            chain.push(name.to_string());
            return Err(EngineError::Definition(format!(
                "inheritance cycle: {}",
                chain.join(" -> ")
            )));
        }
        chain.push(name.to_string());
        let raw = self.read_raw(name)?;
        match raw.extends.clone() {
            Some(parent) => {
                debug!(action = name, extends = %parent, "resolving base definition");
                let base = self.resolve_raw(&parent, chain)?;
                Ok(merge(base, raw))
            }
            None => Ok(raw),
        }
    }
}

impl DefinitionSource for TomlDefinitionSource {
    #[instrument(skip_all, fields(action = name))]
    fn load(&self, name: &str) -> Result<ActionDefinition, EngineError> {
        let mut chain = Vec::new();
        let raw = self.resolve_raw(name, &mut chain)?;
        let extends = chain.get(1).cloned();
        let definition = raw.into_definition(name, extends)?;
        let problems = definition.validate();
        if !problems.is_empty() {
            return Err(EngineError::Definition(format!(
                "action '{name}' is invalid: {}",
                problems.join("; ")
            )));
        }
        Ok(definition)
    }

    fn list(&self) -> Result<DefinitionListing, EngineError> {
        if !self.dir.is_dir() {
            return Ok(DefinitionListing::default());
        }
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            EngineError::Definition(format!("read {}: {e}", self.dir.display()))
        })?;
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();

        let mut listing = DefinitionListing::default();
        for name in names {
            match self.load(&name) {
                Ok(definition) => listing.actions.push(DefinitionSummary {
                    name: definition.name,
                    description: definition.description,
                    category: definition.category,
                }),
                Err(err) => {
                    warn!(action = %name, err = %err, "skipping invalid definition");
                    listing.invalid.push(InvalidDefinition {
                        name,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(listing)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefinition {
    name: Option<String>,
    description: Option<String>,
    category: Option<String>,
    extends: Option<String>,
    #[serde(default)]
    arguments: Vec<RawArgument>,
    #[serde(default)]
    environment: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pre_steps: Vec<RawStep>,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    post_steps: Vec<RawStep>,
    #[serde(default)]
    cleanup_on_failure: Vec<RawStep>,
    working_directory: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawArgument {
    name: String,
    required: Option<bool>,
    default: Option<toml::Value>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawStep {
    Shorthand(String),
    Table(RawStepTable),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStepTable {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<StepKind>,
    action: String,
    #[serde(default)]
    args: BTreeMap<String, toml::Value>,
    timeout_secs: Option<u64>,
}

fn parse_raw(contents: &str) -> Result<RawDefinition, toml::de::Error> {
    toml::from_str(contents)
}

/// Flatten `derived` onto `base`.
fn merge(base: RawDefinition, derived: RawDefinition) -> RawDefinition {
    let mut environment = base.environment;
    environment.extend(derived.environment);

    let mut arguments = base.arguments;
    for arg in derived.arguments {
        match arguments.iter_mut().find(|a| a.name == arg.name) {
            Some(existing) => *existing = arg,
            None => arguments.push(arg),
        }
    }

    RawDefinition {
        name: derived.name,
        description: derived.description.or(base.description),
        category: derived.category.or(base.category),
        extends: derived.extends,
        arguments,
        environment,
        pre_steps: append(base.pre_steps, derived.pre_steps),
        steps: append(base.steps, derived.steps),
        post_steps: append(base.post_steps, derived.post_steps),
        cleanup_on_failure: append(base.cleanup_on_failure, derived.cleanup_on_failure),
        working_directory: derived.working_directory.or(base.working_directory),
        timeout_secs: derived.timeout_secs.or(base.timeout_secs),
    }
}

fn append<T>(mut base: Vec<T>, derived: Vec<T>) -> Vec<T> {
    base.extend(derived);
    base
}

impl RawDefinition {
    fn into_definition(
        self,
        file_name: &str,
        extends: Option<String>,
    ) -> Result<ActionDefinition, EngineError> {
        let name = self.name.unwrap_or_else(|| file_name.to_string());
        let mut definition = ActionDefinition::new(name);
        if let Some(description) = self.description {
            definition.description = description;
        }
        if let Some(category) = self.category {
            definition.category = category;
        }
        definition.extends = extends;
        definition.timeout_secs = self.timeout_secs.unwrap_or(DEFAULT_ACTION_TIMEOUT_SECS);
        definition.working_directory = self.working_directory;
        definition.environment = self
            .environment
            .into_iter()
            .map(|(key, value)| -> Result<(String, String), EngineError> {
                let text = scalar(&value, || format!("environment.{key}"))?;
                Ok((key, text))
            })
            .collect::<Result<_, _>>()?;
        definition.arguments = self
            .arguments
            .into_iter()
            .map(RawArgument::into_spec)
            .collect::<Result<_, _>>()?;
        definition.pre_steps = convert_steps(self.pre_steps)?;
        definition.steps = convert_steps(self.steps)?;
        definition.post_steps = convert_steps(self.post_steps)?;
        definition.cleanup_on_failure = convert_steps(self.cleanup_on_failure)?;
        Ok(definition)
    }
}

impl RawArgument {
    fn into_spec(self) -> Result<ArgumentSpec, EngineError> {
        let default = match &self.default {
            Some(value) => Some(scalar(value, || format!("argument '{}' default", self.name))?),
            None => None,
        };
        Ok(ArgumentSpec {
            // An argument with a default is optional unless stated otherwise.
            required: self.required.unwrap_or(default.is_none()),
            name: self.name,
            default,
            description: self.description,
        })
    }
}

fn convert_steps(raw: Vec<RawStep>) -> Result<Vec<Step>, EngineError> {
    raw.into_iter()
        .map(|step| match step {
            RawStep::Shorthand(text) => Ok(Step::from_shorthand(&text)),
            RawStep::Table(table) => {
                let kind = table.kind.unwrap_or_default();
                let name = table.name.unwrap_or_else(|| table.action.clone());
                let mut step = Step::new(name, kind, table.action);
                for (key, value) in &table.args {
                    let text = scalar(value, || format!("step '{}' arg '{key}'", step.name))?;
                    step.args.insert(key.clone(), text);
                }
                step.timeout_secs = table.timeout_secs;
                Ok(step)
            }
        })
        .collect()
}

/// Render a TOML scalar as the string exported to steps.
fn scalar(value: &toml::Value, what: impl FnOnce() -> String) -> Result<String, EngineError> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(d) => Ok(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => Err(EngineError::Definition(format!(
            "{} must be a scalar value",
            what()
        ))),
    }
}
