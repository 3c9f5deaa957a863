//! Validation of supplied run arguments against declared specs.

use std::collections::BTreeMap;

use crate::core::definition::ArgumentSpec;

/// Check `supplied` against `specs` and fill in declared defaults.
///
/// Returns every problem found: missing required arguments and arguments the
/// definition does not declare.
pub fn resolve_arguments(
    specs: &[ArgumentSpec],
    supplied: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, Vec<String>> {
    let mut errors = Vec::new();
    let mut resolved = BTreeMap::new();

    for spec in specs {
        match (supplied.get(&spec.name), &spec.default) {
            (Some(value), _) => {
                resolved.insert(spec.name.clone(), value.clone());
            }
            (None, Some(default)) => {
                resolved.insert(spec.name.clone(), default.clone());
            }
            (None, None) if spec.required => {
                errors.push(format!("required argument '{}' missing", spec.name));
            }
            (None, None) => {}
        }
    }

    for name in supplied.keys() {
        if !specs.iter().any(|spec| &spec.name == name) {
            errors.push(format!("unknown argument '{name}'"));
        }
    }

    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(errors)
    }
}

/// Parse `key=value` pairs as given on the command line.
pub fn parse_assignments<S: AsRef<str>>(pairs: &[S]) -> Result<BTreeMap<String, String>, String> {
    let mut parsed = BTreeMap::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty argument name in '{pair}'"));
        }
        parsed.insert(key.to_string(), value.to_string());
    }
    Ok(parsed)
}
