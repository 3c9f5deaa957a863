//! Script resolution inside the permitted steps directory.
//!
//! A script action must resolve to a file that is a descendant of the steps
//! directory both lexically and after symlinks are followed. Either check
//! failing is a containment violation, reported before existence is
//! considered so probing paths outside the directory reveals nothing.

use std::path::{Component, Path, PathBuf};

/// How a resolved script is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    pub program: String,
    pub args: Vec<String>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("script path '{0}' escapes the steps directory")]
    Escape(String),
    #[error("script '{0}' not found in steps directory")]
    NotFound(String),
    #[error("steps directory {} is unavailable: {reason}", .dir.display())]
    StepsDir { dir: PathBuf, reason: String },
}

impl ScriptError {
    pub fn is_containment_violation(&self) -> bool {
        matches!(self, ScriptError::Escape(_))
    }
}

/// Resolve `action` to a contained script and the command that runs it.
pub fn resolve_script(steps_dir: &Path, action: &str) -> Result<ScriptCommand, ScriptError> {
    let relative = Path::new(action.trim());
    if action.trim().is_empty() || relative.is_absolute() {
        return Err(ScriptError::Escape(action.to_string()));
    }
    let Some(normalized) = normalize_relative(relative) else {
        return Err(ScriptError::Escape(action.to_string()));
    };

    let root = steps_dir
        .canonicalize()
        .map_err(|e| ScriptError::StepsDir {
            dir: steps_dir.to_path_buf(),
            reason: e.to_string(),
        })?;
    let candidate = root.join(&normalized);

    // Symlinks are followed only once the lexical check has passed.
    let resolved = match candidate.canonicalize() {
        Ok(path) => path,
        Err(_) => {
            if symlink_points_outside(&candidate, &root) {
                return Err(ScriptError::Escape(action.to_string()));
            }
            return Err(ScriptError::NotFound(action.to_string()));
        }
    };
    if !resolved.starts_with(&root) {
        return Err(ScriptError::Escape(action.to_string()));
    }
    if !resolved.is_file() {
        return Err(ScriptError::NotFound(action.to_string()));
    }

    Ok(command_for(resolved))
}

/// Drop `.` components and fold `..`; `None` when `..` would climb above the root.
fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.into_iter().collect())
}

fn symlink_points_outside(candidate: &Path, root: &Path) -> bool {
    let Ok(target) = std::fs::read_link(candidate) else {
        return false;
    };
    let absolute = match candidate.parent() {
        Some(parent) if !target.is_absolute() => parent.join(&target),
        _ => target,
    };
    match normalize_absolute(&absolute) {
        Some(path) => !path.starts_with(root),
        None => true,
    }
}

fn normalize_absolute(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn command_for(path: PathBuf) -> ScriptCommand {
    let display = path.display().to_string();
    let (program, args) = match path.extension().and_then(|ext| ext.to_str()) {
        Some("py") => ("python3".to_string(), vec![display]),
        Some("sh") => ("bash".to_string(), vec![display]),
        _ => (display, Vec::new()),
    };
    ScriptCommand {
        program,
        args,
        path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn steps_dir() -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let steps = temp.path().join("steps");
        fs::create_dir_all(steps.join("nested")).expect("mkdir");
        fs::write(steps.join("build.sh"), "echo build\n").expect("write");
        fs::write(steps.join("nested").join("report.py"), "print('x')\n").expect("write");
        fs::write(temp.path().join("secret.sh"), "echo secret\n").expect("write");
        (temp, steps)
    }

    #[test]
    fn resolves_contained_scripts_with_interpreter() {
        let (_temp, steps) = steps_dir();
        let cmd = resolve_script(&steps, "build.sh").expect("resolve");
        assert_eq!(cmd.program, "bash");
        assert!(cmd.path.ends_with("steps/build.sh"));

        let py = resolve_script(&steps, "./nested/../nested/report.py").expect("resolve");
        assert_eq!(py.program, "python3");
        assert_eq!(py.args.len(), 1);
    }

    #[test]
    fn rejects_parent_traversal() {
        let (_temp, steps) = steps_dir();
        for action in ["../secret.sh", "../../etc/passwd", "nested/../../secret.sh", ".."] {
            let err = resolve_script(&steps, action).unwrap_err();
            assert!(err.is_containment_violation(), "{action}: {err}");
        }
    }

    #[test]
    fn rejects_absolute_paths() {
        let (temp, steps) = steps_dir();
        let outside = temp.path().join("secret.sh");
        let err = resolve_script(&steps, &outside.display().to_string()).unwrap_err();
        assert!(err.is_containment_violation());
        let err = resolve_script(&steps, "/etc/passwd").unwrap_err();
        assert!(err.is_containment_violation());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escapes() {
        let (temp, steps) = steps_dir();
        std::os::unix::fs::symlink(temp.path().join("secret.sh"), steps.join("link.sh"))
            .expect("symlink");
        std::os::unix::fs::symlink(temp.path(), steps.join("up")).expect("symlink");
        std::os::unix::fs::symlink(temp.path().join("gone.sh"), steps.join("dangling.sh"))
            .expect("symlink");

        for action in ["link.sh", "up/secret.sh", "dangling.sh"] {
            let err = resolve_script(&steps, action).unwrap_err();
            assert!(err.is_containment_violation(), "{action}: {err}");
        }
    }

    #[test]
    fn missing_contained_script_is_not_found() {
        let (_temp, steps) = steps_dir();
        let err = resolve_script(&steps, "absent.sh").unwrap_err();
        assert_eq!(err, ScriptError::NotFound("absent.sh".to_string()));
    }
}
