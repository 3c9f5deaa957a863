//! Test-only fakes for the engine's collaborators.
//!
//! Workspace and session fakes append to one shared [`CallLog`] so tests can
//! assert the relative order of provisioning and teardown calls.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::core::definition::ActionDefinition;
use crate::core::types::ExecutionResult;
use crate::engine::{Collaborators, Engine};
use crate::error::EngineError;
use crate::io::artifacts::FsArtifactStore;
use crate::io::config::{EngineConfig, ProjectPaths};
use crate::io::events::{EventStatus, EventStore, NewEvent};
use crate::io::git::WorktreeEntry;
use crate::io::session::{SessionError, SessionInfo, SessionManager};
use crate::io::workspace::{WorkspaceError, WorkspaceManager};

/// Ordered record of collaborator calls shared between fakes.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Entries starting with `prefix`, in call order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Workspace manager that creates plain directories and records every call.
#[derive(Debug)]
pub struct FakeWorkspaces {
    log: CallLog,
    base: PathBuf,
    create_error: Mutex<Option<WorkspaceError>>,
    remove_error: Mutex<Option<WorkspaceError>>,
}

impl FakeWorkspaces {
    pub fn new(log: CallLog, base: impl Into<PathBuf>) -> Self {
        Self {
            log,
            base: base.into(),
            create_error: Mutex::new(None),
            remove_error: Mutex::new(None),
        }
    }

    pub fn fail_create(&self, err: WorkspaceError) {
        *lock(&self.create_error) = Some(err);
    }

    pub fn fail_remove(&self, err: WorkspaceError) {
        *lock(&self.remove_error) = Some(err);
    }
}

impl WorkspaceManager for FakeWorkspaces {
    fn create(&self, branch: &str, base_branch: &str) -> Result<PathBuf, WorkspaceError> {
        self.log.push(format!("workspace.create {branch} {base_branch}"));
        if let Some(err) = lock(&self.create_error).clone() {
            return Err(err);
        }
        let path = self.base.join(branch.replace('/', "-"));
        if path.exists() {
            return Err(WorkspaceError::PathExists(path));
        }
        fs::create_dir_all(&path).map_err(|e| WorkspaceError::Command(e.to_string()))?;
        Ok(path)
    }

    fn remove(&self, path: &Path, force: bool) -> Result<bool, WorkspaceError> {
        self.log.push(format!("workspace.remove {} force={force}", path.display()));
        if let Some(err) = lock(&self.remove_error).clone() {
            return Err(err);
        }
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(path).map_err(|e| WorkspaceError::Command(e.to_string()))?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<WorktreeEntry>, WorkspaceError> {
        self.log.push("workspace.list");
        Ok(Vec::new())
    }
}

/// Session manager that keeps sessions in memory and records every call.
#[derive(Debug)]
pub struct FakeSessions {
    log: CallLog,
    live: Mutex<BTreeMap<String, PathBuf>>,
    create_error: Mutex<Option<SessionError>>,
    kill_error: Mutex<Option<SessionError>>,
}

impl FakeSessions {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            live: Mutex::new(BTreeMap::new()),
            create_error: Mutex::new(None),
            kill_error: Mutex::new(None),
        }
    }

    pub fn fail_create(&self, err: SessionError) {
        *lock(&self.create_error) = Some(err);
    }

    pub fn fail_kill(&self, err: SessionError) {
        *lock(&self.kill_error) = Some(err);
    }

    pub fn live(&self) -> Vec<String> {
        lock(&self.live).keys().cloned().collect()
    }
}

impl SessionManager for FakeSessions {
    fn create(&self, name: &str, working_dir: &Path) -> Result<String, SessionError> {
        self.log.push(format!("session.create {name} {}", working_dir.display()));
        if let Some(err) = lock(&self.create_error).clone() {
            return Err(err);
        }
        let mut live = lock(&self.live);
        if live.contains_key(name) {
            return Err(SessionError::NameCollision(name.to_string()));
        }
        live.insert(name.to_string(), working_dir.to_path_buf());
        Ok(name.to_string())
    }

    fn exists(&self, name: &str) -> Result<bool, SessionError> {
        Ok(lock(&self.live).contains_key(name))
    }

    fn kill(&self, name: &str) -> Result<bool, SessionError> {
        self.log.push(format!("session.kill {name}"));
        if let Some(err) = lock(&self.kill_error).clone() {
            return Err(err);
        }
        Ok(lock(&self.live).remove(name).is_some())
    }

    fn list(&self) -> Result<Vec<SessionInfo>, SessionError> {
        Ok(lock(&self.live)
            .iter()
            .map(|(name, path)| SessionInfo {
                name: name.clone(),
                path: Some(path.display().to_string()),
                attached: false,
            })
            .collect())
    }
}

/// Recorded event transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventCall {
    Started { id: String, command: String, session_id: String },
    Ended { id: String, status: EventStatus, exit_code: i32, error: Option<String> },
}

/// In-memory [`EventStore`].
#[derive(Debug, Default)]
pub struct MemoryEvents {
    calls: Mutex<Vec<EventCall>>,
}

impl MemoryEvents {
    pub fn calls(&self) -> Vec<EventCall> {
        lock(&self.calls).clone()
    }
}

impl EventStore for MemoryEvents {
    fn start_event(&self, event: &NewEvent) -> Result<String> {
        let mut calls = lock(&self.calls);
        let id = format!("event-{}", calls.len() + 1);
        calls.push(EventCall::Started {
            id: id.clone(),
            command: event.command.clone(),
            session_id: event.session_id.clone(),
        });
        Ok(id)
    }

    fn end_event(
        &self,
        event_id: &str,
        status: EventStatus,
        exit_code: i32,
        error: Option<&str>,
    ) -> Result<()> {
        lock(&self.calls).push(EventCall::Ended {
            id: event_id.to_string(),
            status,
            exit_code,
            error: error.map(str::to_string),
        });
        Ok(())
    }
}

/// Scratch project with `.prj/` scaffolding and fake collaborators.
pub struct TestProject {
    _temp: tempfile::TempDir,
    pub root: PathBuf,
    pub paths: ProjectPaths,
    pub log: CallLog,
    pub workspaces: Arc<FakeWorkspaces>,
    pub sessions: Arc<FakeSessions>,
    pub events: Arc<MemoryEvents>,
    pub config: EngineConfig,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let root = temp.path().join("app");
        let paths = ProjectPaths::new(&root);
        for dir in [&paths.actions_dir, &paths.steps_dir] {
            fs::create_dir_all(dir).unwrap_or_else(|e| panic!("create {}: {e}", dir.display()));
        }
        let log = CallLog::default();
        Self {
            workspaces: Arc::new(FakeWorkspaces::new(log.clone(), temp.path().join("worktrees"))),
            sessions: Arc::new(FakeSessions::new(log.clone())),
            events: Arc::new(MemoryEvents::default()),
            config: EngineConfig::default(),
            log,
            paths,
            root,
            _temp: temp,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            workspaces: self.workspaces.clone(),
            sessions: self.sessions.clone(),
            events: self.events.clone(),
            artifacts: Arc::new(FsArtifactStore::new(&self.paths.artifacts_dir)),
        }
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.config.clone(), self.collaborators())
    }

    /// Write an executable step script under `.prj/steps/`.
    pub fn write_step(&self, name: &str, body: &str) -> PathBuf {
        let path = self.paths.steps_dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap_or_else(|e| panic!("create {}: {e}", parent.display()));
        }
        fs::write(&path, body).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
        path
    }

    /// Write `.prj/actions/<name>.toml`.
    pub fn write_action(&self, name: &str, toml: &str) -> PathBuf {
        let path = self.paths.actions_dir.join(format!("{name}.toml"));
        fs::write(&path, toml).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
        path
    }

    /// Execute with `key=value` arguments.
    pub fn run(
        &self,
        definition: &ActionDefinition,
        args: &[(&str, &str)],
    ) -> Result<ExecutionResult, EngineError> {
        let arguments = args
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.engine().execute(definition, &arguments, &self.root)
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
