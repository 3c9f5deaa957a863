//! Event tracking for runs (`.prj/events.jsonl`).
//!
//! The log is append-only: a `started` record when a run begins and an
//! `ended` record when it terminates. Readers fold the two into one summary.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fields recorded when a run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub command: String,
    pub project_path: PathBuf,
    pub session_id: String,
    pub artifacts_path: PathBuf,
    pub worktree_name: Option<String>,
}

/// Terminal status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Run-level event tracking shared across concurrent runs.
///
/// Implementations must serialize their own writes.
pub trait EventStore: Send + Sync {
    fn start_event(&self, event: &NewEvent) -> Result<String>;
    fn end_event(
        &self,
        event_id: &str,
        status: EventStatus,
        exit_code: i32,
        error: Option<&str>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum EventRecord {
    Started {
        id: String,
        command: String,
        project_path: PathBuf,
        session_id: String,
        artifacts_path: PathBuf,
        worktree_name: Option<String>,
        at: DateTime<Utc>,
    },
    Ended {
        id: String,
        status: EventStatus,
        exit_code: i32,
        error: Option<String>,
        at: DateTime<Utc>,
    },
}

/// Latest known state of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub id: String,
    pub command: String,
    pub project_path: PathBuf,
    pub session_id: String,
    pub artifacts_path: PathBuf,
    pub worktree_name: Option<String>,
    pub status: EventStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// [`EventStore`] appending JSON lines to a file.
#[derive(Debug)]
pub struct JsonlEventStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &EventRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize event")?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        // One write per record keeps concurrent appenders from interleaving lines.
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))?;
        Ok(())
    }

    /// Most recent events first, at most `limit`.
    pub fn recent(&self, limit: usize) -> Result<Vec<EventSummary>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let mut order = Vec::new();
        let mut events: HashMap<String, EventSummary> = HashMap::new();

        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(line = lineno + 1, err = %err, "skipping malformed event record");
                    continue;
                }
            };
            match record {
                EventRecord::Started {
                    id,
                    command,
                    project_path,
                    session_id,
                    artifacts_path,
                    worktree_name,
                    at,
                } => {
                    order.push(id.clone());
                    events.insert(
                        id.clone(),
                        EventSummary {
                            id,
                            command,
                            project_path,
                            session_id,
                            artifacts_path,
                            worktree_name,
                            status: EventStatus::Running,
                            exit_code: None,
                            error: None,
                            start_time: at,
                            end_time: None,
                        },
                    );
                }
                EventRecord::Ended {
                    id,
                    status,
                    exit_code,
                    error,
                    at,
                } => {
                    if let Some(summary) = events.get_mut(&id) {
                        summary.status = status;
                        summary.exit_code = Some(exit_code);
                        summary.error = error;
                        summary.end_time = Some(at);
                    }
                }
            }
        }

        Ok(order
            .iter()
            .rev()
            .filter_map(|id| events.remove(id))
            .take(limit)
            .collect())
    }
}

impl EventStore for JsonlEventStore {
    fn start_event(&self, event: &NewEvent) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.append(&EventRecord::Started {
            id: id.clone(),
            command: event.command.clone(),
            project_path: event.project_path.clone(),
            session_id: event.session_id.clone(),
            artifacts_path: event.artifacts_path.clone(),
            worktree_name: event.worktree_name.clone(),
            at: Utc::now(),
        })?;
        debug!(event_id = %id, command = %event.command, "event started");
        Ok(id)
    }

    fn end_event(
        &self,
        event_id: &str,
        status: EventStatus,
        exit_code: i32,
        error: Option<&str>,
    ) -> Result<()> {
        self.append(&EventRecord::Ended {
            id: event_id.to_string(),
            status,
            exit_code,
            error: error.map(str::to_string),
            at: Utc::now(),
        })?;
        debug!(event_id, ?status, "event ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(command: &str) -> NewEvent {
        NewEvent {
            command: command.to_string(),
            project_path: PathBuf::from("/p"),
            session_id: format!("{command}-run"),
            artifacts_path: PathBuf::from("/p/.prj/artifacts"),
            worktree_name: None,
        }
    }

    #[test]
    fn recent_folds_start_and_end_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonlEventStore::new(temp.path().join("events.jsonl"));

        let first = store.start_event(&new_event("build")).expect("start");
        let second = store.start_event(&new_event("deploy")).expect("start");
        store
            .end_event(&first, EventStatus::Failed, 1, Some("step 'x' failed"))
            .expect("end");

        let events = store.recent(10).expect("recent");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, second);
        assert_eq!(events[0].status, EventStatus::Running);
        assert_eq!(events[1].id, first);
        assert_eq!(events[1].status, EventStatus::Failed);
        assert_eq!(events[1].exit_code, Some(1));
        assert_eq!(events[1].error.as_deref(), Some("step 'x' failed"));
        assert!(events[1].end_time.is_some());
    }

    #[test]
    fn recent_respects_limit_and_skips_garbage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let store = JsonlEventStore::new(&path);
        store.start_event(&new_event("a")).expect("start");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"not json\n").expect("write");
        store.start_event(&new_event("b")).expect("start");

        let events = store.recent(1).expect("recent");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "b");
    }

    #[test]
    fn missing_log_has_no_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonlEventStore::new(temp.path().join("none.jsonl"));
        assert!(store.recent(5).expect("recent").is_empty());
    }

    #[test]
    fn concurrent_appends_stay_line_delimited() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = std::sync::Arc::new(JsonlEventStore::new(temp.path().join("events.jsonl")));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let id = store.start_event(&new_event(&format!("cmd-{i}"))).expect("start");
                    store
                        .end_event(&id, EventStatus::Completed, 0, None)
                        .expect("end");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let events = store.recent(100).expect("recent");
        assert_eq!(events.len(), 8);
        assert!(events.iter().all(|e| e.status == EventStatus::Completed));
    }
}
