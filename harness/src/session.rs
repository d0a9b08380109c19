//! Session store: durable state under a hidden per-project directory
//!
//! Layout inside `.conductor/`:
//! - `sessions/<id>.json`: one WorkflowState per run
//! - `queue.json`: the persistent work queue
//! - `worker-status.json`: autonomous worker state, stats, queue snapshot
//! - `worker.lock`: advisory lock file for the single-worker guarantee
//! - `stop`: stop-signal marker checked by the worker loop
//! - `audit/<run>.log`: append-only audit logs
//! - `signals/`: drop-box consumed by the signal-dir work source
//!
//! All writes are whole-file replacements through a temp file and rename.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::queue::DiscoveredWork;
use crate::types::{WorkflowState, WorkflowStatus};

/// Name of the hidden per-project state directory.
pub const STATE_DIR_NAME: &str = ".conductor";

/// Autonomous worker lifecycle state, persisted for `worker status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    Idle,
    Polling,
    Processing,
    Stopped,
}

/// Snapshot written to `worker-status.json` after every loop tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items_discovered: u64,
    pub items_completed: u64,
    pub items_escalated: u64,
    pub items_deferred: u64,
    pub items_failed: u64,
    pub total_spent_usd: f64,
    #[serde(default)]
    pub queue: Vec<DiscoveredWork>,
}

impl WorkerStatus {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            state: WorkerState::Idle,
            started_at: now,
            updated_at: now,
            items_discovered: 0,
            items_completed: 0,
            items_escalated: 0,
            items_deferred: 0,
            items_failed: 0,
            total_spent_usd: 0.0,
            queue: Vec::new(),
        }
    }
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the per-project state directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the state directory under a project root.
    pub fn open(project_root: &Path) -> HarnessResult<Self> {
        let root = project_root.join(STATE_DIR_NAME);
        std::fs::create_dir_all(root.join("sessions"))?;
        std::fs::create_dir_all(root.join("audit"))?;
        std::fs::create_dir_all(root.join("signals"))?;
        Ok(Self { root })
    }

    pub fn state_dir(&self) -> &Path {
        &self.root
    }

    pub fn queue_path(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    pub fn worker_status_path(&self) -> PathBuf {
        self.root.join("worker-status.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("worker.lock")
    }

    pub fn stop_path(&self) -> PathBuf {
        self.root.join("stop")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{session_id}.json"))
    }

    // -- workflow sessions --------------------------------------------------

    /// Persist a run's state (whole-file replace).
    pub fn save(&self, state: &WorkflowState) -> HarnessResult<()> {
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(&self.session_path(&state.session_id), json.as_bytes())?;
        debug!(session = state.short_id(), status = %state.status, "session saved");
        Ok(())
    }

    /// Load a run by exact session id.
    pub fn load(&self, session_id: &str) -> HarnessResult<WorkflowState> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Err(HarnessError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Resolve a (possibly abbreviated) session id to a full state.
    pub fn find(&self, prefix: &str) -> HarnessResult<WorkflowState> {
        let matches: Vec<WorkflowState> = self
            .list()?
            .into_iter()
            .filter(|s| s.session_id.starts_with(prefix))
            .collect();
        match matches.len() {
            0 => Err(HarnessError::SessionNotFound {
                session_id: prefix.to_string(),
            }),
            1 => Ok(matches.into_iter().next().expect("one match")),
            n => Err(HarnessError::AmbiguousSessionId {
                prefix: prefix.to_string(),
                count: n,
            }),
        }
    }

    /// All persisted sessions, newest first. Unreadable files are skipped
    /// with a warning rather than failing the listing.
    pub fn list(&self) -> HarnessResult<Vec<WorkflowState>> {
        let mut sessions = Vec::new();
        let dir = self.root.join("sessions");
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(HarnessError::from)
                .and_then(|json| Ok(serde_json::from_str::<WorkflowState>(&json)?))
            {
                Ok(state) => sessions.push(state),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session file"),
            }
        }
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    /// Most recent non-terminal session, if any.
    pub fn latest_resumable(&self) -> HarnessResult<Option<WorkflowState>> {
        Ok(self.list()?.into_iter().find(|s| s.is_resumable()))
    }

    /// Delete one session file.
    pub fn delete(&self, session_id: &str) -> HarnessResult<()> {
        let path = self.session_path(session_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Remove terminal sessions older than `days`. Failed runs are kept
    /// unless `include_failed` is set. Returns the number removed.
    pub fn cleanup(&self, days: i64, include_failed: bool) -> HarnessResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut removed = 0;
        for state in self.list()? {
            let eligible = match state.status {
                WorkflowStatus::Completed | WorkflowStatus::Cancelled => true,
                WorkflowStatus::Failed => include_failed,
                _ => false,
            };
            let reference = state.completed_at.unwrap_or(state.started_at);
            if eligible && reference < cutoff {
                self.delete(&state.session_id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // -- worker files -------------------------------------------------------

    pub fn write_worker_status(&self, status: &WorkerStatus) -> HarnessResult<()> {
        let json = serde_json::to_string_pretty(status)?;
        atomic_write(&self.worker_status_path(), json.as_bytes())
    }

    pub fn read_worker_status(&self) -> HarnessResult<Option<WorkerStatus>> {
        let path = self.worker_status_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Drop the stop-signal marker the worker loop polls for.
    pub fn request_stop(&self) -> HarnessResult<()> {
        std::fs::write(self.stop_path(), Utc::now().to_rfc3339())?;
        Ok(())
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_path().exists()
    }

    pub fn clear_stop(&self) -> HarnessResult<()> {
        let path = self.stop_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Whole-file replacement: write to a temp sibling, then rename over the
/// target. Readers never observe a half-written file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> HarnessResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentOutput, AgentResult, AgentType};

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = store();
        let mut state = WorkflowState::new("new-feature", "add widget");
        state.transition(WorkflowStatus::Running).unwrap();
        state.record_result(AgentResult {
            agent: AgentType::Specify,
            success: true,
            output: AgentOutput::Raw("spec text".into()),
            files_created: vec![],
            files_modified: vec![],
            commits: vec![],
            cost_usd: 0.75,
            turns_used: 4,
            error: None,
        });

        store.save(&state).unwrap();
        let loaded = store.load(&state.session_id).unwrap();
        assert_eq!(loaded.session_id, state.session_id);
        assert_eq!(loaded.status, WorkflowStatus::Running);
        assert!((loaded.total_cost_usd - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_missing_session() {
        let (_dir, store) = store();
        let err = store.load("does-not-exist").unwrap_err();
        assert!(matches!(err, HarnessError::SessionNotFound { .. }));
    }

    #[test]
    fn test_find_by_prefix() {
        let (_dir, store) = store();
        let state = WorkflowState::new("bug-fix", "x");
        store.save(&state).unwrap();

        let found = store.find(state.short_id()).unwrap();
        assert_eq!(found.session_id, state.session_id);

        assert!(matches!(
            store.find("zzzzzzzz"),
            Err(HarnessError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn test_latest_resumable_skips_terminal() {
        let (_dir, store) = store();

        let mut done = WorkflowState::new("bug-fix", "old");
        done.transition(WorkflowStatus::Running).unwrap();
        done.transition(WorkflowStatus::Completed).unwrap();
        store.save(&done).unwrap();

        assert!(store.latest_resumable().unwrap().is_none());

        let mut waiting = WorkflowState::new("bug-fix", "new");
        waiting.transition(WorkflowStatus::Running).unwrap();
        waiting.transition(WorkflowStatus::AwaitingApproval).unwrap();
        store.save(&waiting).unwrap();

        let resumable = store.latest_resumable().unwrap().unwrap();
        assert_eq!(resumable.session_id, waiting.session_id);
    }

    #[test]
    fn test_cleanup_respects_age_and_failed_flag() {
        let (_dir, store) = store();

        let mut old_done = WorkflowState::new("bug-fix", "old done");
        old_done.transition(WorkflowStatus::Running).unwrap();
        old_done.transition(WorkflowStatus::Completed).unwrap();
        old_done.completed_at = Some(Utc::now() - chrono::Duration::days(30));
        store.save(&old_done).unwrap();

        let mut old_failed = WorkflowState::new("bug-fix", "old failed");
        old_failed.transition(WorkflowStatus::Running).unwrap();
        old_failed.fail(crate::types::PhaseFailure {
            phase: "implement".into(),
            error: "boom".into(),
            recoverable: false,
        });
        old_failed.completed_at = Some(Utc::now() - chrono::Duration::days(30));
        store.save(&old_failed).unwrap();

        let fresh = WorkflowState::new("bug-fix", "fresh");
        store.save(&fresh).unwrap();

        // Without the flag the failed run survives
        assert_eq!(store.cleanup(7, false).unwrap(), 1);
        assert_eq!(store.list().unwrap().len(), 2);

        // With the flag it goes too
        assert_eq!(store.cleanup(7, true).unwrap(), 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_stop_signal() {
        let (_dir, store) = store();
        assert!(!store.stop_requested());
        store.request_stop().unwrap();
        assert!(store.stop_requested());
        store.clear_stop().unwrap();
        assert!(!store.stop_requested());
    }

    #[test]
    fn test_worker_status_round_trip() {
        let (_dir, store) = store();
        assert!(store.read_worker_status().unwrap().is_none());

        let mut status = WorkerStatus::new();
        status.state = WorkerState::Processing;
        status.items_completed = 3;
        status.total_spent_usd = 1.25;
        store.write_worker_status(&status).unwrap();

        let read = store.read_worker_status().unwrap().unwrap();
        assert_eq!(read.state, WorkerState::Processing);
        assert_eq!(read.items_completed, 3);
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.json");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("tmp").exists());
    }
}
