//! Append-only audit log for autonomous runs
//!
//! One timestamped JSON line per entry. Logging must never interrupt the
//! run, so every failure is traced and swallowed.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::warn;

/// Append-only log bound to one autonomous run.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Log file for a run id under the audit directory.
    pub fn for_run(audit_dir: &Path, run_id: &str) -> Self {
        Self {
            path: audit_dir.join(format!("{run_id}.log")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Best effort: failures are traced, never returned.
    pub fn append(&self, event: &str, detail: serde_json::Value) {
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "event": event,
            "detail": detail,
        });
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to append audit entry");
        }
    }
}
