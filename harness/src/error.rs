//! Harness error types
//!
//! Structured errors for checkpoint, sandbox, session, queue, and lock
//! operations. Component-level failures are converted into these typed
//! errors so callers can distinguish transient from permanent conditions.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that can occur during harness operations
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Git operation failed
    #[error("git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Working directory is not under version control
    #[error("not a git repository: {path}")]
    NotARepository { path: PathBuf },

    /// Working tree has uncommitted changes where a clean tree is required
    #[error("working tree is dirty ({} paths): {}", .paths.len(), .paths.join(", "))]
    DirtyWorkingTree { paths: Vec<String> },

    /// Sandbox setup or teardown failed
    #[error("sandbox error: {message}")]
    Sandbox { message: String },

    /// Session persistence failed
    #[error("session error: {message}")]
    Session { message: String },

    /// Requested session does not exist
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Ambiguous short session id
    #[error("session id prefix `{prefix}` matches {count} sessions")]
    AmbiguousSessionId { prefix: String, count: usize },

    /// Work item with this id is already queued
    #[error("duplicate work item: {id}")]
    DuplicateWorkItem { id: String },

    /// Queue is full and nothing is eligible for eviction
    #[error("work queue full ({capacity} items) and no pending item to evict")]
    QueueFull { capacity: usize },

    /// Another worker already holds the lock
    #[error("worker lock at {} held by pid {}", .path.display(), .pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into()))]
    LockHeld { path: PathBuf, pid: Option<u32> },

    /// Invalid workflow state transition
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a sandbox error
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox {
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Check if this error is retryable (transient failure)
    pub fn is_retryable(&self) -> bool {
        match self {
            // Git operations that might succeed on retry
            Self::Git { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("connection")
                    || lower.contains("another git process")
            }
            // IO errors that might be transient
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarnessError::git("tag", "nothing to tag");
        assert!(err.to_string().contains("tag"));
        assert!(err.to_string().contains("nothing to tag"));

        let err = HarnessError::DirtyWorkingTree {
            paths: vec!["src/a.rs".into(), "src/b.rs".into()],
        };
        assert!(err.to_string().contains("2 paths"));
        assert!(err.to_string().contains("src/a.rs"));
    }

    #[test]
    fn test_is_retryable() {
        let err = HarnessError::git("tag", "unable to create lock file");
        assert!(err.is_retryable());

        let err = HarnessError::git("tag", "tag already exists");
        assert!(!err.is_retryable());

        let io_err = std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted");
        let err: HarnessError = io_err.into();
        assert!(err.is_retryable());

        let err = HarnessError::SessionNotFound {
            session_id: "abc".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: HarnessError = io_err.into();
        assert!(matches!(err, HarnessError::Io(_)));
    }
}
