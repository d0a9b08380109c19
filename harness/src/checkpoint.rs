//! Checkpoint manager: idempotent git tags bracketing each phase
//!
//! A checkpoint is a lightweight tag on HEAD whose name is derived
//! deterministically from (session, phase index, phase name). Rollback
//! restores tracked files and removes untracked ones, fully recovering the
//! pre-phase tree.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::HarnessResult;
use crate::git::GitManager;

/// Tag namespace for all engine checkpoints.
const TAG_PREFIX: &str = "conductor";

/// A created (or re-found) checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRef {
    pub tag: String,
    pub commit: String,
}

/// Creates, rolls back, and cleans checkpoint tags for a working directory.
pub struct CheckpointManager {
    git: GitManager,
}

impl CheckpointManager {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            git: GitManager::new(working_dir),
        }
    }

    /// Deterministic tag name for a phase.
    pub fn tag_name(session_id: &str, phase_index: usize, phase_name: &str) -> String {
        let short = &session_id[..8.min(session_id.len())];
        format!("{TAG_PREFIX}/{short}/{phase_index:02}-{}", slug(phase_name))
    }

    /// Tag HEAD for the given phase.
    ///
    /// No-op (returns `None`) when the working directory is not under
    /// version control. Idempotent: a second call with the same inputs
    /// returns the existing tag and its commit without re-tagging.
    pub fn create(
        &self,
        session_id: &str,
        phase_index: usize,
        phase_name: &str,
    ) -> HarnessResult<Option<CheckpointRef>> {
        if !self.git.is_repository() {
            debug!(dir = %self.git.working_dir().display(), "no repository, skipping checkpoint");
            return Ok(None);
        }

        let tag = Self::tag_name(session_id, phase_index, phase_name);
        if let Some(commit) = self.git.tag_commit(&tag)? {
            debug!(%tag, %commit, "checkpoint already exists");
            return Ok(Some(CheckpointRef { tag, commit }));
        }

        let commit = self.git.current_commit()?;
        self.git.tag(&tag)?;
        info!(%tag, %commit, "checkpoint created");
        Ok(Some(CheckpointRef { tag, commit }))
    }

    /// Hard-reset tracked files to the tag and remove untracked files.
    pub fn rollback(&self, tag: &str) -> HarnessResult<()> {
        self.git.reset_hard(tag)?;
        self.git.clean_untracked()?;
        info!(%tag, "rolled back to checkpoint");
        Ok(())
    }

    /// Delete every checkpoint tag belonging to the session.
    ///
    /// Returns the number of tags removed.
    pub fn cleanup(&self, session_id: &str) -> HarnessResult<usize> {
        if !self.git.is_repository() {
            return Ok(0);
        }
        let short = &session_id[..8.min(session_id.len())];
        let prefix = format!("{TAG_PREFIX}/{short}/");
        let tags = self.git.list_tags(&prefix)?;
        let mut removed = 0;
        for tag in &tags {
            match self.git.delete_tag(tag) {
                Ok(()) => removed += 1,
                Err(e) => warn!(%tag, error = %e, "failed to delete checkpoint tag"),
            }
        }
        debug!(session = short, removed, "checkpoint cleanup");
        Ok(removed)
    }
}

/// Lowercase alphanumeric slug with single dashes.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::setup_git_repo;

    #[test]
    fn test_slug() {
        assert_eq!(slug("Generate Tests"), "generate-tests");
        assert_eq!(slug("design_review (v2)"), "design-review-v2");
        assert_eq!(slug("--weird--"), "weird");
    }

    #[test]
    fn test_tag_name_deterministic() {
        let a = CheckpointManager::tag_name("0123456789abcdef", 3, "Generate Tests");
        let b = CheckpointManager::tag_name("0123456789abcdef", 3, "Generate Tests");
        assert_eq!(a, b);
        assert_eq!(a, "conductor/01234567/03-generate-tests");
    }

    #[test]
    fn test_create_is_idempotent() {
        let (_dir, git) = setup_git_repo();
        let mgr = CheckpointManager::new(git.working_dir());

        let first = mgr.create("sess-0001-abcd", 0, "specify").unwrap().unwrap();
        let second = mgr.create("sess-0001-abcd", 0, "specify").unwrap().unwrap();
        assert_eq!(first, second);

        // Only one tag was created
        assert_eq!(git.list_tags("conductor/sess-000/").unwrap().len(), 1);
    }

    #[test]
    fn test_create_outside_repository_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path());
        assert!(mgr.create("abc", 0, "specify").unwrap().is_none());
        assert_eq!(mgr.cleanup("abc").unwrap(), 0);
    }

    #[test]
    fn test_rollback_restores_tree() {
        let (dir, git) = setup_git_repo();
        let mgr = CheckpointManager::new(git.working_dir());

        let ckpt = mgr.create("abcdef12", 1, "implement").unwrap().unwrap();

        // Mutate tracked file, add untracked file, commit another change
        std::fs::write(dir.path().join("README.md"), "mutated").unwrap();
        std::fs::write(dir.path().join("scratch.txt"), "junk").unwrap();
        crate::git::test_support::commit_all(dir.path(), "phase work");

        mgr.rollback(&ckpt.tag).unwrap();

        let readme = std::fs::read_to_string(dir.path().join("README.md")).unwrap();
        assert_eq!(readme, "# Test");
        assert!(!dir.path().join("scratch.txt").exists());
        assert_eq!(git.current_commit().unwrap(), ckpt.commit);
    }

    #[test]
    fn test_cleanup_removes_only_session_tags() {
        let (_dir, git) = setup_git_repo();
        let mgr = CheckpointManager::new(git.working_dir());

        mgr.create("aaaaaaaa-1111", 0, "specify").unwrap();
        mgr.create("aaaaaaaa-1111", 1, "implement").unwrap();
        mgr.create("bbbbbbbb-2222", 0, "specify").unwrap();

        let removed = mgr.cleanup("aaaaaaaa-1111").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(git.list_tags("conductor/bbbbbbbb/").unwrap().len(), 1);
    }
}
