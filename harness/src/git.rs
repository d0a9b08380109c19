//! Thin git runner for the handful of operations the engine needs
//!
//! Locate the repo root, tag HEAD, hard-reset-and-clean to a tag,
//! list/delete tags, and list changed paths. Everything shells out to the
//! `git` binary; the engine never links a VCS library.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{HarnessError, HarnessResult};

/// Git command runner scoped to one working directory.
#[derive(Debug, Clone)]
pub struct GitManager {
    working_dir: PathBuf,
}

impl GitManager {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run a git command and return trimmed stdout.
    fn run(&self, args: &[&str]) -> HarnessResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| HarnessError::git("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::git(args.join(" "), stderr.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether the working directory is inside a git repository.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"]).is_ok()
    }

    /// Repository root (toplevel) for the working directory.
    pub fn repo_root(&self) -> HarnessResult<PathBuf> {
        self.run(&["rev-parse", "--show-toplevel"]).map(PathBuf::from)
    }

    /// Current commit hash (full).
    pub fn current_commit(&self) -> HarnessResult<String> {
        self.run(&["rev-parse", "HEAD"])
    }

    /// Tag HEAD with a lightweight tag.
    pub fn tag(&self, name: &str) -> HarnessResult<()> {
        self.run(&["tag", name])?;
        Ok(())
    }

    /// Commit a tag points at, `None` if the tag does not exist.
    pub fn tag_commit(&self, name: &str) -> HarnessResult<Option<String>> {
        match self.run(&["rev-list", "-n", "1", name]) {
            Ok(commit) => Ok(Some(commit)),
            Err(_) => Ok(None),
        }
    }

    /// List tags matching a prefix.
    pub fn list_tags(&self, prefix: &str) -> HarnessResult<Vec<String>> {
        let pattern = format!("{prefix}*");
        let out = self.run(&["tag", "-l", &pattern])?;
        Ok(out.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Delete a tag.
    pub fn delete_tag(&self, name: &str) -> HarnessResult<()> {
        self.run(&["tag", "-d", name])?;
        Ok(())
    }

    /// Hard reset tracked files to a ref.
    pub fn reset_hard(&self, refspec: &str) -> HarnessResult<()> {
        self.run(&["reset", "--hard", refspec])?;
        Ok(())
    }

    /// Remove untracked files and directories.
    pub fn clean_untracked(&self) -> HarnessResult<()> {
        self.run(&["clean", "-fd"])?;
        Ok(())
    }

    /// Paths with uncommitted changes (staged, unstaged, or untracked).
    pub fn dirty_paths(&self) -> HarnessResult<Vec<String>> {
        let out = self.run(&["status", "--porcelain"])?;
        Ok(out
            .lines()
            .filter_map(|line| {
                // Porcelain format: XY <path> (rename lines carry "a -> b")
                let path = line.get(3..)?.trim();
                let path = path.split(" -> ").last().unwrap_or(path);
                Some(path.trim_matches('"').to_string())
            })
            .collect())
    }

    /// Untracked files only (respecting ignore rules).
    pub fn untracked_files(&self) -> HarnessResult<Vec<String>> {
        let out = self.run(&["ls-files", "--others", "--exclude-standard"])?;
        Ok(out.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Tracked paths modified since a commit (committed or in the tree).
    pub fn changed_since(&self, commit: &str) -> HarnessResult<Vec<String>> {
        let spec = format!("{commit}..HEAD");
        let out = self.run(&["diff", "--name-only", &spec])?;
        Ok(out.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Tracked paths with uncommitted modifications (worktree vs HEAD).
    pub fn uncommitted_changes(&self) -> HarnessResult<Vec<String>> {
        let out = self.run(&["diff", "--name-only", "HEAD"])?;
        Ok(out.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Commit hashes made since a commit, oldest first.
    pub fn commits_since(&self, commit: &str) -> HarnessResult<Vec<String>> {
        let spec = format!("{commit}..HEAD");
        let out = self.run(&["rev-list", "--reverse", &spec])?;
        Ok(out.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Fast local clone into `dest` (hard-links immutable objects).
    pub fn clone_local(&self, dest: &Path) -> HarnessResult<()> {
        let src = self.working_dir.to_string_lossy().to_string();
        let dst = dest.to_string_lossy().to_string();
        self.run(&["clone", "--local", &src, &dst])?;
        Ok(())
    }
}
