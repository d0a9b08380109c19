//! Sandbox manager: run a workflow against an isolated clone
//!
//! A sandbox is a fast local git clone in a temp directory. The run
//! mutates the clone; only the net changes are copied back to the source
//! tree on success. Dependency-install directories are reused from the
//! source via symlink rather than reinstalled.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::git::GitManager;
use crate::session::STATE_DIR_NAME;
use crate::types::SandboxInfo;

/// Dependency-install directories worth reusing via symlink.
const DEP_DIRS: &[&str] = &["node_modules", "target", ".venv"];

/// Manifest → install command, tried only when no dependency dir exists.
const MANIFEST_INSTALLS: &[(&str, &[&str])] = &[
    ("package.json", &["npm", "install"]),
    ("Cargo.toml", &["cargo", "fetch"]),
    ("requirements.txt", &["pip", "install", "-r", "requirements.txt"]),
];

/// What came back from the sandbox, and what was left behind.
#[derive(Debug, Clone, Default)]
pub struct CopyBackReport {
    pub copied: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

pub struct SandboxManager;

impl SandboxManager {
    /// Clone `source_dir` into a fresh temp directory.
    ///
    /// Requires a clean working tree: the copy-back diff is computed
    /// against the clone's starting commit, so uncommitted source changes
    /// would be silently mixed into the result. The error lists the dirty
    /// paths so the caller can report them.
    pub fn create(source_dir: &Path) -> HarnessResult<SandboxInfo> {
        let source_git = GitManager::new(source_dir);
        if !source_git.is_repository() {
            return Err(HarnessError::NotARepository {
                path: source_dir.to_path_buf(),
            });
        }

        let dirty = source_git.dirty_paths()?;
        if !dirty.is_empty() {
            return Err(HarnessError::DirtyWorkingTree { paths: dirty });
        }

        let sandbox_dir = std::env::temp_dir().join(format!(
            "conductor-sandbox-{}",
            &uuid::Uuid::new_v4().to_string()[..8]
        ));
        source_git.clone_local(&sandbox_dir)?;

        Self::link_or_install_deps(source_dir, &sandbox_dir);

        let start_commit = GitManager::new(&sandbox_dir).current_commit()?;
        info!(
            sandbox = %sandbox_dir.display(),
            source = %source_dir.display(),
            %start_commit,
            "sandbox created"
        );

        Ok(SandboxInfo {
            sandbox_dir,
            source_dir: source_dir.to_path_buf(),
            start_commit,
        })
    }

    /// Reuse the source's dependency dir via symlink when present;
    /// otherwise install fresh, but only when a manifest exists.
    fn link_or_install_deps(source_dir: &Path, sandbox_dir: &Path) {
        let mut linked = false;
        for name in DEP_DIRS {
            let src = source_dir.join(name);
            let dst = sandbox_dir.join(name);
            if src.is_dir() && !dst.exists() {
                #[cfg(unix)]
                match std::os::unix::fs::symlink(&src, &dst) {
                    Ok(()) => {
                        debug!(dir = name, "linked dependency directory from source");
                        linked = true;
                    }
                    Err(e) => warn!(dir = name, error = %e, "failed to link dependency directory"),
                }
            }
        }
        if linked {
            return;
        }

        for (manifest, cmd) in MANIFEST_INSTALLS {
            if !sandbox_dir.join(manifest).exists() {
                continue;
            }
            debug!(%manifest, "running dependency install in sandbox");
            let status = std::process::Command::new(cmd[0])
                .args(&cmd[1..])
                .current_dir(sandbox_dir)
                .status();
            match status {
                Ok(s) if s.success() => {}
                Ok(s) => warn!(%manifest, code = s.code(), "dependency install exited non-zero"),
                Err(e) => warn!(%manifest, error = %e, "dependency install failed to start"),
            }
            break;
        }
    }

    /// Copy net changes from the sandbox back into the source tree.
    ///
    /// The change set is the union of (a) paths touched by commits made
    /// since the starting commit, (b) uncommitted tracked modifications,
    /// and (c) new untracked files. Engine bookkeeping under the state
    /// directory never crosses back.
    pub fn copy_back(info: &SandboxInfo) -> HarnessResult<CopyBackReport> {
        let git = GitManager::new(&info.sandbox_dir);

        let mut paths: BTreeSet<String> = BTreeSet::new();
        paths.extend(git.changed_since(&info.start_commit)?);
        paths.extend(git.uncommitted_changes()?);
        paths.extend(git.untracked_files()?);

        let mut report = CopyBackReport::default();
        for path in paths {
            if path.starts_with(STATE_DIR_NAME) {
                report
                    .skipped
                    .push((path, "engine session bookkeeping".into()));
                continue;
            }

            let from = info.sandbox_dir.join(&path);
            if !from.exists() {
                report.skipped.push((path, "removed in sandbox".into()));
                continue;
            }
            if from.is_dir() {
                // Directories materialize through their contained files.
                report.skipped.push((path, "directory entry".into()));
                continue;
            }

            let to = info.source_dir.join(&path);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&from, &to)?;
            report.copied.push(path);
        }

        info!(
            copied = report.copied.len(),
            skipped = report.skipped.len(),
            "sandbox changes copied back"
        );
        Ok(report)
    }

    /// Remove the sandbox directory.
    ///
    /// Dependency symlinks are unlinked first so the recursive delete
    /// cannot follow them into the real source tree. All failures are
    /// logged, never returned.
    pub fn cleanup(sandbox_dir: &Path) {
        for name in DEP_DIRS {
            let link = sandbox_dir.join(name);
            if link.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                if let Err(e) = std::fs::remove_file(&link) {
                    warn!(link = %link.display(), error = %e, "failed to unlink dependency dir");
                }
            }
        }
        if let Err(e) = std::fs::remove_dir_all(sandbox_dir) {
            warn!(dir = %sandbox_dir.display(), error = %e, "failed to remove sandbox dir");
        } else {
            debug!(dir = %sandbox_dir.display(), "sandbox removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{commit_all, setup_git_repo};

    #[test]
    fn test_create_requires_clean_tree() {
        let (dir, _git) = setup_git_repo();
        std::fs::write(dir.path().join("dirty.txt"), "x").unwrap();

        let err = SandboxManager::create(dir.path()).unwrap_err();
        match err {
            HarnessError::DirtyWorkingTree { paths } => {
                assert_eq!(paths, vec!["dirty.txt".to_string()])
            }
            other => panic!("expected DirtyWorkingTree, got {other}"),
        }
    }

    #[test]
    fn test_create_requires_repository() {
        let dir = tempfile::tempdir().unwrap();
        let err = SandboxManager::create(dir.path()).unwrap_err();
        assert!(matches!(err, HarnessError::NotARepository { .. }));
    }

    #[test]
    fn test_round_trip_copies_exactly_the_changes() {
        let (dir, _git) = setup_git_repo();
        let info = SandboxManager::create(dir.path()).unwrap();

        // Committed change, uncommitted change, untracked file
        std::fs::write(info.sandbox_dir.join("committed.rs"), "pub fn a() {}").unwrap();
        commit_all(&info.sandbox_dir, "add committed.rs");
        std::fs::write(info.sandbox_dir.join("README.md"), "# Modified").unwrap();
        std::fs::create_dir_all(info.sandbox_dir.join("src")).unwrap();
        std::fs::write(info.sandbox_dir.join("src/new.rs"), "pub fn b() {}").unwrap();

        // Session bookkeeping must never cross back
        std::fs::create_dir_all(info.sandbox_dir.join(STATE_DIR_NAME).join("sessions")).unwrap();
        std::fs::write(
            info.sandbox_dir.join(STATE_DIR_NAME).join("sessions").join("s.json"),
            "{}",
        )
        .unwrap();

        let report = SandboxManager::copy_back(&info).unwrap();

        let mut copied = report.copied.clone();
        copied.sort();
        assert_eq!(
            copied,
            vec![
                "README.md".to_string(),
                "committed.rs".to_string(),
                "src/new.rs".to_string(),
            ]
        );
        assert!(report
            .skipped
            .iter()
            .any(|(p, _)| p.starts_with(STATE_DIR_NAME)));

        // Byte-identical content in the source tree
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "# Modified"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/new.rs")).unwrap(),
            "pub fn b() {}"
        );
        assert!(!dir.path().join(STATE_DIR_NAME).exists());

        SandboxManager::cleanup(&info.sandbox_dir);
        assert!(!info.sandbox_dir.exists());
    }

    #[test]
    fn test_cleanup_unlinks_deps_before_delete() {
        let (dir, _git) = setup_git_repo();
        // Give the source a dependency dir so create() links it
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        // node_modules is untracked; ignore it so the tree stays clean
        std::fs::write(dir.path().join(".gitignore"), "node_modules/\n").unwrap();
        commit_all(dir.path(), "ignore node_modules");

        let info = SandboxManager::create(dir.path()).unwrap();
        let link = info.sandbox_dir.join("node_modules");
        assert!(link
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false));

        SandboxManager::cleanup(&info.sandbox_dir);
        assert!(!info.sandbox_dir.exists());
        // The real dependency dir in the source must survive
        assert!(dir.path().join("node_modules/pkg/index.js").exists());
    }

    #[test]
    fn test_cleanup_tolerates_missing_dir() {
        // Must log, never panic or error
        SandboxManager::cleanup(Path::new("/nonexistent/conductor-sandbox-xxxx"));
    }
}
