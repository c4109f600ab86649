//! Git worktree operations.
//!
//! All git interaction goes through the CLI in a subprocess. Branches are
//! named `loop-<id>` and created off the configured main reference.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::WorktreeConfig;
use crate::error::GyreError;

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("failed to create worktree for {loop_id}: {message}")]
    CreateFailed { loop_id: String, message: String },

    #[error("failed to remove worktree for {loop_id}: {message}")]
    RemoveFailed { loop_id: String, message: String },

    #[error("worktree not found for {0}")]
    NotFound(String),

    #[error("rebase conflict in {loop_id}: {files:?}")]
    RebaseConflict { loop_id: String, files: Vec<String> },

    #[error("merge of {loop_id} is not fast-forward")]
    NotFastForward { loop_id: String },

    #[error("insufficient disk space: {available_gb} GB available, floor is {floor_gb} GB")]
    InsufficientSpace { available_gb: u64, floor_gb: u64 },

    #[error("git failed: {0}")]
    Git(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WorktreeError> for GyreError {
    fn from(e: WorktreeError) -> Self {
        match e {
            WorktreeError::InsufficientSpace { available_gb, floor_gb } => {
                GyreError::InsufficientSpace { available_gb, floor_gb }
            }
            other => GyreError::Worktree(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, WorktreeError>;

/// Result of a rebase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    /// Worktree now sits on top of the requested commit
    Clean,
    /// Rebase aborted; these files conflicted
    Conflict(Vec<String>),
}

/// Creates, inspects, rebases, merges, and removes loop worktrees.
#[derive(Debug)]
pub struct WorktreeOps {
    base: PathBuf,
    repo_root: PathBuf,
    config: WorktreeConfig,
}

impl WorktreeOps {
    pub fn new(base: impl Into<PathBuf>, repo_root: impl Into<PathBuf>, config: WorktreeConfig) -> Self {
        Self {
            base: base.into(),
            repo_root: repo_root.into(),
            config,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Worktree directory for a loop.
    pub fn path(&self, loop_id: &str) -> PathBuf {
        self.base.join(loop_id)
    }

    /// Branch name for a loop.
    pub fn branch_name(&self, loop_id: &str) -> String {
        format!("loop-{}", loop_id)
    }

    pub fn exists(&self, loop_id: &str) -> bool {
        self.path(loop_id).exists()
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| WorktreeError::Git(format!("failed to spawn git: {}", e)))?;
        if !output.status.success() {
            return Err(WorktreeError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Free space in whole GB on the volume holding the repository.
    pub fn available_gb(&self) -> Result<u64> {
        let bytes = fs2::available_space(&self.repo_root)?;
        Ok(bytes / (1024 * 1024 * 1024))
    }

    fn check_disk_floor(&self) -> Result<()> {
        let available_gb = self.available_gb()?;
        if available_gb < self.config.disk_floor_gb {
            return Err(WorktreeError::InsufficientSpace {
                available_gb,
                floor_gb: self.config.disk_floor_gb,
            });
        }
        Ok(())
    }

    /// Create a worktree on a fresh `loop-<id>` branch off main.
    pub async fn create(&self, loop_id: &str) -> Result<PathBuf> {
        self.check_disk_floor()?;

        let path = self.path(loop_id);
        let branch = self.branch_name(loop_id);
        std::fs::create_dir_all(&self.base)?;

        let path_str = path.to_string_lossy().to_string();
        self.git(
            &self.repo_root,
            &["worktree", "add", &path_str, "-b", &branch, &self.config.main_ref],
        )
        .await
        .map_err(|e| WorktreeError::CreateFailed {
            loop_id: loop_id.to_string(),
            message: e.to_string(),
        })?;

        debug!(loop_id, path = %path.display(), "worktree created");
        Ok(path)
    }

    /// Remove a worktree, optionally keeping the branch for forensics.
    pub async fn cleanup(&self, loop_id: &str, preserve_branch: bool) -> Result<()> {
        let path = self.path(loop_id);
        if path.exists() {
            let path_str = path.to_string_lossy().to_string();
            self.git(&self.repo_root, &["worktree", "remove", &path_str, "--force"])
                .await
                .map_err(|e| WorktreeError::RemoveFailed {
                    loop_id: loop_id.to_string(),
                    message: e.to_string(),
                })?;
        }

        if !preserve_branch {
            let branch = self.branch_name(loop_id);
            // Branch may already be gone; not fatal
            if let Err(e) = self.git(&self.repo_root, &["branch", "-D", &branch]).await {
                warn!(loop_id, error = %e, "could not delete branch");
            }
        }
        Ok(())
    }

    /// Whether the worktree has no uncommitted changes.
    pub async fn is_clean(&self, loop_id: &str) -> Result<bool> {
        let path = self.path(loop_id);
        if !path.exists() {
            return Err(WorktreeError::NotFound(loop_id.to_string()));
        }
        let status = self.git(&path, &["status", "--porcelain"]).await?;
        Ok(status.is_empty())
    }

    /// Stage and commit everything in the worktree. No-op when clean.
    pub async fn auto_commit(&self, loop_id: &str, message: &str) -> Result<()> {
        if self.is_clean(loop_id).await? {
            return Ok(());
        }
        let path = self.path(loop_id);
        self.git(&path, &["add", "-A"]).await?;
        self.git(&path, &["commit", "-m", message]).await?;
        Ok(())
    }

    /// HEAD commit of a loop's worktree.
    pub async fn head(&self, loop_id: &str) -> Result<String> {
        let path = self.path(loop_id);
        if !path.exists() {
            return Err(WorktreeError::NotFound(loop_id.to_string()));
        }
        self.git(&path, &["rev-parse", "HEAD"]).await
    }

    /// Commit the configured main reference points at.
    pub async fn main_head(&self) -> Result<String> {
        self.git(&self.repo_root, &["rev-parse", &self.config.main_ref]).await
    }

    /// Rebase the loop's branch onto `onto_commit`.
    ///
    /// On conflict the rebase is aborted, leaving the worktree where it was,
    /// and the conflicting files are reported.
    pub async fn rebase(&self, loop_id: &str, onto_commit: &str) -> Result<RebaseOutcome> {
        let path = self.path(loop_id);
        if !path.exists() {
            return Err(WorktreeError::NotFound(loop_id.to_string()));
        }

        match self.git(&path, &["rebase", onto_commit]).await {
            Ok(_) => Ok(RebaseOutcome::Clean),
            Err(_) => {
                let files = self
                    .git(&path, &["diff", "--name-only", "--diff-filter=U"])
                    .await
                    .map(|out| out.lines().map(str::to_string).collect())
                    .unwrap_or_default();
                let _ = self.git(&path, &["rebase", "--abort"]).await;
                Ok(RebaseOutcome::Conflict(files))
            }
        }
    }

    /// Fast-forward main to the loop's branch. Caller holds the merge lock.
    ///
    /// Returns `(pre_head, post_head, files_changed)`.
    pub async fn merge_fast_forward(&self, loop_id: &str) -> Result<(String, String, u32)> {
        let branch = self.branch_name(loop_id);
        let pre = self.main_head().await?;

        self.git(&self.repo_root, &["checkout", &self.config.main_ref]).await?;
        if self
            .git(&self.repo_root, &["merge", "--ff-only", &branch])
            .await
            .is_err()
        {
            return Err(WorktreeError::NotFastForward {
                loop_id: loop_id.to_string(),
            });
        }

        let post = self.main_head().await?;
        let files_changed = if pre == post {
            0
        } else {
            let range = format!("{}..{}", pre, post);
            self.git(&self.repo_root, &["diff", "--name-only", &range])
                .await?
                .lines()
                .filter(|l| !l.is_empty())
                .count() as u32
        };
        Ok((pre, post, files_changed))
    }

    /// Loop ids that still have a directory under the worktree base.
    pub fn list_dirs(&self) -> Result<Vec<String>> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ops_in(tmp: &TempDir) -> WorktreeOps {
        WorktreeOps::new(
            tmp.path().join("worktrees"),
            tmp.path().join("repo"),
            WorktreeConfig::default(),
        )
    }

    #[test]
    fn test_branch_and_path_naming() {
        let tmp = TempDir::new().unwrap();
        let ops = ops_in(&tmp);
        assert_eq!(ops.branch_name("a1b2-001"), "loop-a1b2-001");
        assert!(ops.path("a1b2-001").ends_with("worktrees/a1b2-001"));
    }

    #[test]
    fn test_exists_false_without_dir() {
        let tmp = TempDir::new().unwrap();
        let ops = ops_in(&tmp);
        assert!(!ops.exists("ghost"));
    }

    #[test]
    fn test_list_dirs_empty_base() {
        let tmp = TempDir::new().unwrap();
        let ops = ops_in(&tmp);
        assert!(ops.list_dirs().unwrap().is_empty());
    }

    #[test]
    fn test_list_dirs_sorted() {
        let tmp = TempDir::new().unwrap();
        let ops = ops_in(&tmp);
        std::fs::create_dir_all(ops.path("b")).unwrap();
        std::fs::create_dir_all(ops.path("a")).unwrap();
        assert_eq!(ops.list_dirs().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_is_clean_missing_worktree() {
        let tmp = TempDir::new().unwrap();
        let ops = ops_in(&tmp);
        assert!(matches!(
            ops.is_clean("ghost").await.unwrap_err(),
            WorktreeError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_rebase_missing_worktree() {
        let tmp = TempDir::new().unwrap();
        let ops = ops_in(&tmp);
        assert!(matches!(
            ops.rebase("ghost", "HEAD").await.unwrap_err(),
            WorktreeError::NotFound(_)
        ));
    }

    #[test]
    fn test_insufficient_space_converts() {
        let err: GyreError = WorktreeError::InsufficientSpace {
            available_gb: 0,
            floor_gb: 1,
        }
        .into();
        assert!(matches!(err, GyreError::InsufficientSpace { .. }));
    }
}
