//! On-disk layout for a project's engine state.
//!
//! Each project is keyed by a stable hash of its repository root:
//!
//! ```text
//! <data-root>/<project-hash>/
//!   store/              # append-only logs + index.db
//!   loops/<id>/iterations/NNN/{prompt.txt,transcript.log,validation.log,artifacts/}
//!   loops/<id>/current -> iterations/NNN
//!   archive/<id>/       # invalidated loops
//!   worktrees/<id>/     # git worktrees for active loops
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{GyreError, Result};

/// Stable 16-hex-char hash of a repository root path.
///
/// Canonicalizes first so `/repo` and `/repo/.` key the same project.
pub fn project_hash(repo_root: &Path) -> Result<String> {
    let canonical = repo_root
        .canonicalize()
        .map_err(|e| GyreError::Config(format!("cannot canonicalize {}: {}", repo_root.display(), e)))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    Ok(hex::encode(&digest[..8]))
}

/// Resolved directory layout for one project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    /// `<data-root>/<project-hash>`
    pub root: PathBuf,
}

impl ProjectPaths {
    /// Resolve the layout under an explicit data root.
    pub fn new(data_root: &Path, repo_root: &Path) -> Result<Self> {
        let hash = project_hash(repo_root)?;
        Ok(Self {
            root: data_root.join(hash),
        })
    }

    /// Resolve under the default data root (`~/.local/share/gyre/projects`).
    pub fn for_repo(repo_root: &Path) -> Result<Self> {
        let data_root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gyre")
            .join("projects");
        Self::new(&data_root, repo_root)
    }

    /// Directory holding the record logs and index.
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    /// Per-loop state directory.
    pub fn loop_dir(&self, loop_id: &str) -> PathBuf {
        self.root.join("loops").join(loop_id)
    }

    /// Directory for one iteration's working files.
    pub fn iteration_dir(&self, loop_id: &str, iteration: u32) -> PathBuf {
        self.loop_dir(loop_id)
            .join("iterations")
            .join(format!("{:03}", iteration))
    }

    /// Latest structured descriptor emitted by a loop.
    pub fn descriptor_path(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("descriptor.json")
    }

    /// Archive prefix where invalidated loops are moved.
    pub fn archive_root(&self) -> PathBuf {
        self.root.join("archive")
    }

    /// Archive directory for one loop.
    pub fn archive_dir(&self, loop_id: &str) -> PathBuf {
        self.archive_root().join(loop_id)
    }

    /// Base directory for git worktrees.
    pub fn worktree_base(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    /// Log file for the daemon.
    pub fn log_file(&self) -> PathBuf {
        self.root.join("gyre.log")
    }

    /// Create the iteration directory (with `artifacts/`) and repoint the
    /// `current` symlink at it.
    pub fn prepare_iteration(&self, loop_id: &str, iteration: u32) -> Result<PathBuf> {
        let dir = self.iteration_dir(loop_id, iteration);
        fs::create_dir_all(dir.join("artifacts"))?;

        let current = self.loop_dir(loop_id).join("current");
        let target = PathBuf::from("iterations").join(format!("{:03}", iteration));
        if current.symlink_metadata().is_ok() {
            fs::remove_file(&current)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &current)?;
        Ok(dir)
    }

    /// Move an invalidated loop's state directory under the archive prefix.
    ///
    /// Missing source is fine: the loop may never have run.
    pub fn archive_loop(&self, loop_id: &str) -> Result<()> {
        let src = self.loop_dir(loop_id);
        if !src.exists() {
            return Ok(());
        }
        let dst = self.archive_dir(loop_id);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        if dst.exists() {
            fs::remove_dir_all(&dst)?;
        }
        fs::rename(&src, &dst)?;
        Ok(())
    }

    /// Ensure the top-level directories exist.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.store_dir())?;
        fs::create_dir_all(self.root.join("loops"))?;
        fs::create_dir_all(self.root.join("archive"))?;
        fs::create_dir_all(self.worktree_base())?;
        Ok(())
    }
}
