//! Crash recovery.
//!
//! Loops persisted as Running (or mid-rebase) when the process died are
//! rewound to Pending so the next tick re-drives them. Fresh context means
//! nothing is lost: iteration and progress are already checkpointed.
//! Uncommitted worktree edits are preserved with an auto-commit first.
//! A loop whose worktree vanished cannot be resumed and fails.

use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::outcome::failure;
use crate::domain::{Loop, LoopStatus};
use crate::error::Result;
use crate::store::{Filter, Store};
use crate::worktree::WorktreeOps;

/// What recovery did for one loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Rewound to Pending; the scheduler will pick it up
    Requeued { loop_id: String },
    /// Worktree gone; marked Failed(WorktreeLost)
    Lost { loop_id: String },
}

/// Scan for interrupted loops and rewind or fail them.
///
/// Running the scan twice is equivalent to running it once: the first pass
/// leaves no loop in an interrupted status.
pub async fn recover(store: &Arc<Store>, worktrees: &WorktreeOps) -> Result<Vec<RecoveryAction>> {
    let mut interrupted: Vec<Loop> = store.query(&[Filter::eq("status", "running")])?;
    interrupted.extend(store.query::<Loop>(&[Filter::eq("status", "rebasing")])?);

    let mut actions = Vec::new();
    for mut loop_ in interrupted {
        if worktrees.exists(&loop_.id) {
            // Preserve in-flight edits before anything else touches the tree
            match worktrees.is_clean(&loop_.id).await {
                Ok(false) => {
                    if let Err(e) = worktrees.auto_commit(&loop_.id, "WIP: pre-recovery").await {
                        warn!(loop_id = %loop_.id, error = %e, "pre-recovery commit failed");
                    }
                }
                Ok(true) => {}
                Err(e) => warn!(loop_id = %loop_.id, error = %e, "could not inspect worktree"),
            }
            info!(loop_id = %loop_.id, iteration = loop_.iteration, "requeueing interrupted loop");
            loop_.status = LoopStatus::Pending;
            loop_.touch();
            store.update(&loop_)?;
            actions.push(RecoveryAction::Requeued { loop_id: loop_.id });
        } else {
            warn!(loop_id = %loop_.id, "worktree lost; failing loop");
            loop_.status = LoopStatus::Failed;
            loop_.failure_reason = Some(failure::WORKTREE_LOST.to_string());
            loop_.touch();
            store.update(&loop_)?;
            actions.push(RecoveryAction::Lost { loop_id: loop_.id });
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KindConfig, WorktreeConfig};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn template() -> KindConfig {
        KindConfig {
            prompt_path: PathBuf::from("p.md"),
            validation_command: "true".to_string(),
            max_iterations: 5,
        }
    }

    fn fixture() -> (TempDir, Arc<Store>, WorktreeOps) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&tmp.path().join("store")).unwrap());
        let ops = WorktreeOps::new(
            tmp.path().join("worktrees"),
            tmp.path().join("repo"),
            WorktreeConfig::default(),
        );
        (tmp, store, ops)
    }

    #[tokio::test]
    async fn test_running_with_worktree_requeued() {
        let (tmp, store, ops) = fixture();
        let mut loop_ = Loop::new_plan("t", &template());
        loop_.status = LoopStatus::Running;
        loop_.iteration = 1;
        loop_.record_failure(0, "first failure");
        loop_.worktree = tmp.path().join("worktrees").join(&loop_.id);
        store.create(&loop_).unwrap();
        // A bare directory, not a git worktree: is_clean will warn, recovery proceeds
        std::fs::create_dir_all(&loop_.worktree).unwrap();

        let actions = recover(&store, &ops).await.unwrap();
        assert_eq!(
            actions,
            vec![RecoveryAction::Requeued {
                loop_id: loop_.id.clone()
            }]
        );

        let got: Loop = store.get(&loop_.id).unwrap().unwrap();
        assert_eq!(got.status, LoopStatus::Pending);
        // Progress and iteration survive the crash
        assert_eq!(got.iteration, 1);
        assert_eq!(got.failure_section_count(), 1);
    }

    #[tokio::test]
    async fn test_running_without_worktree_fails() {
        let (_tmp, store, ops) = fixture();
        let mut loop_ = Loop::new_plan("t", &template());
        loop_.status = LoopStatus::Running;
        store.create(&loop_).unwrap();

        let actions = recover(&store, &ops).await.unwrap();
        assert_eq!(
            actions,
            vec![RecoveryAction::Lost {
                loop_id: loop_.id.clone()
            }]
        );

        let got: Loop = store.get(&loop_.id).unwrap().unwrap();
        assert_eq!(got.status, LoopStatus::Failed);
        assert_eq!(got.failure_reason.as_deref(), Some(failure::WORKTREE_LOST));
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let (_tmp, store, ops) = fixture();
        let mut loop_ = Loop::new_plan("t", &template());
        loop_.status = LoopStatus::Running;
        store.create(&loop_).unwrap();

        let first = recover(&store, &ops).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = recover(&store, &ops).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_and_pending_untouched() {
        let (_tmp, store, ops) = fixture();
        for status in [LoopStatus::Pending, LoopStatus::Complete, LoopStatus::Failed] {
            let mut loop_ = Loop::new_plan("t", &template());
            loop_.status = status;
            store.create(&loop_).unwrap();
        }
        let actions = recover(&store, &ops).await.unwrap();
        assert!(actions.is_empty());
    }
}
