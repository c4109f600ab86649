//! Merge serialization: FIFO tickets over real git fast-forwards.

mod common;

use std::sync::Arc;
use std::time::Duration;

use gyre::config::WorktreeConfig;
use gyre::domain::MergeRecord;
use gyre::store::Store;
use gyre::worktree::{MergeQueue, RebaseOutcome, WorktreeOps};
use tempfile::TempDir;

use common::{git, init_repo};

/// Concurrent merge requests settle in ticket order, each fast-forwarding
/// from the previous head, with records appended in the same order.
#[tokio::test(flavor = "multi_thread")]
async fn test_merge_records_append_in_ticket_order() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    init_repo(&repo);

    let store = Arc::new(Store::open(&tmp.path().join("store")).unwrap());
    let ops = Arc::new(WorktreeOps::new(
        tmp.path().join("worktrees"),
        &repo,
        WorktreeConfig::default(),
    ));
    let queue = Arc::new(MergeQueue::new(&repo));

    // Three loops, each with a distinct committed change
    let ids = ["alpha", "bravo", "charlie"];
    for id in ids {
        let path = ops.create(id).await.unwrap();
        std::fs::write(path.join(format!("{}.txt", id)), id).unwrap();
        git(&path, &["add", "-A"]);
        git(&path, &["commit", "-m", id]);
    }

    // Tickets in a fixed order, acquirers racing in reverse
    let tickets: Vec<_> = ids.iter().map(|id| queue.request_merge(id)).collect();
    let mut handles = Vec::new();
    for ticket in tickets.into_iter().rev() {
        let queue = queue.clone();
        let ops = ops.clone();
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let _guard = queue.acquire(&ticket).await.unwrap();
            // Later tickets are no longer fast-forward; rebase first
            let (pre, post, files) = match ops.merge_fast_forward(&ticket.loop_id).await {
                Ok(result) => result,
                Err(_) => {
                    let main = ops.main_head().await.unwrap();
                    assert_eq!(
                        ops.rebase(&ticket.loop_id, &main).await.unwrap(),
                        RebaseOutcome::Clean
                    );
                    ops.merge_fast_forward(&ticket.loop_id).await.unwrap()
                }
            };
            store.create(&MergeRecord::new(&ticket.loop_id, &pre, &post, files)).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let records: Vec<MergeRecord> = store.list().unwrap();
    assert_eq!(records.len(), 3);
    let order: Vec<&str> = records.iter().map(|r| r.loop_id.as_str()).collect();
    assert_eq!(order, ids);

    // Heads chain: each merge starts where the previous one ended
    for pair in records.windows(2) {
        assert_eq!(pair[1].pre_merge_head, pair[0].post_merge_head);
    }

    // Every change landed
    for id in ids {
        assert!(repo.join(format!("{}.txt", id)).exists());
    }
}

/// A dirty worktree auto-commits, then rebases cleanly onto new work.
#[tokio::test(flavor = "multi_thread")]
async fn test_auto_commit_and_rebase() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    init_repo(&repo);

    let ops = WorktreeOps::new(tmp.path().join("worktrees"), &repo, WorktreeConfig::default());

    let a = ops.create("a").await.unwrap();
    let b = ops.create("b").await.unwrap();

    // a commits and merges to main
    std::fs::write(a.join("a.txt"), "from a").unwrap();
    assert!(!ops.is_clean("a").await.unwrap());
    ops.auto_commit("a", "a change").await.unwrap();
    assert!(ops.is_clean("a").await.unwrap());
    let (_, post, files) = ops.merge_fast_forward("a").await.unwrap();
    assert_eq!(files, 1);

    // b has uncommitted work, preserves it, rebases onto the new head
    std::fs::write(b.join("b.txt"), "from b").unwrap();
    ops.auto_commit("b", "WIP: pre-rebase").await.unwrap();
    assert_eq!(ops.rebase("b", &post).await.unwrap(), RebaseOutcome::Clean);

    // Both changes visible in b after the rebase
    assert!(b.join("a.txt").exists());
    assert!(b.join("b.txt").exists());
}

/// Conflicting rebases abort, report the files, and leave the worktree
/// usable.
#[tokio::test(flavor = "multi_thread")]
async fn test_rebase_conflict_reported() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    init_repo(&repo);

    let ops = WorktreeOps::new(tmp.path().join("worktrees"), &repo, WorktreeConfig::default());

    let a = ops.create("a").await.unwrap();
    let b = ops.create("b").await.unwrap();

    // Both edit the same file
    std::fs::write(a.join("README.md"), "version a\n").unwrap();
    ops.auto_commit("a", "a edit").await.unwrap();
    let (_, post, _) = ops.merge_fast_forward("a").await.unwrap();

    std::fs::write(b.join("README.md"), "version b\n").unwrap();
    ops.auto_commit("b", "b edit").await.unwrap();

    match ops.rebase("b", &post).await.unwrap() {
        RebaseOutcome::Conflict(files) => {
            assert!(files.iter().any(|f| f.contains("README")));
        }
        RebaseOutcome::Clean => panic!("expected a conflict"),
    }
    // Aborted rebase leaves b on its own commit
    assert_eq!(std::fs::read_to_string(b.join("README.md")).unwrap(), "version b\n");
}
