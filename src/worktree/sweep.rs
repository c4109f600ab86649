//! Background sweep.
//!
//! Removes orphaned worktrees (no loop record, or a terminal one), deletes
//! acknowledged signals past retention, and prunes archived loop state past
//! retention. Failures are warned and retried on the next pass.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::ops::WorktreeOps;
use crate::domain::{Loop, LoopStatus, SignalRecord};
use crate::error::Result;
use crate::id::now_ms;
use crate::paths::ProjectPaths;
use crate::store::{Filter, Store};

/// What one sweep pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub worktrees_removed: Vec<String>,
    pub signals_deleted: usize,
    pub archives_deleted: usize,
}

/// One sweep pass.
pub async fn sweep(
    store: &Arc<Store>,
    ops: &WorktreeOps,
    paths: &ProjectPaths,
    retention: Duration,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    // Orphaned worktrees: directory present but loop gone or terminal
    for loop_id in ops.list_dirs()? {
        let record: Option<Loop> = store.get(&loop_id)?;
        let (remove, preserve_branch) = match &record {
            None => (true, false),
            Some(l) if l.status.is_terminal() => (true, l.status == LoopStatus::Failed),
            Some(_) => (false, false),
        };
        if remove {
            match ops.cleanup(&loop_id, preserve_branch).await {
                Ok(()) => {
                    debug!(loop_id = %loop_id, "swept orphan worktree");
                    report.worktrees_removed.push(loop_id);
                }
                Err(e) => warn!(loop_id = %loop_id, error = %e, "orphan cleanup failed, will retry"),
            }
        }
    }

    // Acknowledged signals past retention
    let cutoff = now_ms() - retention.as_millis() as i64;
    let stale: Vec<SignalRecord> = store.query(&[
        Filter::not_null("acknowledged_at"),
        Filter::lt("acknowledged_at", cutoff),
    ])?;
    for signal in stale {
        if store.delete::<SignalRecord>(&signal.id).is_ok() {
            report.signals_deleted += 1;
        }
    }

    // Archived loop state past retention (by directory mtime)
    let archive_root = paths.archive_root();
    if archive_root.exists() {
        for entry in std::fs::read_dir(&archive_root)? {
            let entry = entry?;
            let age_ok = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .map(|elapsed| elapsed > retention)
                .unwrap_or(false);
            if age_ok {
                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => report.archives_deleted += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "archive prune failed"),
                }
            }
        }
    }

    Ok(report)
}
