//! Cascade invalidation.
//!
//! When a loop re-iterates, everything spawned from its previous output is
//! stale. The cascade emits a selector Stop for the record, delivers
//! per-loop Stop signals to running descendants (the same per-loop delivery
//! the rebase protocol uses), waits up to a deadline for acknowledgments,
//! then marks every non-terminal descendant Invalidated.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::bus::SignalBus;
use crate::domain::{Loop, SignalKind, SignalRecord};
use crate::error::Result;
use crate::store::{Filter, Store};

/// How often the cascade re-checks acknowledgments while waiting.
const ACK_POLL: Duration = Duration::from_millis(250);

/// What the cascade did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// Ids marked Invalidated, in walk order
    pub invalidated: Vec<String>,
    /// Running descendants that never acknowledged before the deadline
    pub unacknowledged: Vec<String>,
}

/// All descendants of `ancestor_id`, breadth-first.
pub fn find_descendants(store: &Store, ancestor_id: &str) -> Result<Vec<Loop>> {
    let mut out = Vec::new();
    let mut frontier = vec![ancestor_id.to_string()];
    while let Some(current) = frontier.pop() {
        let children: Vec<Loop> = store.query(&[Filter::eq("parent_id", current.as_str())])?;
        for child in children {
            frontier.push(child.id.clone());
            out.push(child);
        }
    }
    Ok(out)
}

/// Invalidate every non-terminal descendant of `ancestor_id`.
///
/// Returns the invalidated ids so the caller can archive worktrees and
/// state directories. Running the cascade twice is a no-op the second time:
/// terminal loops are skipped and signals are only sent to running ones.
pub async fn invalidate_descendants(
    store: &Arc<Store>,
    bus: &SignalBus,
    ancestor_id: &str,
    reason: &str,
    ack_deadline: Duration,
) -> Result<CascadeOutcome> {
    // Record of intent, acknowledged by the cascade itself once done.
    let selector_signal = SignalRecord::new(SignalKind::Stop, reason)
        .from_loop(ancestor_id)
        .to_selector(format!("descendants:{}", ancestor_id));
    let selector_id = selector_signal.id.clone();
    bus.emit(selector_signal)?;

    let descendants = find_descendants(store, ancestor_id)?;

    // Per-loop delivery to the ones actively running
    let mut awaiting: Vec<(String, String)> = Vec::new();
    for descendant in &descendants {
        if descendant.status == crate::domain::LoopStatus::Running {
            let signal = SignalRecord::new(SignalKind::Stop, reason)
                .from_loop(ancestor_id)
                .to_loop(&descendant.id);
            let signal_id = signal.id.clone();
            bus.emit(signal)?;
            awaiting.push((descendant.id.clone(), signal_id));
        }
    }

    // Wait for running descendants to reach a safe point and acknowledge
    let deadline = tokio::time::Instant::now() + ack_deadline;
    let mut unacknowledged = Vec::new();
    while !awaiting.is_empty() {
        awaiting.retain(|(_, signal_id)| {
            match store.get::<SignalRecord>(signal_id) {
                Ok(Some(signal)) => !signal.is_acknowledged(),
                _ => true,
            }
        });
        if awaiting.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            unacknowledged = awaiting.iter().map(|(loop_id, _)| loop_id.clone()).collect();
            warn!(
                ancestor = ancestor_id,
                stragglers = unacknowledged.len(),
                "ack deadline passed, forcing invalidation"
            );
            break;
        }
        tokio::time::sleep(ACK_POLL).await;
    }

    // Re-walk: drivers may have self-invalidated while we waited
    let mut invalidated = Vec::new();
    for descendant in find_descendants(store, ancestor_id)? {
        if descendant.status.is_terminal() {
            continue;
        }
        let mut updated = descendant;
        updated.status = crate::domain::LoopStatus::Invalidated;
        updated.touch();
        store.update(&updated)?;
        debug!(loop_id = %updated.id, "invalidated");
        invalidated.push(updated.id);
    }

    bus.acknowledge(&selector_id)?;
    Ok(CascadeOutcome {
        invalidated,
        unacknowledged,
    })
}
