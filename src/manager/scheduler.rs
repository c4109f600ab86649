//! Selection and ranking.
//!
//! `priority = base[kind] + age_boost + depth_boost - retry_penalty`, ties
//! broken FIFO by creation time. A global rate-limit gate suppresses new
//! starts while the API backs us off; running loops are unaffected.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::domain::{Loop, LoopKind, LoopStatus};
use crate::error::Result;
use crate::id::now_ms;
use crate::llm::{CompletionRequest, CompletionResponse, LlmError, LlmGateway, StreamEvent};
use crate::store::{Filter, Store};

/// Base priorities: leaves first.
fn base_priority(kind: LoopKind) -> i32 {
    match kind {
        LoopKind::Plan => 40,
        LoopKind::Spec => 60,
        LoopKind::Phase => 80,
        LoopKind::Code => 100,
    }
}

const AGE_BOOST_MAX: i32 = 50;
const DEPTH_BOOST_PER_LEVEL: i32 = 10;
const RETRY_PENALTY_PER_ITERATION: i32 = 5;
const RETRY_PENALTY_MAX: i32 = 30;

/// Depth from the root plan, via parent-chain walk.
pub fn loop_depth(store: &Store, loop_: &Loop) -> i32 {
    let mut depth = 0;
    let mut current = loop_.parent_id.clone();
    while let Some(parent_id) = current {
        depth += 1;
        if depth >= 64 {
            break;
        }
        match store.get::<Loop>(&parent_id) {
            Ok(Some(parent)) => current = parent.parent_id,
            _ => break,
        }
    }
    depth
}

/// Scheduling priority; higher runs first.
pub fn priority(store: &Store, loop_: &Loop) -> i32 {
    let mut score = base_priority(loop_.kind);

    let age_minutes = ((now_ms() - loop_.created_at) / 60_000) as i32;
    score += age_minutes.clamp(0, AGE_BOOST_MAX);

    score += loop_depth(store, loop_) * DEPTH_BOOST_PER_LEVEL;

    if loop_.iteration >= 1 {
        let penalty = (loop_.iteration as i32 - 1) * RETRY_PENALTY_PER_ITERATION;
        score -= penalty.min(RETRY_PENALTY_MAX);
    }
    score
}

/// Whether a pending loop may start now.
pub fn runnable(store: &Store, loop_: &Loop) -> bool {
    if loop_.status != LoopStatus::Pending {
        return false;
    }
    if let Some(parent_id) = &loop_.parent_id {
        match store.get::<Loop>(parent_id) {
            Ok(Some(parent)) if parent.status == LoopStatus::Complete => {}
            _ => return false,
        }
    }
    if let Some(artifact) = &loop_.input_artifact {
        if !artifact.exists() {
            return false;
        }
    }
    true
}

/// Rank runnable pending loops and take up to `slots`, respecting optional
/// per-kind caps given the counts already running.
pub fn select(
    store: &Store,
    slots: usize,
    kind_cap: impl Fn(LoopKind) -> Option<usize>,
    running_per_kind: impl Fn(LoopKind) -> usize,
) -> Result<Vec<Loop>> {
    if slots == 0 {
        return Ok(Vec::new());
    }
    let pending: Vec<Loop> = store.query(&[Filter::eq("status", "pending")])?;
    let mut candidates: Vec<(i32, Loop)> = pending
        .into_iter()
        .filter(|l| runnable(store, l))
        .map(|l| (priority(store, &l), l))
        .collect();
    // Priority descending, FIFO within a score
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.created_at.cmp(&b.1.created_at)));

    let mut selected: Vec<Loop> = Vec::new();
    for (_, loop_) in candidates {
        if selected.len() >= slots {
            break;
        }
        if let Some(cap) = kind_cap(loop_.kind) {
            let already = running_per_kind(loop_.kind)
                + selected.iter().filter(|l| l.kind == loop_.kind).count();
            if already >= cap {
                continue;
            }
        }
        selected.push(loop_);
    }
    Ok(selected)
}

/// Process-wide 429 backoff window.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    backoff_until: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed rate limit; starts (or extends) the window.
    pub fn record(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut guard = self.backoff_until.lock().expect("gate poisoned");
        if guard.map(|existing| until > existing).unwrap_or(true) {
            warn!(secs = retry_after.as_secs(), "rate limited; suppressing new loop starts");
            *guard = Some(until);
        }
    }

    /// Whether Pending → Running transitions are currently suppressed.
    pub fn is_limited(&self) -> bool {
        let mut guard = self.backoff_until.lock().expect("gate poisoned");
        match *guard {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }
}

/// Gateway wrapper that feeds 429s into the scheduler gate.
pub struct GatedGateway {
    inner: Arc<dyn LlmGateway>,
    gate: Arc<RateLimitGate>,
}

impl GatedGateway {
    pub fn new(inner: Arc<dyn LlmGateway>, gate: Arc<RateLimitGate>) -> Self {
        Self { inner, gate }
    }

    fn observe(&self, result: &std::result::Result<CompletionResponse, LlmError>) {
        if let Err(LlmError::RateLimited { retry_after }) = result {
            self.gate.record(*retry_after);
        }
    }
}

#[async_trait]
impl LlmGateway for GatedGateway {
    async fn complete(&self, request: CompletionRequest) -> std::result::Result<CompletionResponse, LlmError> {
        let result = self.inner.complete(request).await;
        self.observe(&result);
        result
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<StreamEvent>,
    ) -> std::result::Result<CompletionResponse, LlmError> {
        let result = self.inner.stream(request, sink).await;
        self.observe(&result);
        result
    }
}
