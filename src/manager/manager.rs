//! The LoopManager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::recovery;
use super::scheduler::{self, RateLimitGate};
use super::spawner::spawn_children;
use crate::config::{GyreConfig, RebaseConflictPolicy};
use crate::control::{ControlEvent, ControlRequest, ControlResponse, EventLog, MetricsSnapshot};
use crate::domain::outcome::failure;
use crate::domain::{EventRecord, Loop, LoopKind, LoopOutcome, LoopStatus};
use crate::driver::LoopDriver;
use crate::error::{GyreError, Result};
use crate::paths::ProjectPaths;
use crate::signals::{SignalBus, invalidate_descendants};
use crate::store::{Filter, Store};
use crate::tools::ToolRouter;
use crate::worktree::{MergeQueue, MergeTicket, RebaseOutcome, WorktreeOps, sweep};

/// Manager knobs, lifted from the global config.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub per_kind_max: HashMap<String, usize>,
    pub rebase_ack_deadline: Duration,
    pub cascade_ack_deadline: Duration,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub on_rebase_conflict: RebaseConflictPolicy,
}

impl From<&GyreConfig> for ManagerConfig {
    fn from(config: &GyreConfig) -> Self {
        Self {
            poll_interval: config.scheduler.poll_interval(),
            max_concurrent: config.scheduler.max_concurrent,
            per_kind_max: config.scheduler.per_kind_max.clone(),
            rebase_ack_deadline: Duration::from_secs(config.worktree.rebase_ack_deadline_secs),
            cascade_ack_deadline: Duration::from_secs(config.coordination.ack_deadline_secs),
            retention: Duration::from_secs(config.coordination.retention_days as u64 * 86_400),
            sweep_interval: Duration::from_secs(config.coordination.sweep_interval_secs),
            on_rebase_conflict: config.worktree.on_rebase_conflict,
        }
    }
}

struct RunningLoop {
    kind: LoopKind,
    handle: JoinHandle<Result<LoopOutcome>>,
}

/// Owns loop lifecycle: creation, scheduling, reaping, merges, approvals,
/// cascades, recovery.
pub struct LoopManager {
    store: Arc<Store>,
    bus: Arc<SignalBus>,
    events: Arc<EventLog>,
    driver: Arc<LoopDriver>,
    router: Arc<ToolRouter>,
    worktrees: Arc<WorktreeOps>,
    merges: Arc<MergeQueue>,
    paths: ProjectPaths,
    gate: Arc<RateLimitGate>,
    config: ManagerConfig,
    kinds: crate::config::KindTable,
    running: tokio::sync::Mutex<HashMap<String, RunningLoop>>,
    merging: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LoopManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bus: Arc<SignalBus>,
        events: Arc<EventLog>,
        driver: Arc<LoopDriver>,
        router: Arc<ToolRouter>,
        worktrees: Arc<WorktreeOps>,
        merges: Arc<MergeQueue>,
        paths: ProjectPaths,
        gate: Arc<RateLimitGate>,
        kinds: crate::config::KindTable,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            events,
            driver,
            router,
            worktrees,
            merges,
            paths,
            gate,
            config,
            kinds,
            running: tokio::sync::Mutex::new(HashMap::new()),
            merging: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn transition(&self, loop_: &mut Loop, next: LoopStatus) -> Result<()> {
        if !loop_.status.can_transition_to(next) {
            return Err(GyreError::InvalidState(format!(
                "loop {}: {} -> {} not allowed",
                loop_.id, loop_.status, next
            )));
        }
        let old = loop_.status;
        loop_.status = next;
        loop_.touch();
        self.store.update(loop_)?;
        self.events.emit(
            EventRecord::status_change(&loop_.id, old.as_str(), next.as_str()),
            Some(ControlEvent::LoopUpdated(Box::new(loop_.clone()))),
        );
        Ok(())
    }

    fn get_loop(&self, id: &str) -> Result<Loop> {
        self.store
            .get::<Loop>(id)?
            .ok_or_else(|| GyreError::NotFound(id.to_string()))
    }

    /// Create a root plan in Pending.
    pub fn create_plan(&self, task: &str) -> Result<Loop> {
        let plan = Loop::new_plan(task, self.kinds.get(LoopKind::Plan));
        self.store.create(&plan)?;
        self.events.emit(
            EventRecord::loop_created(&plan.id, plan.kind.as_str()),
            Some(ControlEvent::LoopUpdated(Box::new(plan.clone()))),
        );
        info!(loop_id = %plan.id, "plan created");
        Ok(plan)
    }

    /// Explicitly start one pending loop now.
    pub async fn start_loop(&self, id: &str) -> Result<()> {
        let loop_ = self.get_loop(id)?;
        if loop_.status != LoopStatus::Pending {
            return Err(GyreError::InvalidState(format!(
                "loop {} is {}, not pending",
                id, loop_.status
            )));
        }
        self.spawn_loop(loop_).await
    }

    /// Give a loop a worktree and a driver task.
    ///
    /// A loop that already has a worktree (crash recovery, plan
    /// re-iteration) resumes in it, keeping any auto-committed WIP.
    async fn spawn_loop(&self, mut loop_: Loop) -> Result<()> {
        let worktree = if self.worktrees.exists(&loop_.id) {
            self.worktrees.path(&loop_.id)
        } else {
            match self.worktrees.create(&loop_.id).await {
                Ok(path) => path,
                Err(crate::worktree::WorktreeError::InsufficientSpace { .. }) => {
                    // One aggressive cleanup, then one retry
                    warn!(loop_id = %loop_.id, "disk floor hit; sweeping before retry");
                    let _ = sweep(&self.store, &self.worktrees, &self.paths, Duration::ZERO).await;
                    match self.worktrees.create(&loop_.id).await {
                        Ok(path) => path,
                        Err(e) => {
                            warn!(loop_id = %loop_.id, error = %e, "worktree creation failed after sweep");
                            loop_.failure_reason = Some(failure::INSUFFICIENT_SPACE.to_string());
                            self.transition(&mut loop_, LoopStatus::Failed)?;
                            self.events
                                .record(EventRecord::loop_failed(&loop_.id, failure::INSUFFICIENT_SPACE));
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    warn!(loop_id = %loop_.id, error = %e, "worktree creation failed");
                    loop_.failure_reason = Some(e.to_string());
                    self.transition(&mut loop_, LoopStatus::Failed)?;
                    self.events.record(EventRecord::loop_failed(&loop_.id, &e.to_string()));
                    return Ok(());
                }
            }
        };

        loop_.worktree = worktree;
        self.transition(&mut loop_, LoopStatus::Running)?;
        self.events.record(EventRecord::loop_started(&loop_.id));

        let driver = self.driver.clone();
        let driven = loop_.clone();
        let handle = tokio::spawn(async move { driver.drive(driven).await });
        self.running.lock().await.insert(
            loop_.id.clone(),
            RunningLoop {
                kind: loop_.kind,
                handle,
            },
        );
        Ok(())
    }

    /// One scheduler tick.
    pub async fn tick(&self) -> Result<()> {
        self.reap().await?;

        if !self.gate.is_limited() {
            let (slots, running_per_kind) = {
                let running = self.running.lock().await;
                let mut per_kind: HashMap<LoopKind, usize> = HashMap::new();
                for entry in running.values() {
                    *per_kind.entry(entry.kind).or_default() += 1;
                }
                (
                    self.config.max_concurrent.saturating_sub(running.len()),
                    per_kind,
                )
            };
            let selected = scheduler::select(
                &self.store,
                slots,
                |kind| self.config.per_kind_max.get(kind.as_str()).copied(),
                |kind| running_per_kind.get(&kind).copied().unwrap_or(0),
            )?;
            for loop_ in selected {
                debug!(loop_id = %loop_.id, kind = %loop_.kind, "starting selected loop");
                self.spawn_loop(loop_).await?;
            }
        }

        self.events
            .push(ControlEvent::MetricsUpdate(self.metrics().await?));
        Ok(())
    }

    /// Collect finished driver tasks and settle their outcomes.
    async fn reap(&self) -> Result<()> {
        let finished: Vec<(String, JoinHandle<Result<LoopOutcome>>)> = {
            let mut running = self.running.lock().await;
            let done: Vec<String> = running
                .iter()
                .filter(|(_, entry)| entry.handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            done.into_iter()
                .filter_map(|id| running.remove(&id).map(|entry| (id, entry.handle)))
                .collect()
        };

        for (loop_id, handle) in finished {
            match handle.await {
                Ok(Ok(outcome)) => self.finalize(&loop_id, outcome).await?,
                Ok(Err(e)) => {
                    error!(loop_id = %loop_id, error = %e, "driver errored");
                    if let Ok(mut loop_) = self.get_loop(&loop_id) {
                        if !loop_.status.is_terminal() {
                            loop_.failure_reason = Some(e.to_string());
                            let _ = self.transition(&mut loop_, LoopStatus::Failed);
                        }
                    }
                }
                Err(join_error) => {
                    error!(loop_id = %loop_id, error = %join_error, "driver task panicked");
                    if let Ok(mut loop_) = self.get_loop(&loop_id) {
                        if !loop_.status.is_terminal() {
                            loop_.failure_reason = Some("driver panicked".to_string());
                            let _ = self.transition(&mut loop_, LoopStatus::Failed);
                        }
                    }
                }
            }
        }

        // Reap merge coordinators too
        let mut merging = self.merging.lock().await;
        let done: Vec<String> = merging
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in done {
            if let Some(handle) = merging.remove(&id) {
                let _ = handle.await;
            }
        }
        Ok(())
    }

    /// Settle a driver's terminal outcome.
    async fn finalize(&self, loop_id: &str, outcome: LoopOutcome) -> Result<()> {
        match outcome {
            LoopOutcome::Complete => {
                let loop_ = self.get_loop(loop_id)?;
                match loop_.kind {
                    // Held at the approval gate; children wait for approve()
                    LoopKind::Plan => {}
                    LoopKind::Spec | LoopKind::Phase => {
                        self.spawn_children_or_fail(&loop_).await?;
                        self.release_worktree(loop_id, false).await;
                    }
                    LoopKind::Code => {
                        // Completion for Code settles through the merge path
                        self.release_worktree(loop_id, false).await;
                    }
                }
            }
            LoopOutcome::Failed(_) => {
                // Driver already persisted the failure and released the tree
            }
            LoopOutcome::Invalidated => {
                self.paths.archive_loop(loop_id)?;
            }
            LoopOutcome::Rebasing(ticket) => {
                self.begin_merge(ticket).await;
            }
        }
        Ok(())
    }

    async fn spawn_children_or_fail(&self, parent: &Loop) -> Result<()> {
        match spawn_children(&self.store, &self.paths, &self.kinds, parent) {
            Ok(children) => {
                for child in &children {
                    self.events.emit(
                        EventRecord::loop_created(&child.id, child.kind.as_str()),
                        Some(ControlEvent::LoopUpdated(Box::new(child.clone()))),
                    );
                }
                info!(parent = %parent.id, count = children.len(), "children spawned");
            }
            Err(GyreError::InvalidDescriptor(message)) => {
                warn!(parent = %parent.id, error = %message, "completed without usable descriptor");
                let mut loop_ = self.get_loop(&parent.id)?;
                loop_.failure_reason = Some(failure::MISSING_DESCRIPTOR.to_string());
                loop_.status = LoopStatus::Failed; // reopen-to-fail: Complete is otherwise terminal
                loop_.touch();
                self.store.update(&loop_)?;
                self.events
                    .record(EventRecord::loop_failed(&parent.id, failure::MISSING_DESCRIPTOR));
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn release_worktree(&self, loop_id: &str, preserve_branch: bool) {
        if self.worktrees.exists(loop_id) {
            if let Err(e) = self.worktrees.cleanup(loop_id, preserve_branch).await {
                warn!(loop_id, error = %e, "worktree cleanup failed; sweep will retry");
            }
        }
    }

    /// Launch the rebase-on-merge protocol for a validated Code loop.
    async fn begin_merge(&self, ticket: MergeTicket) {
        let loop_id = ticket.loop_id.clone();
        let loop_id_for_map = loop_id.clone();
        let store = self.store.clone();
        let bus = self.bus.clone();
        let events = self.events.clone();
        let worktrees = self.worktrees.clone();
        let merges = self.merges.clone();
        let router = self.router.clone();
        let deadline = self.config.rebase_ack_deadline;
        let poll = self.config.poll_interval;
        let on_conflict = self.config.on_rebase_conflict;

        let handle = tokio::spawn(async move {
            if let Err(e) = run_merge_protocol(
                &store, &bus, &events, &worktrees, &merges, &router, ticket, deadline, poll, on_conflict,
            )
            .await
            {
                error!(loop_id = %loop_id, error = %e, "merge protocol failed");
            }
        });
        self.merging.lock().await.insert(loop_id_for_map, handle);
    }

    // --- approval gate -----------------------------------------------------

    /// Approve a held plan: spawn its specs and settle it Complete.
    pub async fn approve_plan(&self, id: &str) -> Result<usize> {
        let mut plan = self.get_loop(id)?;
        if plan.status != LoopStatus::AwaitingApproval {
            return Err(GyreError::InvalidState(format!(
                "plan {} is {}, not awaiting approval",
                id, plan.status
            )));
        }
        let children = spawn_children(&self.store, &self.paths, &self.kinds, &plan)?;
        self.transition(&mut plan, LoopStatus::Complete)?;
        self.events
            .record(EventRecord::loop_complete(&plan.id, plan.iteration));
        for child in &children {
            self.events.emit(
                EventRecord::loop_created(&child.id, child.kind.as_str()),
                Some(ControlEvent::LoopUpdated(Box::new(child.clone()))),
            );
        }
        self.release_worktree(id, false).await;
        info!(plan = %id, specs = children.len(), "plan approved");
        Ok(children.len())
    }

    /// Reject a held plan.
    pub async fn reject_plan(&self, id: &str, reason: Option<&str>) -> Result<()> {
        let mut plan = self.get_loop(id)?;
        if plan.status != LoopStatus::AwaitingApproval {
            return Err(GyreError::InvalidState(format!(
                "plan {} is {}, not awaiting approval",
                id, plan.status
            )));
        }
        let reason = reason.unwrap_or("rejected by controller");
        plan.progress
            .push_str(&format!("\n--- Rejected:\n{}\n", reason));
        plan.failure_reason = Some("Rejected".to_string());
        self.transition(&mut plan, LoopStatus::Failed)?;
        self.events.record(EventRecord::loop_failed(&plan.id, reason));
        self.release_worktree(id, true).await;
        Ok(())
    }

    /// Send a plan back around with feedback. Valid on a held plan and on
    /// an approved one; re-iterating an approved plan first invalidates
    /// everything spawned from its previous output.
    pub async fn iterate_plan(&self, id: &str, feedback: &str) -> Result<()> {
        let mut plan = self.get_loop(id)?;
        match plan.status {
            LoopStatus::AwaitingApproval => {}
            LoopStatus::Complete => {
                let outcome = invalidate_descendants(
                    &self.store,
                    &self.bus,
                    id,
                    &format!("plan {} re-iterated", id),
                    self.config.cascade_ack_deadline,
                )
                .await?;
                for stale_id in &outcome.invalidated {
                    self.release_worktree(stale_id, true).await;
                    self.paths.archive_loop(stale_id)?;
                }
                info!(plan = %id, invalidated = outcome.invalidated.len(), "descendants invalidated");
            }
            other => {
                return Err(GyreError::InvalidState(format!(
                    "plan {} is {}, cannot iterate",
                    id, other
                )));
            }
        }

        plan.record_user_feedback(plan.iteration, feedback);
        plan.iteration += 1;
        // Reopen: Complete is terminal for every path except plan re-iteration
        plan.status = LoopStatus::Pending;
        plan.touch();
        self.store.update(&plan)?;
        self.events.push(ControlEvent::LoopUpdated(Box::new(plan.clone())));
        Ok(())
    }

    // --- control operations ------------------------------------------------

    pub fn pause_loop(&self, id: &str) -> Result<()> {
        let loop_ = self.get_loop(id)?;
        if loop_.status != LoopStatus::Running {
            return Err(GyreError::InvalidState(format!("loop {} is {}", id, loop_.status)));
        }
        let signal = self.bus.send_pause(id, "paused by controller")?;
        self.events.emit(
            EventRecord::signal_emitted(&signal.id, signal.kind.as_str(), id),
            Some(ControlEvent::SignalEmitted(Box::new(signal))),
        );
        Ok(())
    }

    /// Resume a paused loop. A live driver gets a Resume signal; a loop
    /// paused with no driver (escalated rebase conflict during its merge)
    /// is requeued for the scheduler instead.
    pub async fn resume_loop(&self, id: &str) -> Result<()> {
        let mut loop_ = self.get_loop(id)?;
        if loop_.status != LoopStatus::Paused {
            return Err(GyreError::InvalidState(format!("loop {} is {}", id, loop_.status)));
        }
        if !self.running.lock().await.contains_key(id) {
            self.transition(&mut loop_, LoopStatus::Pending)?;
            return Ok(());
        }
        let signal = self.bus.send_resume(id, "resumed by controller")?;
        self.events.emit(
            EventRecord::signal_emitted(&signal.id, signal.kind.as_str(), id),
            Some(ControlEvent::SignalEmitted(Box::new(signal))),
        );
        Ok(())
    }

    /// Cancel a loop. Pending loops die in place; live ones get a Stop
    /// signal and exit at their next safe point.
    pub async fn cancel_loop(&self, id: &str) -> Result<()> {
        let mut loop_ = self.get_loop(id)?;
        if loop_.status.is_terminal() {
            return Err(GyreError::InvalidState(format!("loop {} is already {}", id, loop_.status)));
        }
        if loop_.status == LoopStatus::Pending {
            self.transition(&mut loop_, LoopStatus::Invalidated)?;
            self.paths.archive_loop(id)?;
            return Ok(());
        }
        let signal = self.bus.send_stop(id, "cancelled by controller")?;
        self.events.emit(
            EventRecord::signal_emitted(&signal.id, signal.kind.as_str(), id),
            Some(ControlEvent::SignalEmitted(Box::new(signal))),
        );
        Ok(())
    }

    /// Delete a terminal loop's record and state.
    pub async fn delete_loop(&self, id: &str) -> Result<()> {
        let loop_ = self.get_loop(id)?;
        if !loop_.status.is_terminal() {
            return Err(GyreError::InvalidState(format!(
                "loop {} is {}; only terminal loops can be deleted",
                id, loop_.status
            )));
        }
        self.release_worktree(id, false).await;
        let loop_dir = self.paths.loop_dir(id);
        if loop_dir.exists() {
            std::fs::remove_dir_all(&loop_dir)?;
        }
        let archive = self.paths.archive_dir(id);
        if archive.exists() {
            std::fs::remove_dir_all(&archive)?;
        }
        self.store.delete::<Loop>(id)?;
        Ok(())
    }

    /// Aggregate counters for `metrics.update`.
    pub async fn metrics(&self) -> Result<MetricsSnapshot> {
        let count = |status: &str| -> Result<usize> {
            Ok(self.store.query::<Loop>(&[Filter::eq("status", status)])?.len())
        };
        Ok(MetricsSnapshot {
            running: self.running.lock().await.len(),
            pending: count("pending")?,
            complete: count("complete")?,
            failed: count("failed")?,
            invalidated: count("invalidated")?,
            total_input_tokens: 0,
            total_output_tokens: 0,
        })
    }

    /// Dispatch one typed control request.
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        let result: Result<ControlResponse> = match request {
            ControlRequest::CreatePlan { task } => {
                self.create_plan(&task).map(|plan| ControlResponse::PlanCreated { id: plan.id })
            }
            ControlRequest::ListLoops => self.store.list::<Loop>().map(ControlResponse::Loops),
            ControlRequest::GetLoop { id } => self.get_loop(&id).map(|l| ControlResponse::Loop(Box::new(l))),
            ControlRequest::StartLoop { id } => self.start_loop(&id).await.map(|_| ControlResponse::Ok),
            ControlRequest::PauseLoop { id } => self.pause_loop(&id).map(|_| ControlResponse::Ok),
            ControlRequest::ResumeLoop { id } => self.resume_loop(&id).await.map(|_| ControlResponse::Ok),
            ControlRequest::CancelLoop { id } => self.cancel_loop(&id).await.map(|_| ControlResponse::Ok),
            ControlRequest::DeleteLoop { id } => self.delete_loop(&id).await.map(|_| ControlResponse::Ok),
            ControlRequest::ApprovePlan { id } => self
                .approve_plan(&id)
                .await
                .map(|count| ControlResponse::ChildrenSpawned { count }),
            ControlRequest::RejectPlan { id, reason } => self
                .reject_plan(&id, reason.as_deref())
                .await
                .map(|_| ControlResponse::Ok),
            ControlRequest::IteratePlan { id, feedback } => {
                self.iterate_plan(&id, &feedback).await.map(|_| ControlResponse::Ok)
            }
        };
        result.unwrap_or_else(|e| ControlResponse::Error { message: e.to_string() })
    }

    /// Crash recovery scan (call once at startup, before the first tick).
    pub async fn recover(&self) -> Result<Vec<recovery::RecoveryAction>> {
        recovery::recover(&self.store, &self.worktrees).await
    }

    /// The daemon loop: recover, then tick until shutdown flips.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        self.recover().await?;
        self.events.record(EventRecord::engine_started());

        let mut last_sweep = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "tick failed");
                    }
                    if last_sweep.elapsed() >= self.config.sweep_interval {
                        last_sweep = tokio::time::Instant::now();
                        if let Err(e) = sweep(&self.store, &self.worktrees, &self.paths, self.config.retention).await {
                            warn!(error = %e, "sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.events.record(EventRecord::engine_shutdown("requested"));
        Ok(())
    }
}

/// The rebase-on-merge protocol (§ run under the merge lock):
/// signal every other Running loop with the incoming head, wait for their
/// post-rebase acknowledgments, fast-forward main, append the MergeRecord.
#[allow(clippy::too_many_arguments)]
async fn run_merge_protocol(
    store: &Arc<Store>,
    bus: &Arc<SignalBus>,
    events: &Arc<EventLog>,
    worktrees: &Arc<WorktreeOps>,
    merges: &Arc<MergeQueue>,
    router: &Arc<ToolRouter>,
    ticket: MergeTicket,
    ack_deadline: Duration,
    poll: Duration,
    on_rebase_conflict: RebaseConflictPolicy,
) -> Result<()> {
    let loop_id = ticket.loop_id.clone();
    let guard = merges.acquire(&ticket).await?;

    // The loop may have been invalidated while queued
    let Some(mut loop_) = store.get::<Loop>(&loop_id)? else {
        drop(guard);
        return Ok(());
    };
    if loop_.status.is_terminal() {
        drop(guard);
        return Ok(());
    }

    let incoming_head = worktrees.head(&loop_id).await.map_err(GyreError::from)?;

    // Everyone else on main must move to the incoming head
    let others: Vec<Loop> = store
        .query::<Loop>(&[Filter::eq("status", "running")])?
        .into_iter()
        .filter(|l| l.id != loop_id)
        .collect();

    let mut awaiting = Vec::new();
    for other in &others {
        let signal = bus.send_rebase(
            &other.id,
            &loop_id,
            &incoming_head,
            &format!("loop {} is merging to main", loop_id),
        )?;
        events.emit(
            EventRecord::signal_emitted(&signal.id, signal.kind.as_str(), &other.id),
            Some(ControlEvent::SignalEmitted(Box::new(signal.clone()))),
        );
        awaiting.push((other.id.clone(), signal.id));
    }

    // Two waiting rounds: the second after force-cancelling stragglers
    for round in 0..2 {
        let deadline = tokio::time::Instant::now() + ack_deadline;
        while !awaiting.is_empty() && tokio::time::Instant::now() < deadline {
            awaiting.retain(|(target_id, signal_id)| {
                let acked = store
                    .get::<crate::domain::SignalRecord>(signal_id)
                    .ok()
                    .flatten()
                    .map(|s| s.is_acknowledged())
                    .unwrap_or(false);
                if acked {
                    return false;
                }
                // A target that went terminal will never acknowledge
                store
                    .get::<Loop>(target_id)
                    .ok()
                    .flatten()
                    .map(|l| !l.status.is_terminal())
                    .unwrap_or(false)
            });
            if awaiting.is_empty() {
                break;
            }
            tokio::time::sleep(poll).await;
        }
        if awaiting.is_empty() {
            break;
        }
        if round == 0 {
            for (straggler, _) in &awaiting {
                let cancelled = router.cancel_loop_jobs(straggler);
                warn!(straggler = %straggler, cancelled, "rebase ack deadline passed; cancelled in-flight tools");
            }
        } else {
            warn!(
                stragglers = awaiting.len(),
                "proceeding with merge; stragglers will rebase late"
            );
        }
    }

    // Fast-forward; if main moved under us (should not happen under the
    // lock), rebase once and retry
    let merge_result = match worktrees.merge_fast_forward(&loop_id).await {
        Ok(result) => result,
        Err(crate::worktree::WorktreeError::NotFastForward { .. }) => {
            let main_head = worktrees.main_head().await.map_err(GyreError::from)?;
            match worktrees.rebase(&loop_id, &main_head).await.map_err(GyreError::from)? {
                RebaseOutcome::Clean => worktrees.merge_fast_forward(&loop_id).await.map_err(GyreError::from)?,
                RebaseOutcome::Conflict(files) => {
                    drop(guard);
                    warn!(loop_id = %loop_id, ?files, "merge abandoned on rebase conflict");
                    loop_.progress.push_str(&format!(
                        "\n--- Rebase Conflict (merging to main):\n{}\n",
                        files.join("\n")
                    ));
                    let escalate = on_rebase_conflict == RebaseConflictPolicy::Escalate;
                    match (escalate, loop_.parent_id.clone()) {
                        (true, Some(parent_id)) => {
                            let signal = bus.send_error(
                                &parent_id,
                                &loop_id,
                                &format!("child {} hit a rebase conflict while merging", loop_id),
                                Some(serde_json::json!({ "files": files })),
                            )?;
                            events.emit(
                                EventRecord::signal_emitted(&signal.id, signal.kind.as_str(), &parent_id),
                                Some(ControlEvent::SignalEmitted(Box::new(signal))),
                            );
                            // Held, not Failed: its driver is gone, so a
                            // resume requeues it through the scheduler
                            loop_.status = LoopStatus::Paused;
                            loop_.touch();
                            store.update(&loop_)?;
                            events.push(ControlEvent::LoopUpdated(Box::new(loop_.clone())));
                        }
                        _ => {
                            loop_.failure_reason = Some(failure::REBASE_CONFLICT.to_string());
                            loop_.status = LoopStatus::Failed;
                            loop_.touch();
                            store.update(&loop_)?;
                            events.record(EventRecord::loop_failed(&loop_id, failure::REBASE_CONFLICT));
                        }
                    }
                    return Ok(());
                }
            }
        }
        Err(e) => {
            drop(guard);
            return Err(e.into());
        }
    };

    let (pre, post, files_changed) = merge_result;
    let record = crate::domain::MergeRecord::new(&loop_id, &pre, &post, files_changed);
    store.create(&record)?;
    events.record(EventRecord::merge_complete(&loop_id, &post));
    info!(loop_id = %loop_id, pre = %pre, post = %post, files_changed, "merged to main");

    loop_.status = LoopStatus::Complete;
    loop_.touch();
    store.update(&loop_)?;
    events.emit(
        EventRecord::loop_complete(&loop_id, loop_.iteration),
        Some(ControlEvent::LoopUpdated(Box::new(loop_.clone()))),
    );

    drop(guard);

    if worktrees.exists(&loop_id) {
        if let Err(e) = worktrees.cleanup(&loop_id, false).await {
            warn!(loop_id = %loop_id, error = %e, "post-merge cleanup failed; sweep will retry");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_from_global() {
        let mut global = GyreConfig::default();
        global.scheduler.poll_interval_ms = 250;
        global.scheduler.max_concurrent = 7;
        global.worktree.rebase_ack_deadline_secs = 5;
        global.coordination.retention_days = 2;

        let config = ManagerConfig::from(&global);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.max_concurrent, 7);
        assert_eq!(config.rebase_ack_deadline, Duration::from_secs(5));
        assert_eq!(config.retention, Duration::from_secs(2 * 86_400));
        assert_eq!(config.on_rebase_conflict, RebaseConflictPolicy::Escalate);
    }

    #[test]
    fn test_manager_config_carries_conflict_policy() {
        let mut global = GyreConfig::default();
        global.worktree.on_rebase_conflict = RebaseConflictPolicy::Fail;
        let config = ManagerConfig::from(&global);
        assert_eq!(config.on_rebase_conflict, RebaseConflictPolicy::Fail);
    }
}
