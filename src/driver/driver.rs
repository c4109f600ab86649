//! LoopDriver: one loop, driven to a terminal outcome.
//!
//! Safe points sit at iteration boundaries and between tool calls; signals
//! are honored there and nowhere else. Every persisted mutation is a
//! checkpoint: a crash at any point resumes from the last one with
//! `iteration` and `progress` intact.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::prompt::PromptBuilder;
use super::validation::run_validation;
use crate::config::RebaseConflictPolicy;
use crate::control::{ControlEvent, EventLog};
use crate::domain::outcome::failure;
use crate::domain::{
    EventRecord, Loop, LoopKind, LoopOutcome, LoopStatus, PhaseDescriptor, PlanDescriptor, SignalKind,
    SignalRecord, SpecDescriptor, ToolJobRecord, ToolJobStatus,
};
use crate::error::{GyreError, Result};
use crate::llm::{
    CompletionRequest, ContentBlock, LlmError, LlmGateway, Message, StopReason, ToolCall,
};
use crate::paths::ProjectPaths;
use crate::signals::SignalBus;
use crate::store::Store;
use crate::tools::{CREATE_ARTIFACT_TOOL, ExecutionContext, ToolRouter};
use crate::worktree::{MergeQueue, RebaseOutcome, WorktreeOps};

/// Driver knobs, extracted from the global config at engine start.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Output token cap per completion
    pub max_tokens: u32,
    /// Poll interval while paused or otherwise waiting on the store
    pub poll_interval: Duration,
    /// Conflict handling during rebase-on-merge
    pub on_rebase_conflict: RebaseConflictPolicy,
    /// Keep failed loops' branches around
    pub preserve_failed_branches: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            poll_interval: Duration::from_secs(1),
            on_rebase_conflict: RebaseConflictPolicy::Escalate,
            preserve_failed_branches: true,
        }
    }
}

/// What signal processing decided.
enum SignalFlow {
    /// Keep iterating
    Continue,
    /// Loop reached a terminal outcome
    Terminal(LoopOutcome),
}

/// What one model turn produced.
enum TurnFlow {
    /// Turn finished; validate now
    Done,
    /// A terminal signal arrived between tool calls
    Interrupted(LoopOutcome),
    /// The model call failed after gateway retries; treat as an iteration
    /// failure and loop
    LlmFailed(String),
}

/// Executes loops.
pub struct LoopDriver {
    store: Arc<Store>,
    bus: Arc<SignalBus>,
    gateway: Arc<dyn LlmGateway>,
    router: Arc<ToolRouter>,
    worktrees: Arc<WorktreeOps>,
    merges: Arc<MergeQueue>,
    events: Arc<EventLog>,
    paths: ProjectPaths,
    prompts: PromptBuilder,
    config: DriverConfig,
}

impl LoopDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bus: Arc<SignalBus>,
        gateway: Arc<dyn LlmGateway>,
        router: Arc<ToolRouter>,
        worktrees: Arc<WorktreeOps>,
        merges: Arc<MergeQueue>,
        events: Arc<EventLog>,
        paths: ProjectPaths,
        prompts: PromptBuilder,
        config: DriverConfig,
    ) -> Self {
        Self {
            store,
            bus,
            gateway,
            router,
            worktrees,
            merges,
            events,
            paths,
            prompts,
            config,
        }
    }

    /// Persist a status transition, enforcing the allowed set.
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

    /// Drive `loop_` until Complete, Failed, Invalidated, or Rebasing.
    pub async fn drive(&self, mut loop_: Loop) -> Result<LoopOutcome> {
        info!(loop_id = %loop_.id, kind = %loop_.kind, iteration = loop_.iteration, "driving loop");

        loop {
            // Safe point: iteration boundary
            match self.process_signals(&mut loop_).await? {
                SignalFlow::Terminal(outcome) => return Ok(outcome),
                SignalFlow::Continue => {}
            }

            if loop_.iteration >= loop_.max_iterations {
                return self.fail(&mut loop_, failure::MAX_ITERATIONS, true).await;
            }

            let iteration = loop_.iteration;
            self.events
                .record(EventRecord::iteration_started(&loop_.id, iteration));
            let iter_dir = self.paths.prepare_iteration(&loop_.id, iteration)?;

            // Fresh context: the prompt is rebuilt from persisted state only
            let system = self.prompts.render_system(&loop_)?;
            let user = match self.prompts.build_user_message(&loop_, &system, self.config.max_tokens) {
                Ok(user) => user,
                Err(GyreError::ContextOverflow { .. }) => {
                    return self.fail(&mut loop_, failure::CONTEXT_OVERFLOW, true).await;
                }
                Err(e) => return Err(e),
            };
            std::fs::write(
                iter_dir.join("prompt.txt"),
                format!("=== system ===\n{}\n=== user ===\n{}\n", system, user),
            )?;

            match self.run_turn(&mut loop_, &system, user, &iter_dir).await? {
                TurnFlow::Interrupted(outcome) => return Ok(outcome),
                TurnFlow::LlmFailed(message) => {
                    warn!(loop_id = %loop_.id, iteration, "model turn failed: {}", message);
                    self.finish_failed_iteration(&mut loop_, iteration, &message).await?;
                    if loop_.iteration >= loop_.max_iterations {
                        return self.fail(&mut loop_, failure::MAX_ITERATIONS, true).await;
                    }
                    continue;
                }
                TurnFlow::Done => {}
            }

            // Validation
            let artifact_content = self.latest_artifact_content(&loop_);
            let validation = run_validation(&self.router, &loop_, artifact_content.as_deref()).await?;
            let _ = std::fs::write(iter_dir.join("validation.log"), &validation.output);
            self.events.emit(
                EventRecord::validation_run(&loop_.id, iteration, validation.passed),
                Some(ControlEvent::LoopIteration {
                    id: loop_.id.clone(),
                    iteration,
                    passed: validation.passed,
                }),
            );

            if validation.passed {
                self.events
                    .record(EventRecord::iteration_complete(&loop_.id, iteration, true));
                return self.succeed(&mut loop_, artifact_content).await;
            }

            self.events
                .record(EventRecord::iteration_complete(&loop_.id, iteration, false));
            self.finish_failed_iteration(&mut loop_, iteration, &validation.output).await?;
            if loop_.iteration >= loop_.max_iterations {
                return self.fail(&mut loop_, failure::MAX_ITERATIONS, true).await;
            }
        }
    }

    /// Record a failed iteration and checkpoint.
    async fn finish_failed_iteration(&self, loop_: &mut Loop, iteration: u32, output: &str) -> Result<()> {
        loop_.record_failure(iteration, output);
        loop_.iteration += 1;
        loop_.touch();
        self.store.update(loop_)?;
        self.events
            .push(ControlEvent::LoopUpdated(Box::new(loop_.clone())));
        Ok(())
    }

    /// Validation passed: settle the terminal state for this kind.
    async fn succeed(&self, loop_: &mut Loop, artifact_content: Option<String>) -> Result<LoopOutcome> {
        match loop_.kind {
            // Code loops serialize through the merge queue before Complete
            LoopKind::Code => {
                self.worktrees
                    .auto_commit(&loop_.id, &format!("loop {}: validated", loop_.id))
                    .await
                    .map_err(GyreError::from)?;
                let ticket = self.merges.request_merge(&loop_.id);
                debug!(loop_id = %loop_.id, seq = ticket.seq, "validation passed, awaiting merge");
                Ok(LoopOutcome::Rebasing(ticket))
            }
            // Plans hold for an approval decision
            LoopKind::Plan => {
                self.transition(loop_, LoopStatus::AwaitingApproval)?;
                let descriptors = std::fs::read_to_string(self.paths.descriptor_path(&loop_.id))
                    .ok()
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or(Value::Null);
                self.events.push(ControlEvent::PlanAwaitingApproval {
                    id: loop_.id.clone(),
                    content: artifact_content.unwrap_or_default(),
                    descriptors,
                });
                Ok(LoopOutcome::Complete)
            }
            _ => {
                self.transition(loop_, LoopStatus::Complete)?;
                self.events
                    .record(EventRecord::loop_complete(&loop_.id, loop_.iteration));
                Ok(LoopOutcome::Complete)
            }
        }
    }

    /// Mark the loop Failed, notify the parent, release the worktree.
    ///
    /// Only for reasons that are final for this loop. A rebase conflict is
    /// not necessarily one of those; see `resolve_rebase_conflict`.
    async fn fail(&self, loop_: &mut Loop, reason: &str, notify_parent: bool) -> Result<LoopOutcome> {
        warn!(loop_id = %loop_.id, reason, "loop failed");
        loop_.failure_reason = Some(reason.to_string());
        self.transition(loop_, LoopStatus::Failed)?;
        self.events
            .record(EventRecord::loop_failed(&loop_.id, reason));

        if notify_parent {
            if let Some(parent_id) = loop_.parent_id.clone() {
                let signal = self.bus.send_error(
                    &parent_id,
                    &loop_.id,
                    &format!("child {} failed: {}", loop_.id, reason),
                    None,
                )?;
                self.events.emit(
                    EventRecord::signal_emitted(&signal.id, signal.kind.as_str(), &parent_id),
                    Some(ControlEvent::SignalEmitted(Box::new(signal))),
                );
            }
        }

        if self.worktrees.exists(&loop_.id) {
            if let Err(e) = self
                .worktrees
                .cleanup(&loop_.id, self.config.preserve_failed_branches)
                .await
            {
                warn!(loop_id = %loop_.id, error = %e, "worktree cleanup failed; sweep will retry");
            }
        }
        Ok(LoopOutcome::Failed(reason.to_string()))
    }

    /// Terminal signal: invalidate and release everything.
    async fn invalidate(&self, loop_: &mut Loop, signal: &SignalRecord) -> Result<LoopOutcome> {
        info!(loop_id = %loop_.id, reason = %signal.reason, "invalidated");
        self.transition(loop_, LoopStatus::Invalidated)?;
        self.bus.acknowledge(&signal.id)?;
        if self.worktrees.exists(&loop_.id) {
            if let Err(e) = self.worktrees.cleanup(&loop_.id, true).await {
                warn!(loop_id = %loop_.id, error = %e, "worktree cleanup failed; sweep will retry");
            }
        }
        Ok(LoopOutcome::Invalidated)
    }

    /// Drain pending signals at an iteration boundary.
    async fn process_signals(&self, loop_: &mut Loop) -> Result<SignalFlow> {
        loop {
            let Some(signal) = self.bus.check(&loop_.id)? else {
                return Ok(SignalFlow::Continue);
            };
            debug!(loop_id = %loop_.id, kind = signal.kind.as_str(), "signal at safe point");

            match signal.kind {
                SignalKind::Stop | SignalKind::Invalidate => {
                    return Ok(SignalFlow::Terminal(self.invalidate(loop_, &signal).await?));
                }
                SignalKind::Pause => {
                    self.transition(loop_, LoopStatus::Paused)?;
                    self.bus.acknowledge(&signal.id)?;
                    if let Some(flow) = self.wait_while_paused(loop_).await? {
                        return Ok(SignalFlow::Terminal(flow));
                    }
                }
                SignalKind::Resume => {
                    // Not paused; stale resume
                    self.bus.acknowledge(&signal.id)?;
                }
                SignalKind::Rebase => {
                    if let Some(outcome) = self.handle_rebase(loop_, &signal).await? {
                        return Ok(SignalFlow::Terminal(outcome));
                    }
                }
                SignalKind::Error => {
                    loop_.progress.push_str(&format!(
                        "\n--- Error signal from {}:\n{}\n",
                        signal.source_loop.as_deref().unwrap_or("engine"),
                        signal.reason
                    ));
                    loop_.touch();
                    self.store.update(loop_)?;
                    self.bus.acknowledge(&signal.id)?;
                }
                SignalKind::Info => {
                    self.bus.acknowledge(&signal.id)?;
                }
            }
        }
    }

    /// Block (poll) until a Resume arrives; Stop/Invalidate win.
    async fn wait_while_paused(&self, loop_: &mut Loop) -> Result<Option<LoopOutcome>> {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let Some(signal) = self.bus.check(&loop_.id)? else {
                continue;
            };
            match signal.kind {
                SignalKind::Resume => {
                    self.transition(loop_, LoopStatus::Running)?;
                    self.bus.acknowledge(&signal.id)?;
                    return Ok(None);
                }
                SignalKind::Stop | SignalKind::Invalidate => {
                    return Ok(Some(self.invalidate(loop_, &signal).await?));
                }
                _ => {
                    // Anything else waits its turn behind the pause
                    self.bus.acknowledge(&signal.id)?;
                }
            }
        }
    }

    /// Rebase onto the head a sibling just merged. Acknowledgment is sent
    /// only after the rebase finishes, so the merge holder knows every
    /// acknowledged sibling is actually based on the new head.
    async fn handle_rebase(&self, loop_: &mut Loop, signal: &SignalRecord) -> Result<Option<LoopOutcome>> {
        let new_head = signal
            .payload
            .as_ref()
            .and_then(|p| p.get("new_head"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(new_head) = new_head else {
            warn!(loop_id = %loop_.id, "rebase signal without new_head; ignoring");
            self.bus.acknowledge(&signal.id)?;
            return Ok(None);
        };

        self.transition(loop_, LoopStatus::Rebasing)?;
        self.worktrees
            .auto_commit(&loop_.id, "WIP: pre-rebase")
            .await
            .map_err(GyreError::from)?;

        match self.worktrees.rebase(&loop_.id, &new_head).await.map_err(GyreError::from)? {
            RebaseOutcome::Clean => {
                self.transition(loop_, LoopStatus::Running)?;
                self.bus.acknowledge(&signal.id)?;
                debug!(loop_id = %loop_.id, new_head = %new_head, "rebased onto new main");
                Ok(None)
            }
            RebaseOutcome::Conflict(files) => {
                self.bus.acknowledge(&signal.id)?;
                warn!(loop_id = %loop_.id, ?files, "rebase conflict");
                self.resolve_rebase_conflict(loop_, &files).await
            }
        }
    }

    /// Settle a rebase conflict per the configured policy.
    ///
    /// `fail` marks the loop Failed(RebaseConflict). `escalate` does not
    /// fail the loop: the conflict goes to the parent as an Error signal
    /// and the loop holds Paused until a Resume retries it or a Stop ends
    /// it. A loop with no parent has nobody to escalate to and fails
    /// under either policy.
    async fn resolve_rebase_conflict(&self, loop_: &mut Loop, files: &[String]) -> Result<Option<LoopOutcome>> {
        loop_.progress.push_str(&format!(
            "\n--- Rebase Conflict (Iteration {}):\n{}\n",
            loop_.iteration,
            files.join("\n")
        ));
        loop_.touch();
        self.store.update(loop_)?;

        let escalate = self.config.on_rebase_conflict == RebaseConflictPolicy::Escalate;
        match (escalate, loop_.parent_id.clone()) {
            (true, Some(parent_id)) => {
                let signal = self.bus.send_error(
                    &parent_id,
                    &loop_.id,
                    &format!("child {} hit a rebase conflict", loop_.id),
                    Some(serde_json::json!({ "files": files })),
                )?;
                self.events.emit(
                    EventRecord::signal_emitted(&signal.id, signal.kind.as_str(), &parent_id),
                    Some(ControlEvent::SignalEmitted(Box::new(signal))),
                );
                self.transition(loop_, LoopStatus::Paused)?;
                self.wait_while_paused(loop_).await
            }
            _ => Ok(Some(self.fail(loop_, failure::REBASE_CONFLICT, false).await?)),
        }
    }

    fn append_transcript(iter_dir: &Path, entry: &str) {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(iter_dir.join("transcript.log"))
        {
            let _ = writeln!(file, "{}", entry);
        }
    }

    /// One model turn: possibly several completions while the model keeps
    /// requesting tools. Counts as a single loop iteration.
    async fn run_turn(
        &self,
        loop_: &mut Loop,
        system: &str,
        user: String,
        iter_dir: &Path,
    ) -> Result<TurnFlow> {
        let tools = self.router.catalog().schemas_for_kind(loop_.kind);
        let mut messages = vec![Message::user(user)];

        loop {
            let request = CompletionRequest {
                system_prompt: system.to_string(),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: self.config.max_tokens,
            };
            let response = match self.gateway.complete(request).await {
                Ok(response) => response,
                Err(LlmError::ContextOverflow { used, limit }) => {
                    return Err(GyreError::ContextOverflow { used, limit });
                }
                Err(e) => return Ok(TurnFlow::LlmFailed(e.to_string())),
            };

            if let Some(text) = &response.content {
                Self::append_transcript(iter_dir, &format!("[assistant]\n{}", text));
            }

            if response.tool_calls.is_empty() {
                return Ok(TurnFlow::Done);
            }

            // Echo the model's turn back, then attach tool results
            let mut assistant_blocks = Vec::new();
            if let Some(text) = &response.content {
                if !text.is_empty() {
                    assistant_blocks.push(ContentBlock::Text { text: text.clone() });
                }
            }
            for call in &response.tool_calls {
                assistant_blocks.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                });
            }
            messages.push(Message::assistant_blocks(assistant_blocks));

            let mut result_blocks = Vec::new();
            for call in &response.tool_calls {
                // Safe point: between tool calls, terminal signals only
                if let Some(signal) = self.bus.check(&loop_.id)? {
                    if signal.is_terminal_for_target() {
                        return Ok(TurnFlow::Interrupted(self.invalidate(loop_, &signal).await?));
                    }
                }

                let (content, is_error) = self.execute_tool(loop_, call, iter_dir).await?;
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content,
                    is_error,
                });
            }
            messages.push(Message::user_blocks(result_blocks));

            if response.stop_reason != StopReason::ToolUse {
                return Ok(TurnFlow::Done);
            }
        }
    }

    /// Execute one tool call: artifact emission inline, everything else
    /// through the router; persist the audit record either way.
    async fn execute_tool(&self, loop_: &mut Loop, call: &ToolCall, iter_dir: &Path) -> Result<(String, bool)> {
        let lane = self
            .router
            .lane_for(&call.name)
            .map(|l| l.as_str().to_string())
            .unwrap_or_else(|| "no-net".to_string());
        let mut job = ToolJobRecord::new(&loop_.id, loop_.iteration, &call.name, &lane)
            .with_input(&call.input.to_string());

        if call.name == CREATE_ARTIFACT_TOOL {
            let (content, is_error) = match self.handle_artifact(loop_, call, iter_dir) {
                Ok(message) => (message, false),
                Err(GyreError::InvalidDescriptor(message)) => (format!("descriptor rejected: {}", message), true),
                Err(e) => return Err(e),
            };
            job.finish(
                if is_error { ToolJobStatus::Failed } else { ToolJobStatus::Success },
                &content,
                None,
                0,
            );
            self.store.create(&job)?;
            self.events
                .record(EventRecord::tool_call(&loop_.id, &call.name, &lane, job.status.as_str()));
            Self::append_transcript(iter_dir, &format!("[tool {}] {}", call.name, content));
            return Ok((content, is_error));
        }

        let ctx = ExecutionContext {
            worktree: loop_.worktree.clone(),
            loop_id: loop_.id.clone(),
            iteration: loop_.iteration,
        };
        let result = match self.router.dispatch(call, &ctx).await {
            Ok(result) => result,
            Err(GyreError::SandboxViolation(message)) => {
                job.finish(ToolJobStatus::Failed, &message, None, 0);
                self.store.create(&job)?;
                self.events
                    .record(EventRecord::tool_call(&loop_.id, &call.name, &lane, "sandbox_violation"));
                return Ok((format!("sandbox violation: {}", message), true));
            }
            Err(e) => return Err(e),
        };

        job.finish(result.status, &result.output, result.exit_code, result.duration_ms);
        self.store.create(&job)?;
        self.events
            .record(EventRecord::tool_call(&loop_.id, &call.name, &lane, result.status.as_str()));
        Self::append_transcript(
            iter_dir,
            &format!("[tool {} -> {}]\n{}", call.name, result.status.as_str(), result.output),
        );
        let is_error = result.is_error();
        Ok((result.output, is_error))
    }

    /// The typed artifact tool: validate the descriptor for this kind,
    /// store the rendered document and the descriptor, record the output.
    fn handle_artifact(&self, loop_: &mut Loop, call: &ToolCall, iter_dir: &Path) -> Result<String> {
        let filename = call
            .input
            .get("filename")
            .and_then(Value::as_str)
            .ok_or_else(|| GyreError::InvalidDescriptor("missing filename".to_string()))?;
        let content = call
            .input
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| GyreError::InvalidDescriptor("missing content".to_string()))?;
        let descriptor = call
            .input
            .get("descriptor")
            .cloned()
            .ok_or_else(|| GyreError::InvalidDescriptor("missing descriptor".to_string()))?;

        if filename.contains('/') || filename.contains("..") {
            return Err(GyreError::InvalidDescriptor(format!("bad filename '{}'", filename)));
        }

        match loop_.kind {
            LoopKind::Plan => {
                let parsed: PlanDescriptor = serde_json::from_value(descriptor.clone())
                    .map_err(|e| GyreError::InvalidDescriptor(e.to_string()))?;
                parsed.validate()?;
            }
            LoopKind::Spec => {
                let parsed: SpecDescriptor = serde_json::from_value(descriptor.clone())
                    .map_err(|e| GyreError::InvalidDescriptor(e.to_string()))?;
                parsed.validate()?;
            }
            LoopKind::Phase => {
                let parsed: PhaseDescriptor = serde_json::from_value(descriptor.clone())
                    .map_err(|e| GyreError::InvalidDescriptor(e.to_string()))?;
                parsed.validate()?;
            }
            LoopKind::Code => {
                return Err(GyreError::InvalidDescriptor(
                    "code loops do not emit artifacts".to_string(),
                ));
            }
        }

        let artifact_path = iter_dir.join("artifacts").join(filename);
        std::fs::write(&artifact_path, content)?;
        std::fs::write(
            self.paths.descriptor_path(&loop_.id),
            serde_json::to_string_pretty(&descriptor)?,
        )?;

        if !loop_.output_artifacts.contains(&artifact_path) {
            loop_.output_artifacts.push(artifact_path.clone());
        }
        loop_.touch();
        self.store.update(loop_)?;

        Ok(format!("artifact recorded at {}", artifact_path.display()))
    }

    /// Content of the loop's most recent artifact, if any.
    fn latest_artifact_content(&self, loop_: &Loop) -> Option<String> {
        loop_
            .output_artifacts
            .last()
            .and_then(|path| std::fs::read_to_string(path).ok())
    }
}
