//! The Loop record.
//!
//! A Loop iterates with fresh context until its validation command passes.
//! Cross-iteration learning lives entirely in `progress`: the driver appends
//! a feedback section per failed attempt and replays them inside the single
//! user message of the next attempt.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::KindConfig;
use crate::id::{child_id, loop_id, now_ms};

/// The four kinds in the hierarchy, root to leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopKind {
    Plan,
    Spec,
    Phase,
    Code,
}

impl LoopKind {
    pub const ALL: [LoopKind; 4] = [LoopKind::Plan, LoopKind::Spec, LoopKind::Phase, LoopKind::Code];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopKind::Plan => "plan",
            LoopKind::Spec => "spec",
            LoopKind::Phase => "phase",
            LoopKind::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(LoopKind::Plan),
            "spec" => Some(LoopKind::Spec),
            "phase" => Some(LoopKind::Phase),
            "code" => Some(LoopKind::Code),
            _ => None,
        }
    }

    /// Kind of children this kind spawns on completion.
    pub fn child_kind(&self) -> Option<LoopKind> {
        match self {
            LoopKind::Plan => Some(LoopKind::Spec),
            LoopKind::Spec => Some(LoopKind::Phase),
            LoopKind::Phase => Some(LoopKind::Code),
            LoopKind::Code => None,
        }
    }

    /// Whether completion produces a document artifact with format checks.
    pub fn has_document_output(&self) -> bool {
        !matches!(self, LoopKind::Code)
    }
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// Waiting to be scheduled
    Pending,
    /// Actively iterating under a driver task
    Running,
    /// Suspended, resumable
    Paused,
    /// Rebasing onto a freshly merged main
    Rebasing,
    /// Plan complete, held for an approval decision
    AwaitingApproval,
    /// Validation passed
    Complete,
    /// Exhausted iterations or hit an unrecoverable error
    Failed,
    /// Stale: an ancestor re-iterated
    Invalidated,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Pending => "pending",
            LoopStatus::Running => "running",
            LoopStatus::Paused => "paused",
            LoopStatus::Rebasing => "rebasing",
            LoopStatus::AwaitingApproval => "awaiting_approval",
            LoopStatus::Complete => "complete",
            LoopStatus::Failed => "failed",
            LoopStatus::Invalidated => "invalidated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LoopStatus::Pending),
            "running" => Some(LoopStatus::Running),
            "paused" => Some(LoopStatus::Paused),
            "rebasing" => Some(LoopStatus::Rebasing),
            "awaiting_approval" => Some(LoopStatus::AwaitingApproval),
            "complete" => Some(LoopStatus::Complete),
            "failed" => Some(LoopStatus::Failed),
            "invalidated" => Some(LoopStatus::Invalidated),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopStatus::Complete | LoopStatus::Failed | LoopStatus::Invalidated)
    }

    /// Statuses that hold a live worktree.
    pub fn holds_worktree(&self) -> bool {
        matches!(self, LoopStatus::Running | LoopStatus::Paused | LoopStatus::Rebasing)
    }

    /// Whether a transition to `next` is allowed.
    pub fn can_transition_to(&self, next: LoopStatus) -> bool {
        use LoopStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Running) | (Pending, Invalidated) | (Pending, Failed) => true,
            (Running, Paused)
            | (Running, Rebasing)
            | (Running, AwaitingApproval)
            | (Running, Complete)
            | (Running, Failed)
            | (Running, Invalidated)
            | (Running, Pending) => true, // Pending only via crash recovery
            // Pending via resume of a loop whose driver is gone
            (Paused, Running) | (Paused, Pending) | (Paused, Invalidated) | (Paused, Failed) => true,
            // Paused on an escalated rebase conflict
            (Rebasing, Running) | (Rebasing, Paused) | (Rebasing, Failed) | (Rebasing, Invalidated) => true,
            (AwaitingApproval, Complete)
            | (AwaitingApproval, Running)
            | (AwaitingApproval, Failed)
            | (AwaitingApproval, Invalidated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of iterative work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Loop {
    /// Unique id, sortable by creation time; children use `PPP-CCC` form
    pub id: String,

    /// Plan, Spec, Phase, or Code
    pub kind: LoopKind,

    /// Spawning loop's id (None iff kind = Plan)
    pub parent_id: Option<String>,

    /// Parent artifact this loop consumes
    pub input_artifact: Option<PathBuf>,

    /// Artifacts this loop has produced, in order
    pub output_artifacts: Vec<PathBuf>,

    /// Prompt template, copied from the kind template at creation
    pub prompt_path: PathBuf,

    /// Validation command run in the worktree
    pub validation_command: String,

    /// Iteration cap
    pub max_iterations: u32,

    /// Worktree path; empty until spawned
    pub worktree: PathBuf,

    /// Completed attempts, zero-based
    pub iteration: u32,

    /// Current status
    pub status: LoopStatus,

    /// Accumulated feedback sections from failed iterations
    pub progress: String,

    /// Why the loop failed, when status = Failed
    pub failure_reason: Option<String>,

    /// Kind-specific payload (task text, sibling index, parent refs)
    pub context: serde_json::Value,

    /// Unix ms timestamps
    pub created_at: i64,
    pub updated_at: i64,
}

impl Loop {
    /// Create a root plan from user task text.
    pub fn new_plan(task: &str, template: &KindConfig) -> Self {
        let now = now_ms();
        Self {
            id: loop_id(),
            kind: LoopKind::Plan,
            parent_id: None,
            input_artifact: None,
            output_artifacts: vec![],
            prompt_path: template.prompt_path.clone(),
            validation_command: template.validation_command.clone(),
            max_iterations: template.max_iterations,
            worktree: PathBuf::new(),
            iteration: 0,
            status: LoopStatus::Pending,
            progress: String::new(),
            failure_reason: None,
            context: serde_json::json!({ "task": task }),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a child of `parent` with a 1-based sibling index.
    pub fn new_child(
        parent: &Loop,
        kind: LoopKind,
        index: u32,
        template: &KindConfig,
        context: serde_json::Value,
        input_artifact: Option<PathBuf>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: child_id(&parent.id, index),
            kind,
            parent_id: Some(parent.id.clone()),
            input_artifact,
            output_artifacts: vec![],
            prompt_path: template.prompt_path.clone(),
            validation_command: template.validation_command.clone(),
            max_iterations: template.max_iterations,
            worktree: PathBuf::new(),
            iteration: 0,
            status: LoopStatus::Pending,
            progress: String::new(),
            failure_reason: None,
            context,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`. Call after every mutation before persisting.
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    /// Append one failure feedback section for the just-finished iteration.
    pub fn record_failure(&mut self, iteration: u32, output: &str) {
        self.progress
            .push_str(&format!("\n--- Iteration {} Failed:\n{}\n", iteration, output));
    }

    /// Append a user feedback section (approval-gate iterate).
    pub fn record_user_feedback(&mut self, iteration: u32, feedback: &str) {
        self.progress
            .push_str(&format!("\n--- User Feedback (Iteration {}):\n{}\n", iteration, feedback));
    }

    /// Number of failure sections accumulated so far.
    pub fn failure_section_count(&self) -> usize {
        self.progress.matches("--- Iteration ").count()
    }

    /// Task text from context, if present.
    pub fn task(&self) -> Option<&str> {
        self.context.get("task").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> KindConfig {
        KindConfig {
            prompt_path: PathBuf::from("prompts/plan.md"),
            validation_command: "true".to_string(),
            max_iterations: 5,
        }
    }

    #[test]
    fn test_new_plan_shape() {
        let plan = Loop::new_plan("add a counter", &template());
        assert_eq!(plan.kind, LoopKind::Plan);
        assert!(plan.parent_id.is_none());
        assert!(plan.input_artifact.is_none());
        assert_eq!(plan.iteration, 0);
        assert_eq!(plan.status, LoopStatus::Pending);
        assert_eq!(plan.task(), Some("add a counter"));
        assert_eq!(plan.max_iterations, 5);
        assert!(plan.worktree.as_os_str().is_empty());
    }

    #[test]
    fn test_new_child_links_parent() {
        let plan = Loop::new_plan("task", &template());
        let spec = Loop::new_child(
            &plan,
            LoopKind::Spec,
            1,
            &template(),
            serde_json::json!({"name": "auth"}),
            Some(PathBuf::from("plan.md")),
        );
        assert_eq!(spec.parent_id.as_deref(), Some(plan.id.as_str()));
        assert!(spec.id.ends_with("-001"));
        assert_eq!(spec.input_artifact, Some(PathBuf::from("plan.md")));
    }

    #[test]
    fn test_kind_child_chain() {
        assert_eq!(LoopKind::Plan.child_kind(), Some(LoopKind::Spec));
        assert_eq!(LoopKind::Spec.child_kind(), Some(LoopKind::Phase));
        assert_eq!(LoopKind::Phase.child_kind(), Some(LoopKind::Code));
        assert_eq!(LoopKind::Code.child_kind(), None);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in LoopKind::ALL {
            assert_eq!(LoopKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LoopKind::parse("ralph"), None);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            LoopStatus::Pending,
            LoopStatus::Running,
            LoopStatus::Paused,
            LoopStatus::Rebasing,
            LoopStatus::AwaitingApproval,
            LoopStatus::Complete,
            LoopStatus::Failed,
            LoopStatus::Invalidated,
        ] {
            assert_eq!(LoopStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(LoopStatus::Complete.is_terminal());
        assert!(LoopStatus::Failed.is_terminal());
        assert!(LoopStatus::Invalidated.is_terminal());
        assert!(!LoopStatus::Running.is_terminal());
        assert!(!LoopStatus::AwaitingApproval.is_terminal());
    }

    #[test]
    fn test_terminal_admits_no_transition() {
        assert!(!LoopStatus::Complete.can_transition_to(LoopStatus::Running));
        assert!(!LoopStatus::Failed.can_transition_to(LoopStatus::Pending));
        assert!(!LoopStatus::Invalidated.can_transition_to(LoopStatus::Invalidated));
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(LoopStatus::Pending.can_transition_to(LoopStatus::Running));
        assert!(LoopStatus::Running.can_transition_to(LoopStatus::Rebasing));
        assert!(LoopStatus::Rebasing.can_transition_to(LoopStatus::Running));
        assert!(LoopStatus::Running.can_transition_to(LoopStatus::AwaitingApproval));
        assert!(LoopStatus::AwaitingApproval.can_transition_to(LoopStatus::Running));
        assert!(LoopStatus::Paused.can_transition_to(LoopStatus::Running));
        // Escalated rebase conflict holds the loop
        assert!(LoopStatus::Rebasing.can_transition_to(LoopStatus::Paused));
        // Resuming a loop with no live driver requeues it
        assert!(LoopStatus::Paused.can_transition_to(LoopStatus::Pending));
        // Crash recovery path
        assert!(LoopStatus::Running.can_transition_to(LoopStatus::Pending));
        // Nonsense
        assert!(!LoopStatus::Pending.can_transition_to(LoopStatus::Paused));
        assert!(!LoopStatus::Paused.can_transition_to(LoopStatus::Rebasing));
    }

    #[test]
    fn test_record_failure_sections() {
        let mut l = Loop::new_plan("t", &template());
        l.record_failure(0, "tests failed");
        l.record_failure(1, "still failing");
        assert_eq!(l.failure_section_count(), 2);
        assert!(l.progress.contains("--- Iteration 0 Failed:"));
        assert!(l.progress.contains("--- Iteration 1 Failed:"));
        let first = l.progress.find("Iteration 0").unwrap();
        let second = l.progress.find("Iteration 1").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_user_feedback_not_counted_as_failure() {
        let mut l = Loop::new_plan("t", &template());
        l.record_user_feedback(1, "missing auth");
        assert_eq!(l.failure_section_count(), 0);
        assert!(l.progress.contains("--- User Feedback (Iteration 1):"));
    }

    #[test]
    fn test_touch_advances_updated_at() {
        let mut l = Loop::new_plan("t", &template());
        let before = l.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        l.touch();
        assert!(l.updated_at > before);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let l = Loop::new_plan("roundtrip", &template());
        let json = serde_json::to_string(&l).unwrap();
        let back: Loop = serde_json::from_str(&json).unwrap();
        assert_eq!(l, back);
    }
}
