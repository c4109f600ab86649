//! Prompt assembly and the context budget policy.
//!
//! Each iteration renders the system prompt from the loop's template and
//! builds exactly one user message: task text, the input artifact, and a
//! feedback section replaying previous failures. When the estimate blows
//! the model window, content is truncated in strict priority order:
//! oldest progress sections first, then oversized artifact inclusions,
//! then oversized tool output inside the remaining sections.

use std::fmt::Write as _;

use handlebars::Handlebars;

use crate::config::ContextBudgetConfig;
use crate::domain::{Loop, LoopKind};
use crate::error::{GyreError, Result};

/// Marker appended wherever prompt content was cut.
const TRUNCATION_MARKER: &str = "[... truncated for context budget]";

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Fallback templates when the configured prompt file is missing.
mod embedded {
    pub const PLAN: &str = "You are planning a software project.\n\
        Break the task into independent specs and emit them with the create_artifact tool.\n";
    pub const SPEC: &str = "You are writing a specification from a plan.\n\
        Define 3 to 7 implementation phases and emit them with the create_artifact tool.\n";
    pub const PHASE: &str = "You are breaking a specification phase into concrete tasks.\n\
        Emit the task list with the create_artifact tool.\n";
    pub const CODE: &str = "You are implementing a focused coding task in an isolated worktree.\n\
        Make minimal changes and ensure the validation command passes.\n";
}

/// Builds system and user prompts under the context budget.
pub struct PromptBuilder {
    handlebars: Handlebars<'static>,
    budget: ContextBudgetConfig,
    context_window: usize,
}

impl PromptBuilder {
    pub fn new(budget: ContextBudgetConfig, context_window: usize) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);
        Self {
            handlebars,
            budget,
            context_window,
        }
    }

    /// Render the loop's system prompt from its template and context.
    pub fn render_system(&self, loop_: &Loop) -> Result<String> {
        let template = match std::fs::read_to_string(&loop_.prompt_path) {
            Ok(content) => content,
            Err(_) => match loop_.kind {
                LoopKind::Plan => embedded::PLAN.to_string(),
                LoopKind::Spec => embedded::SPEC.to_string(),
                LoopKind::Phase => embedded::PHASE.to_string(),
                LoopKind::Code => embedded::CODE.to_string(),
            },
        };
        self.handlebars
            .render_template(&template, &loop_.context)
            .map_err(|e| GyreError::InvalidState(format!("template render failed: {}", e)))
    }

    /// Build the single user message, applying the truncation ladder.
    ///
    /// `reserved_output` is the completion's max_tokens; the combined
    /// estimate must fit the model window or the build fails with
    /// `ContextOverflow` before any request is sent.
    pub fn build_user_message(&self, loop_: &Loop, system: &str, reserved_output: u32) -> Result<String> {
        let task = loop_.task().unwrap_or_default();
        let artifact = loop_
            .input_artifact
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok().map(|content| (path.clone(), content)));
        let mut sections = split_sections(&loop_.progress);

        let budget = self
            .context_window
            .saturating_sub(reserved_output as usize)
            .saturating_sub(estimate_tokens(system));

        // Full fidelity first
        let mut artifact_summarized = false;
        let mut outputs_truncated = false;
        loop {
            let message = compose(task, artifact.as_ref(), &sections, artifact_summarized, outputs_truncated, &self.budget);
            if estimate_tokens(&message) <= budget {
                return Ok(message);
            }

            // 1. Drop oldest progress sections, keeping the most recent few
            if sections.len() > self.budget.keep_recent_iterations {
                sections.remove(0);
                continue;
            }
            // 2. Summarize oversized artifact inclusions
            if !artifact_summarized {
                artifact_summarized = true;
                continue;
            }
            // 3. Truncate oversized tool output in what remains
            if !outputs_truncated {
                outputs_truncated = true;
                continue;
            }
            let message_tokens = estimate_tokens(&message);
            return Err(GyreError::ContextOverflow {
                used: message_tokens + estimate_tokens(system) + reserved_output as usize,
                limit: self.context_window,
            });
        }
    }
}

/// Split accumulated progress into its `--- `-delimited sections.
fn split_sections(progress: &str) -> Vec<String> {
    progress
        .split("\n--- ")
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            if s.starts_with("--- ") {
                s.to_string()
            } else {
                format!("--- {}", s)
            }
        })
        .collect()
}

fn head_and_tail(content: &str, keep: usize) -> String {
    if content.len() <= keep {
        return content.to_string();
    }
    let half = keep / 2;
    let mut head_end = half.min(content.len());
    while !content.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = content.len() - half.min(content.len());
    while !content.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n{} ({} bytes omitted)\n{}",
        &content[..head_end],
        TRUNCATION_MARKER,
        content.len().saturating_sub(keep),
        &content[tail_start..]
    )
}

fn compose(
    task: &str,
    artifact: Option<&(std::path::PathBuf, String)>,
    sections: &[String],
    artifact_summarized: bool,
    outputs_truncated: bool,
    budget: &ContextBudgetConfig,
) -> String {
    let mut message = String::new();
    let _ = write!(message, "## Task\n\n{}\n", task);

    if let Some((path, content)) = artifact {
        let body = if artifact_summarized && content.len() > budget.artifact_summary_threshold {
            head_and_tail(content, budget.artifact_summary_threshold)
        } else {
            content.clone()
        };
        let _ = write!(message, "\n## Input Artifact ({})\n\n{}\n", path.display(), body);
    }

    if !sections.is_empty() {
        message.push_str("\n## Previous Attempt Feedback\n");
        for section in sections {
            let body = if outputs_truncated && section.len() > budget.tool_output_threshold {
                head_and_tail(section, budget.tool_output_threshold)
            } else {
                section.clone()
            };
            let _ = write!(message, "\n{}\n", body);
        }
        message.push_str("\nFix the issues above and make validation pass.\n");
    }
    message
}
