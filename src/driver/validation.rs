//! Iteration validation.
//!
//! Document kinds get format checks (required sections, minimum real
//! content) before the external command; a miss counts as a validation
//! failure without spending a Heavy-lane slot. The external command runs
//! in the loop's worktree through the router.

use serde_json::json;

use crate::domain::{Loop, LoopKind, ToolJobStatus};
use crate::error::Result;
use crate::llm::ToolCall;
use crate::tools::{ExecutionContext, ToolRouter};

/// Outcome of one validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub output: String,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    fn failed(errors: Vec<String>) -> Self {
        Self {
            passed: false,
            output: errors.join("\n"),
            errors,
        }
    }
}

/// Format requirements for a kind's document artifact.
#[derive(Debug, Clone)]
pub struct FormatRules {
    pub required_sections: Vec<&'static str>,
    /// Minimum non-structural content (headers and blanks stripped), chars
    pub min_content: usize,
}

impl FormatRules {
    /// Rules for a kind; None for kinds without document output.
    pub fn for_kind(kind: LoopKind) -> Option<Self> {
        match kind {
            LoopKind::Plan => Some(Self {
                required_sections: vec!["## Overview", "## Specs"],
                min_content: 200,
            }),
            LoopKind::Spec => Some(Self {
                required_sections: vec!["## Overview", "## Phases"],
                min_content: 300,
            }),
            LoopKind::Phase => Some(Self {
                required_sections: vec!["## Objective", "## Tasks"],
                min_content: 100,
            }),
            LoopKind::Code => None,
        }
    }

    /// Check a document; returns the list of misses.
    pub fn check(&self, content: &str) -> Vec<String> {
        let mut errors = Vec::new();
        for section in &self.required_sections {
            if !content.contains(section) {
                errors.push(format!("missing required section {}", section));
            }
        }
        let real_content: usize = content
            .lines()
            .filter(|line| !line.trim_start().starts_with('#') && !line.trim().is_empty())
            .map(|line| line.trim().chars().count())
            .sum();
        if real_content < self.min_content {
            errors.push(format!(
                "document body too thin: {} chars of content, need {}",
                real_content, self.min_content
            ));
        }
        errors
    }
}

/// Run one validation pass for a loop.
///
/// `artifact_content` is the latest emitted artifact for document kinds;
/// a document kind with no artifact fails immediately.
pub async fn run_validation(
    router: &ToolRouter,
    loop_: &Loop,
    artifact_content: Option<&str>,
) -> Result<ValidationOutcome> {
    if let Some(rules) = FormatRules::for_kind(loop_.kind) {
        let Some(content) = artifact_content else {
            return Ok(ValidationOutcome::failed(vec![
                "no artifact was produced; call create_artifact with the structured descriptor".to_string(),
            ]));
        };
        let errors = rules.check(content);
        if !errors.is_empty() {
            return Ok(ValidationOutcome::failed(errors));
        }
    }

    let call = ToolCall {
        id: format!("validation-{}-{}", loop_.id, loop_.iteration),
        name: "run_validation".to_string(),
        input: json!({ "command": loop_.validation_command }),
    };
    let ctx = ExecutionContext {
        worktree: loop_.worktree.clone(),
        loop_id: loop_.id.clone(),
        iteration: loop_.iteration,
    };
    let result = router.dispatch(&call, &ctx).await?;

    let passed = result.status == ToolJobStatus::Success;
    let errors = if passed {
        Vec::new()
    } else if result.was_timeout {
        vec!["validation command timed out".to_string()]
    } else {
        vec![format!(
            "validation command failed (exit {})",
            result.exit_code.map_or("?".to_string(), |c| c.to_string())
        )]
    };
    Ok(ValidationOutcome {
        passed,
        output: result.output,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KindConfig;
    use crate::tools::{LanePools, ToolCatalog};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn template(command: &str) -> KindConfig {
        KindConfig {
            prompt_path: PathBuf::from("p.md"),
            validation_command: command.to_string(),
            max_iterations: 3,
        }
    }

    fn router() -> ToolRouter {
        ToolRouter::new(ToolCatalog::builtin(), LanePools::default())
    }

    fn plan_doc() -> String {
        format!(
            "# Plan\n\n## Overview\n\n{}\n\n## Specs\n\n- core: the core\n",
            "A serious overview of the work to be done. ".repeat(10)
        )
    }

    #[test]
    fn test_format_rules_per_kind() {
        assert!(FormatRules::for_kind(LoopKind::Plan).is_some());
        assert!(FormatRules::for_kind(LoopKind::Spec).is_some());
        assert!(FormatRules::for_kind(LoopKind::Phase).is_some());
        assert!(FormatRules::for_kind(LoopKind::Code).is_none());
    }

    #[test]
    fn test_format_check_missing_section() {
        let rules = FormatRules::for_kind(LoopKind::Plan).unwrap();
        let errors = rules.check("## Overview\n\nsome body text here\n");
        assert!(errors.iter().any(|e| e.contains("## Specs")));
    }

    #[test]
    fn test_format_check_thin_content() {
        let rules = FormatRules::for_kind(LoopKind::Plan).unwrap();
        let errors = rules.check("## Overview\n\nshort\n\n## Specs\n");
        assert!(errors.iter().any(|e| e.contains("too thin")));
    }

    #[test]
    fn test_format_check_passes_real_document() {
        let rules = FormatRules::for_kind(LoopKind::Plan).unwrap();
        assert!(rules.check(&plan_doc()).is_empty());
    }

    #[tokio::test]
    async fn test_document_kind_requires_artifact() {
        let tmp = TempDir::new().unwrap();
        let mut loop_ = Loop::new_plan("t", &template("true"));
        loop_.worktree = tmp.path().to_path_buf();

        let outcome = run_validation(&router(), &loop_, None).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.output.contains("create_artifact"));
    }

    #[tokio::test]
    async fn test_format_failure_skips_command() {
        let tmp = TempDir::new().unwrap();
        // Command would pass; format must fail first
        let mut loop_ = Loop::new_plan("t", &template("true"));
        loop_.worktree = tmp.path().to_path_buf();

        let outcome = run_validation(&router(), &loop_, Some("## Overview only")).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.errors.iter().any(|e| e.contains("## Specs")));
    }

    #[tokio::test]
    async fn test_command_pass_and_fail() {
        let tmp = TempDir::new().unwrap();
        let doc = plan_doc();

        let mut passing = Loop::new_plan("t", &template("true"));
        passing.worktree = tmp.path().to_path_buf();
        let outcome = run_validation(&router(), &passing, Some(&doc)).await.unwrap();
        assert!(outcome.passed);
        assert!(outcome.errors.is_empty());

        let mut failing = Loop::new_plan("t", &template("echo broken; exit 1"));
        failing.worktree = tmp.path().to_path_buf();
        let outcome = run_validation(&router(), &failing, Some(&doc)).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.output.contains("broken"));
        assert!(outcome.errors.iter().any(|e| e.contains("exit 1")));
    }

    #[tokio::test]
    async fn test_code_kind_skips_format_checks() {
        let tmp = TempDir::new().unwrap();
        let parent = Loop::new_plan("t", &template("true"));
        let mut code = Loop::new_child(
            &parent,
            LoopKind::Code,
            1,
            &template("true"),
            serde_json::json!({"task": "x"}),
            None,
        );
        code.worktree = tmp.path().to_path_buf();

        let outcome = run_validation(&router(), &code, None).await.unwrap();
        assert!(outcome.passed);
    }
}
