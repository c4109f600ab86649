//! Layered configuration.
//!
//! Load order: explicit path → `.gyre.yml` in the project →fallback
//! `~/.config/gyre/gyre.yml` → defaults. Every section is serde-defaulted so
//! a partial file only overrides what it names. Validation failures here are
//! fatal at startup.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::LoopKind;
use crate::error::{GyreError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct GyreConfig {
    /// Log filter (tracing EnvFilter syntax)
    pub log_level: Option<String>,

    /// LLM gateway settings
    pub llm: LlmConfig,

    /// Scheduler and concurrency settings
    pub scheduler: SchedulerConfig,

    /// Worktree and merge settings
    pub worktree: WorktreeConfig,

    /// Prompt context budget settings
    pub context: ContextBudgetConfig,

    /// Coordination settings (ack deadlines, retention)
    pub coordination: CoordinationConfig,

    /// Per-kind loop templates
    pub kinds: KindTable,
}

/// LLM gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LlmConfig {
    /// Model identifier passed to the API
    pub model: String,
    /// Max output tokens per completion
    pub max_tokens: u32,
    /// Model context window in tokens (input + reserved output)
    pub context_window: usize,
    /// Per-request HTTP timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            context_window: 200_000,
            timeout_secs: 300,
        }
    }
}

/// Scheduler and concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Tick interval in milliseconds
    pub poll_interval_ms: u64,
    /// Global cap on concurrently running loops
    pub max_concurrent: usize,
    /// Optional per-kind caps (absent = unlimited within the global cap)
    pub per_kind_max: HashMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_concurrent: 4,
            per_kind_max: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-kind cap, if one is configured.
    pub fn kind_cap(&self, kind: LoopKind) -> Option<usize> {
        self.per_kind_max.get(kind.as_str()).copied()
    }
}

/// What to do when a rebase hits a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RebaseConflictPolicy {
    /// Mark the loop Failed(RebaseConflict)
    Fail,
    /// Signal Error to the parent, then mark the loop Failed
    #[default]
    Escalate,
}

/// Worktree and merge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WorktreeConfig {
    /// Main branch merges fast-forward onto
    pub main_ref: String,
    /// Free-space floor in GB below which creation is refused
    pub disk_floor_gb: u64,
    /// Keep branches of failed loops for forensics
    pub preserve_failed_branches: bool,
    /// Deadline for Rebase acknowledgments during a merge, in seconds
    pub rebase_ack_deadline_secs: u64,
    /// Conflict handling policy
    pub on_rebase_conflict: RebaseConflictPolicy,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            main_ref: "main".to_string(),
            disk_floor_gb: 1,
            preserve_failed_branches: true,
            rebase_ack_deadline_secs: 60,
            on_rebase_conflict: RebaseConflictPolicy::Escalate,
        }
    }
}

/// Prompt context budget settings (see the driver's truncation ladder).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ContextBudgetConfig {
    /// Progress sections always kept, newest first
    pub keep_recent_iterations: usize,
    /// Artifact inclusions above this many bytes are summarized
    pub artifact_summary_threshold: usize,
    /// Tool-output inclusions above this many bytes are truncated
    pub tool_output_threshold: usize,
}

impl Default for ContextBudgetConfig {
    fn default() -> Self {
        Self {
            keep_recent_iterations: 2,
            artifact_summary_threshold: 32_768,
            tool_output_threshold: 16_384,
        }
    }
}

/// Coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CoordinationConfig {
    /// How long invalidation waits for running descendants to acknowledge, in seconds
    pub ack_deadline_secs: u64,
    /// Days before acknowledged signals and archived loops are swept
    pub retention_days: u32,
    /// Sweep interval in seconds
    pub sweep_interval_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            ack_deadline_secs: 30,
            retention_days: 7,
            sweep_interval_secs: 300,
        }
    }
}

/// Per-kind behavior template, copied onto each Loop at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KindConfig {
    /// Prompt template path (relative paths resolve against the prompts dir)
    pub prompt_path: PathBuf,
    /// Shell command run in the worktree to validate output
    pub validation_command: String,
    /// Iteration cap before Failed(MaxIterations)
    pub max_iterations: u32,
}

/// The four kind templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KindTable {
    pub plan: KindConfig,
    pub spec: KindConfig,
    pub phase: KindConfig,
    pub code: KindConfig,
}

impl Default for KindTable {
    fn default() -> Self {
        Self {
            plan: KindConfig {
                prompt_path: PathBuf::from("prompts/plan.md"),
                validation_command: "gyre check plan".to_string(),
                max_iterations: 10,
            },
            spec: KindConfig {
                prompt_path: PathBuf::from("prompts/spec.md"),
                validation_command: "gyre check spec".to_string(),
                max_iterations: 10,
            },
            phase: KindConfig {
                prompt_path: PathBuf::from("prompts/phase.md"),
                validation_command: "gyre check phase".to_string(),
                max_iterations: 10,
            },
            code: KindConfig {
                prompt_path: PathBuf::from("prompts/code.md"),
                validation_command: "make check".to_string(),
                max_iterations: 15,
            },
        }
    }
}

impl KindTable {
    /// Template for a kind.
    pub fn get(&self, kind: LoopKind) -> &KindConfig {
        match kind {
            LoopKind::Plan => &self.plan,
            LoopKind::Spec => &self.spec,
            LoopKind::Phase => &self.phase,
            LoopKind::Code => &self.code,
        }
    }
}

impl GyreConfig {
    /// Load with the fallback chain.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = PathBuf::from(".gyre.yml");
        if local.exists() {
            return Self::from_file(&local);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("gyre").join("gyre.yml");
            if user.exists() {
                return Self::from_file(&user);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Parse one file and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| GyreError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| GyreError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.llm.model.is_empty() {
            return Err(GyreError::Config("llm.model must not be empty".to_string()));
        }
        if self.llm.max_tokens == 0 {
            return Err(GyreError::Config("llm.max-tokens must be positive".to_string()));
        }
        if self.llm.context_window <= self.llm.max_tokens as usize {
            return Err(GyreError::Config(
                "llm.context-window must exceed llm.max-tokens".to_string(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(GyreError::Config("scheduler.poll-interval-ms must be positive".to_string()));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(GyreError::Config("scheduler.max-concurrent must be positive".to_string()));
        }
        for kind in LoopKind::ALL {
            let kc = self.kinds.get(kind);
            if kc.max_iterations == 0 {
                return Err(GyreError::Config(format!(
                    "kinds.{}.max-iterations must be positive",
                    kind.as_str()
                )));
            }
            if kc.validation_command.trim().is_empty() {
                return Err(GyreError::Config(format!(
                    "kinds.{}.validation-command must not be empty",
                    kind.as_str()
                )));
            }
        }
        for key in self.scheduler.per_kind_max.keys() {
            if LoopKind::parse(key).is_none() {
                return Err(GyreError::Config(format!(
                    "scheduler.per-kind-max has unknown kind '{}'",
                    key
                )));
            }
        }
        Ok(())
    }

    /// API key from the environment. Fatal when absent.
    pub fn api_key(&self) -> Result<String> {
        std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| GyreError::Config("ANTHROPIC_API_KEY not set".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        GyreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_default_kind_table() {
        let table = KindTable::default();
        assert_eq!(table.get(LoopKind::Plan).max_iterations, 10);
        assert_eq!(table.get(LoopKind::Code).max_iterations, 15);
        assert!(table.get(LoopKind::Spec).prompt_path.ends_with("spec.md"));
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
scheduler:
  max-concurrent: 8
llm:
  model: claude-opus-4
"#;
        let config: GyreConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scheduler.max_concurrent, 8);
        assert_eq!(config.llm.model, "claude-opus-4");
        // Untouched sections keep defaults
        assert_eq!(config.scheduler.poll_interval_ms, 1000);
        assert_eq!(config.worktree.main_ref, "main");
    }

    #[test]
    fn test_validate_rejects_empty_model() {
        let mut config = GyreConfig::default();
        config.llm.model = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_iterations() {
        let mut config = GyreConfig::default();
        config.kinds.phase.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_window_below_output() {
        let mut config = GyreConfig::default();
        config.llm.context_window = 1000;
        config.llm.max_tokens = 8192;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_kind_cap() {
        let mut config = GyreConfig::default();
        config.scheduler.per_kind_max.insert("ralph".to_string(), 2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kind_cap_lookup() {
        let mut config = GyreConfig::default();
        config.scheduler.per_kind_max.insert("code".to_string(), 2);
        assert_eq!(config.scheduler.kind_cap(LoopKind::Code), Some(2));
        assert_eq!(config.scheduler.kind_cap(LoopKind::Plan), None);
    }

    #[test]
    fn test_rebase_conflict_policy_default() {
        assert_eq!(
            WorktreeConfig::default().on_rebase_conflict,
            RebaseConflictPolicy::Escalate
        );
    }

    #[test]
    fn test_rebase_conflict_policy_parse() {
        let policy: RebaseConflictPolicy = serde_yaml::from_str("fail").unwrap();
        assert_eq!(policy, RebaseConflictPolicy::Fail);
    }
}
