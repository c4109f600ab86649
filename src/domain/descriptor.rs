//! Typed child descriptors.
//!
//! Loops declare their children explicitly through a typed "create artifact"
//! tool call; the engine validates the descriptor here and spawns from it
//! directly. Prose artifacts are stored for human review but never parsed
//! for spawning. Descriptor-less artifacts are rejected, not guessed at.

use serde::{Deserialize, Serialize};

use crate::error::{GyreError, Result};

/// Spec entry inside a plan descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecEntry {
    pub name: String,
    pub title: String,
    pub description: String,
    /// Names of sibling specs this one depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Emitted by a Plan loop; one child Spec per entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDescriptor {
    pub title: String,
    pub overview: String,
    pub specs: Vec<SpecEntry>,
}

/// Phase entry inside a spec descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseEntry {
    pub name: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
}

/// Emitted by a Spec loop; one child Phase per entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecDescriptor {
    pub name: String,
    pub title: String,
    pub overview: String,
    pub phases: Vec<PhaseEntry>,
}

/// What a task does to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

/// Task entry inside a phase descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEntry {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<FileAction>,
}

/// Emitted by a Phase loop; spawns the child Code loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDescriptor {
    pub name: String,
    pub title: String,
    pub objective: String,
    pub tasks: Vec<TaskEntry>,
    pub validation_command: String,
}

/// Cardinality bounds.
const SPECS_MIN: usize = 1;
const SPECS_MAX: usize = 10;
const PHASES_MIN: usize = 3;
const PHASES_MAX: usize = 7;

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(GyreError::InvalidDescriptor(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn require_unique_names<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(GyreError::InvalidDescriptor(format!(
                "duplicate {} name '{}'",
                kind, name
            )));
        }
    }
    Ok(())
}

impl PlanDescriptor {
    /// Validate cardinality, required strings, name uniqueness, and that
    /// dependencies reference existing sibling names.
    pub fn validate(&self) -> Result<()> {
        require("title", &self.title)?;
        require("overview", &self.overview)?;
        if self.specs.len() < SPECS_MIN || self.specs.len() > SPECS_MAX {
            return Err(GyreError::InvalidDescriptor(format!(
                "plan must declare {}..={} specs, got {}",
                SPECS_MIN,
                SPECS_MAX,
                self.specs.len()
            )));
        }
        for spec in &self.specs {
            require("spec.name", &spec.name)?;
            require("spec.title", &spec.title)?;
            require("spec.description", &spec.description)?;
        }
        require_unique_names("spec", self.specs.iter().map(|s| s.name.as_str()))?;
        let names: std::collections::HashSet<&str> = self.specs.iter().map(|s| s.name.as_str()).collect();
        for spec in &self.specs {
            for dep in &spec.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(GyreError::InvalidDescriptor(format!(
                        "spec '{}' depends on unknown sibling '{}'",
                        spec.name, dep
                    )));
                }
                if dep == &spec.name {
                    return Err(GyreError::InvalidDescriptor(format!(
                        "spec '{}' depends on itself",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl SpecDescriptor {
    pub fn validate(&self) -> Result<()> {
        require("name", &self.name)?;
        require("title", &self.title)?;
        require("overview", &self.overview)?;
        if self.phases.len() < PHASES_MIN || self.phases.len() > PHASES_MAX {
            return Err(GyreError::InvalidDescriptor(format!(
                "spec must declare {}..={} phases, got {}",
                PHASES_MIN,
                PHASES_MAX,
                self.phases.len()
            )));
        }
        for phase in &self.phases {
            require("phase.name", &phase.name)?;
            require("phase.title", &phase.title)?;
            require("phase.description", &phase.description)?;
        }
        require_unique_names("phase", self.phases.iter().map(|p| p.name.as_str()))
    }
}

impl PhaseDescriptor {
    pub fn validate(&self) -> Result<()> {
        require("name", &self.name)?;
        require("title", &self.title)?;
        require("objective", &self.objective)?;
        require("validation_command", &self.validation_command)?;
        if self.tasks.is_empty() {
            return Err(GyreError::InvalidDescriptor(
                "phase must declare at least one task".to_string(),
            ));
        }
        for task in &self.tasks {
            require("task.description", &task.description)?;
        }
        Ok(())
    }
}
