//! Child spawning from structured descriptors.
//!
//! Children come from the descriptor a loop emitted through the artifact
//! tool, never from parsing its prose. A completed parent without a
//! descriptor is an error the caller surfaces.

use serde_json::json;

use crate::config::KindTable;
use crate::domain::{Loop, LoopKind, PhaseDescriptor, PlanDescriptor, SpecDescriptor};
use crate::error::{GyreError, Result};
use crate::paths::ProjectPaths;
use crate::store::Store;

/// Spawn Pending children for a completed parent from its descriptor.
///
/// Returns the created children in sibling order. The parent's latest
/// output artifact becomes each child's `input_artifact`.
pub fn spawn_children(
    store: &Store,
    paths: &ProjectPaths,
    kinds: &KindTable,
    parent: &Loop,
) -> Result<Vec<Loop>> {
    let child_kind = parent.kind.child_kind().ok_or_else(|| {
        GyreError::InvalidState(format!("{} loops do not spawn children", parent.kind))
    })?;

    let descriptor_raw = std::fs::read_to_string(paths.descriptor_path(&parent.id)).map_err(|_| {
        GyreError::InvalidDescriptor(format!("loop {} completed without a descriptor", parent.id))
    })?;
    let artifact = parent.output_artifacts.last().cloned();

    let mut children = Vec::new();
    match parent.kind {
        LoopKind::Plan => {
            let descriptor: PlanDescriptor = serde_json::from_str(&descriptor_raw)
                .map_err(|e| GyreError::InvalidDescriptor(e.to_string()))?;
            descriptor.validate()?;
            for (i, spec) in descriptor.specs.iter().enumerate() {
                let context = json!({
                    "task": spec.description,
                    "name": spec.name,
                    "title": spec.title,
                    "index": i + 1,
                    "dependencies": spec.dependencies,
                });
                children.push(Loop::new_child(
                    parent,
                    child_kind,
                    (i + 1) as u32,
                    kinds.get(child_kind),
                    context,
                    artifact.clone(),
                ));
            }
        }
        LoopKind::Spec => {
            let descriptor: SpecDescriptor = serde_json::from_str(&descriptor_raw)
                .map_err(|e| GyreError::InvalidDescriptor(e.to_string()))?;
            descriptor.validate()?;
            for (i, phase) in descriptor.phases.iter().enumerate() {
                let context = json!({
                    "task": phase.description,
                    "name": phase.name,
                    "title": phase.title,
                    "index": i + 1,
                    "validation": phase.validation,
                });
                children.push(Loop::new_child(
                    parent,
                    child_kind,
                    (i + 1) as u32,
                    kinds.get(child_kind),
                    context,
                    artifact.clone(),
                ));
            }
        }
        LoopKind::Phase => {
            let descriptor: PhaseDescriptor = serde_json::from_str(&descriptor_raw)
                .map_err(|e| GyreError::InvalidDescriptor(e.to_string()))?;
            descriptor.validate()?;
            let tasks: Vec<String> = descriptor.tasks.iter().map(|t| t.description.clone()).collect();
            let context = json!({
                "task": descriptor.objective,
                "name": descriptor.name,
                "title": descriptor.title,
                "tasks": tasks,
            });
            let mut code = Loop::new_child(parent, child_kind, 1, kinds.get(child_kind), context, artifact);
            // The phase names the command that proves its code works
            code.validation_command = descriptor.validation_command.clone();
            children.push(code);
        }
        LoopKind::Code => unreachable!("checked above"),
    }

    for child in &children {
        store.create(child)?;
    }
    Ok(children)
}
