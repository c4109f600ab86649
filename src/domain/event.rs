//! Observability event records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{event_id, now_ms};

/// Event type constants
pub mod event_types {
    pub const LOOP_CREATED: &str = "loop.created";
    pub const LOOP_STARTED: &str = "loop.started";
    pub const LOOP_STATUS_CHANGE: &str = "loop.status_change";
    pub const ITERATION_STARTED: &str = "iteration.started";
    pub const ITERATION_COMPLETE: &str = "iteration.complete";
    pub const TOOL_CALL: &str = "tool.call";
    pub const VALIDATION_RUN: &str = "validation.run";
    pub const LOOP_COMPLETE: &str = "loop.complete";
    pub const LOOP_FAILED: &str = "loop.failed";
    pub const SIGNAL_EMITTED: &str = "signal.emitted";
    pub const MERGE_COMPLETE: &str = "merge.complete";
    pub const ENGINE_STARTED: &str = "engine.started";
    pub const ENGINE_SHUTDOWN: &str = "engine.shutdown";
}

/// Append-only observability record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: String,
    pub event_type: String,
    pub loop_id: Option<String>,
    pub payload: Value,
    pub created_at: i64,
}

impl EventRecord {
    pub fn new(event_type: &str, loop_id: Option<String>, payload: Value) -> Self {
        Self {
            id: event_id(),
            event_type: event_type.to_string(),
            loop_id,
            payload,
            created_at: now_ms(),
        }
    }

    pub fn loop_created(loop_id: &str, kind: &str) -> Self {
        Self::new(
            event_types::LOOP_CREATED,
            Some(loop_id.to_string()),
            serde_json::json!({ "kind": kind }),
        )
    }

    pub fn loop_started(loop_id: &str) -> Self {
        Self::new(event_types::LOOP_STARTED, Some(loop_id.to_string()), Value::Null)
    }

    pub fn status_change(loop_id: &str, old: &str, new: &str) -> Self {
        Self::new(
            event_types::LOOP_STATUS_CHANGE,
            Some(loop_id.to_string()),
            serde_json::json!({ "old": old, "new": new }),
        )
    }

    pub fn iteration_started(loop_id: &str, iteration: u32) -> Self {
        Self::new(
            event_types::ITERATION_STARTED,
            Some(loop_id.to_string()),
            serde_json::json!({ "iteration": iteration }),
        )
    }

    pub fn iteration_complete(loop_id: &str, iteration: u32, passed: bool) -> Self {
        Self::new(
            event_types::ITERATION_COMPLETE,
            Some(loop_id.to_string()),
            serde_json::json!({ "iteration": iteration, "passed": passed }),
        )
    }

    pub fn tool_call(loop_id: &str, tool_name: &str, lane: &str, status: &str) -> Self {
        Self::new(
            event_types::TOOL_CALL,
            Some(loop_id.to_string()),
            serde_json::json!({ "tool": tool_name, "lane": lane, "status": status }),
        )
    }

    pub fn validation_run(loop_id: &str, iteration: u32, passed: bool) -> Self {
        Self::new(
            event_types::VALIDATION_RUN,
            Some(loop_id.to_string()),
            serde_json::json!({ "iteration": iteration, "passed": passed }),
        )
    }

    pub fn loop_complete(loop_id: &str, iterations: u32) -> Self {
        Self::new(
            event_types::LOOP_COMPLETE,
            Some(loop_id.to_string()),
            serde_json::json!({ "iterations": iterations }),
        )
    }

    pub fn loop_failed(loop_id: &str, reason: &str) -> Self {
        Self::new(
            event_types::LOOP_FAILED,
            Some(loop_id.to_string()),
            serde_json::json!({ "reason": reason }),
        )
    }

    pub fn signal_emitted(signal_id: &str, kind: &str, target: &str) -> Self {
        Self::new(
            event_types::SIGNAL_EMITTED,
            None,
            serde_json::json!({ "signal_id": signal_id, "kind": kind, "target": target }),
        )
    }

    pub fn merge_complete(loop_id: &str, new_head: &str) -> Self {
        Self::new(
            event_types::MERGE_COMPLETE,
            Some(loop_id.to_string()),
            serde_json::json!({ "new_head": new_head }),
        )
    }

    pub fn engine_started() -> Self {
        Self::new(event_types::ENGINE_STARTED, None, Value::Null)
    }

    pub fn engine_shutdown(reason: &str) -> Self {
        Self::new(
            event_types::ENGINE_SHUTDOWN,
            None,
            serde_json::json!({ "reason": reason }),
        )
    }
}
