//! Control message identities.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Loop, SignalRecord};

/// Requests a controller can make.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", content = "params")]
pub enum ControlRequest {
    #[serde(rename = "loop.create_plan")]
    CreatePlan { task: String },
    #[serde(rename = "loop.list")]
    ListLoops,
    #[serde(rename = "loop.get")]
    GetLoop { id: String },
    #[serde(rename = "loop.start")]
    StartLoop { id: String },
    #[serde(rename = "loop.pause")]
    PauseLoop { id: String },
    #[serde(rename = "loop.resume")]
    ResumeLoop { id: String },
    #[serde(rename = "loop.cancel")]
    CancelLoop { id: String },
    #[serde(rename = "loop.delete")]
    DeleteLoop { id: String },
    #[serde(rename = "plan.approve")]
    ApprovePlan { id: String },
    #[serde(rename = "plan.reject")]
    RejectPlan { id: String, reason: Option<String> },
    #[serde(rename = "plan.iterate")]
    IteratePlan { id: String, feedback: String },
}

/// Responses to control requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    PlanCreated { id: String },
    Loops(Vec<Loop>),
    Loop(Box<Loop>),
    ChildrenSpawned { count: usize },
    Error { message: String },
}

/// Aggregate counters pushed with `metrics.update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub running: usize,
    pub pending: usize,
    pub complete: usize,
    pub failed: usize,
    pub invalidated: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

/// Fire-and-forget push events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum ControlEvent {
    #[serde(rename = "loop.updated")]
    LoopUpdated(Box<Loop>),
    #[serde(rename = "loop.iteration")]
    LoopIteration { id: String, iteration: u32, passed: bool },
    #[serde(rename = "plan.awaiting_approval")]
    PlanAwaitingApproval {
        id: String,
        content: String,
        descriptors: Value,
    },
    #[serde(rename = "signal.emitted")]
    SignalEmitted(Box<SignalRecord>),
    #[serde(rename = "metrics.update")]
    MetricsUpdate(MetricsSnapshot),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_identity() {
        let req = ControlRequest::CreatePlan {
            task: "add a counter".to_string(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["method"], "loop.create_plan");
        assert_eq!(v["params"]["task"], "add a counter");
    }

    #[test]
    fn test_request_roundtrip() {
        let req = ControlRequest::RejectPlan {
            id: "p-1".to_string(),
            reason: Some("too broad".to_string()),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ControlRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_event_wire_identity() {
        let event = ControlEvent::LoopIteration {
            id: "l-1".to_string(),
            iteration: 2,
            passed: false,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], "loop.iteration");
        assert_eq!(v["payload"]["iteration"], 2);
    }

    #[test]
    fn test_metrics_default() {
        let m = MetricsSnapshot::default();
        assert_eq!(m.running, 0);
        assert_eq!(m.total_output_tokens, 0);
    }
}
