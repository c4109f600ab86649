//! Coordination signals.
//!
//! A signal targets either one loop (`target_loop`) or a set through a
//! selector (`target_selector`), never both. It stays visible to its
//! targets until acknowledged; acknowledgment is set once.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{now_ms, signal_id};

/// Signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Terminate at the next safe point
    Stop,
    /// Suspend execution (resumable)
    Pause,
    /// Continue a paused loop
    Resume,
    /// A sibling merged; rebase onto the new main head
    Rebase,
    /// Ancestor re-iterated; work is stale
    Invalidate,
    /// Report a problem upstream
    Error,
    /// Advisory
    Info,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Stop => "stop",
            SignalKind::Pause => "pause",
            SignalKind::Resume => "resume",
            SignalKind::Rebase => "rebase",
            SignalKind::Invalidate => "invalidate",
            SignalKind::Error => "error",
            SignalKind::Info => "info",
        }
    }
}

/// A persistent coordination message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalRecord {
    pub id: String,
    pub kind: SignalKind,
    /// Originating loop, if any
    pub source_loop: Option<String>,
    /// Specific recipient; exclusive with `target_selector`
    pub target_loop: Option<String>,
    /// Selector form: `descendants:<id>`, `children:<id>`, `kind:<k>`, `status:<s>`
    pub target_selector: Option<String>,
    /// Human-readable cause
    pub reason: String,
    /// Kind-specific data (e.g. rebase: new main head + summary)
    pub payload: Option<Value>,
    pub created_at: i64,
    /// Set once when the target processes the signal
    pub acknowledged_at: Option<i64>,
}

impl SignalRecord {
    pub fn new(kind: SignalKind, reason: impl Into<String>) -> Self {
        Self {
            id: signal_id(),
            kind,
            source_loop: None,
            target_loop: None,
            target_selector: None,
            reason: reason.into(),
            payload: None,
            created_at: now_ms(),
            acknowledged_at: None,
        }
    }

    pub fn from_loop(mut self, loop_id: impl Into<String>) -> Self {
        self.source_loop = Some(loop_id.into());
        self
    }

    pub fn to_loop(mut self, loop_id: impl Into<String>) -> Self {
        self.target_loop = Some(loop_id.into());
        self
    }

    pub fn to_selector(mut self, selector: impl Into<String>) -> Self {
        self.target_selector = Some(selector.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    /// Signals that terminate the target loop.
    pub fn is_terminal_for_target(&self) -> bool {
        matches!(self.kind, SignalKind::Stop | SignalKind::Invalidate)
    }
}

/// Selector patterns a signal can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Any loop whose parent chain reaches the id
    Descendants(String),
    /// Loops with `parent_id` equal to the id
    Children(String),
    /// Loops of a kind
    Kind(String),
    /// Loops currently in a status
    Status(String),
}

impl Selector {
    /// Parse `descendants:<id>` / `children:<id>` / `kind:<k>` / `status:<s>`.
    pub fn parse(s: &str) -> Option<Self> {
        let (head, rest) = s.split_once(':')?;
        if rest.is_empty() {
            return None;
        }
        match head {
            "descendants" => Some(Selector::Descendants(rest.to_string())),
            "children" => Some(Selector::Children(rest.to_string())),
            "kind" => Some(Selector::Kind(rest.to_string())),
            "status" => Some(Selector::Status(rest.to_string())),
            _ => None,
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Descendants(id) => write!(f, "descendants:{}", id),
            Selector::Children(id) => write!(f, "children:{}", id),
            Selector::Kind(k) => write!(f, "kind:{}", k),
            Selector::Status(s) => write!(f, "status:{}", s),
        }
    }
}
