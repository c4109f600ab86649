//! Core domain records.
//!
//! - `Loop`: one unit of iterative work, the primary persistent entity
//! - `SignalRecord`: persistent coordination message between loops
//! - `ToolJobRecord`: audit trail of tool dispatches
//! - `EventRecord`: observability stream
//! - `MergeRecord`: snapshot of each fast-forward onto main
//! - descriptors: typed child definitions emitted via the artifact tool

pub mod descriptor;
pub mod event;
pub mod loop_record;
pub mod merge;
pub mod outcome;
pub mod signal;
pub mod tool_job;

pub use descriptor::{
    FileAction, PhaseDescriptor, PhaseEntry, PlanDescriptor, SpecDescriptor, SpecEntry, TaskEntry,
};
pub use event::{EventRecord, event_types};
pub use loop_record::{Loop, LoopKind, LoopStatus};
pub use merge::MergeRecord;
pub use outcome::LoopOutcome;
pub use signal::{Selector, SignalKind, SignalRecord};
pub use tool_job::{ToolJobRecord, ToolJobStatus};
