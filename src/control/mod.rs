//! Control surface.
//!
//! Typed requests, responses, and push events for external controllers.
//! Wire framing is out of scope; a front end embeds the engine and calls
//! [`crate::manager::LoopManager`] with these types directly.

mod events;
mod messages;

pub use events::EventLog;
pub use messages::{ControlEvent, ControlRequest, ControlResponse, MetricsSnapshot};
