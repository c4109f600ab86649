//! Tool routing.
//!
//! Tool calls resolve to a lane (no-net, net, heavy), pass a path sandbox
//! check, and execute under that lane's concurrency budget with a timeout
//! and an output cap. Cancellation kills the whole process group.

mod catalog;
mod lane;
mod router;

pub use catalog::{CREATE_ARTIFACT_TOOL, Tool, ToolCatalog};
pub use lane::{Lane, LanePools};
pub use router::{ExecutionContext, ToolResult, ToolRouter};
