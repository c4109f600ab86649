//! Gyre - hierarchical, self-correcting loop orchestration.
//!
//! Gyre runs fleets of concurrent "loops", each iterating an LLM with
//! fresh context until a validation command passes. Plans spawn specs,
//! specs spawn phases, phases spawn code loops; every loop works in an
//! isolated git worktree, and the only serialization point between
//! siblings is the fast-forward merge onto main.

pub mod cli;
pub mod config;
pub mod control;
pub mod domain;
pub mod driver;
pub mod engine;
pub mod error;
pub mod id;
pub mod llm;
pub mod manager;
pub mod paths;
pub mod signals;
pub mod store;
pub mod tools;
pub mod worktree;

pub use engine::Engine;
pub use error::{GyreError, Result};
