//! Worktree lifecycle and the merge serialization point.
//!
//! Every loop works on its own branch in its own worktree. The only place
//! concurrent loops meet is the fast-forward merge onto main, which runs
//! under a process-wide lock backed by a lock file in the repository.

mod merge;
mod ops;
mod sweep;

pub use merge::{MergeGuard, MergeQueue, MergeTicket};
pub use ops::{RebaseOutcome, WorktreeError, WorktreeOps};
pub use sweep::{SweepReport, sweep};
