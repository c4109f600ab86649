//! Merge snapshots.
//!
//! One record per successful fast-forward onto main. The append order of
//! these records is the total order of merges.

use serde::{Deserialize, Serialize};

use crate::id::{merge_id, now_ms};

/// Snapshot of one fast-forward merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeRecord {
    pub id: String,
    /// Loop whose branch was merged
    pub loop_id: String,
    /// Main head before the merge
    pub pre_merge_head: String,
    /// Main head after the merge
    pub post_merge_head: String,
    /// Files changed by the merge
    pub files_changed: u32,
    pub created_at: i64,
}

impl MergeRecord {
    pub fn new(loop_id: &str, pre: &str, post: &str, files_changed: u32) -> Self {
        Self {
            id: merge_id(),
            loop_id: loop_id.to_string(),
            pre_merge_head: pre.to_string(),
            post_merge_head: post.to_string(),
            files_changed,
            created_at: now_ms(),
        }
    }
}
