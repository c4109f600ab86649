//! Audit records for tool dispatches.

use serde::{Deserialize, Serialize};

use crate::id::{job_id, now_ms};

/// Terminal status of a tool job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolJobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ToolJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolJobStatus::Pending => "pending",
            ToolJobStatus::Running => "running",
            ToolJobStatus::Success => "success",
            ToolJobStatus::Failed => "failed",
            ToolJobStatus::Timeout => "timeout",
            ToolJobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ToolJobStatus::Pending | ToolJobStatus::Running)
    }
}

/// One tool dispatch, persisted for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolJobRecord {
    pub id: String,
    pub loop_id: String,
    pub iteration: u32,
    pub tool_name: String,
    /// Lane the job ran in ("no-net", "net", "heavy")
    pub lane: String,
    /// Truncated input summary
    pub input_summary: String,
    /// Truncated output summary
    pub output_summary: String,
    pub status: ToolJobStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// Cap applied to stored input/output summaries.
const SUMMARY_CAP: usize = 1000;

fn summarize(s: &str) -> String {
    if s.len() <= SUMMARY_CAP {
        return s.to_string();
    }
    let mut end = SUMMARY_CAP;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… [truncated]", &s[..end])
}

impl ToolJobRecord {
    pub fn new(loop_id: &str, iteration: u32, tool_name: &str, lane: &str) -> Self {
        Self {
            id: job_id(loop_id, iteration),
            loop_id: loop_id.to_string(),
            iteration,
            tool_name: tool_name.to_string(),
            lane: lane.to_string(),
            input_summary: String::new(),
            output_summary: String::new(),
            status: ToolJobStatus::Pending,
            exit_code: None,
            duration_ms: 0,
            created_at: now_ms(),
            completed_at: None,
        }
    }

    pub fn with_input(mut self, input: &str) -> Self {
        self.input_summary = summarize(input);
        self
    }

    /// Record the terminal outcome.
    pub fn finish(&mut self, status: ToolJobStatus, output: &str, exit_code: Option<i32>, duration_ms: u64) {
        self.status = status;
        self.output_summary = summarize(output);
        self.exit_code = exit_code;
        self.duration_ms = duration_ms;
        self.completed_at = Some(now_ms());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_pending() {
        let job = ToolJobRecord::new("a1b2-001", 2, "run_command", "heavy");
        assert!(job.id.starts_with("job-a1b2-001-2-"));
        assert_eq!(job.status, ToolJobStatus::Pending);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_finish_records_outcome() {
        let mut job = ToolJobRecord::new("l", 0, "run_command", "no-net");
        job.finish(ToolJobStatus::Success, "ok", Some(0), 42);
        assert_eq!(job.status, ToolJobStatus::Success);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.duration_ms, 42);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_summaries_truncated() {
        let long = "x".repeat(5000);
        let job = ToolJobRecord::new("l", 0, "write_file", "no-net").with_input(&long);
        assert!(job.input_summary.len() < 1100);
        assert!(job.input_summary.ends_with("[truncated]"));
    }

    #[test]
    fn test_short_summary_unchanged() {
        let job = ToolJobRecord::new("l", 0, "read_file", "no-net").with_input("src/main.rs");
        assert_eq!(job.input_summary, "src/main.rs");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ToolJobStatus::Success.is_terminal());
        assert!(ToolJobStatus::Timeout.is_terminal());
        assert!(ToolJobStatus::Cancelled.is_terminal());
        assert!(!ToolJobStatus::Running.is_terminal());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut job = ToolJobRecord::new("l-1", 1, "edit_file", "no-net");
        job.finish(ToolJobStatus::Failed, "no such file", Some(1), 7);
        let json = serde_json::to_string(&job).unwrap();
        let back: ToolJobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
    }
}
