//! Command-line surface.
//!
//! Commands map one-to-one onto the control operations. Everything rides
//! the shared store, so inspection and plan creation work whether or not
//! the daemon is up; execution happens inside `gyre daemon`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::control::ControlRequest;

#[derive(Parser, Debug)]
#[command(name = "gyre", about = "Hierarchical self-correcting loop orchestration", version)]
pub struct Cli {
    /// Explicit config file (default: .gyre.yml, then ~/.config/gyre/gyre.yml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine: recovery, scheduler ticks, sweeps
    Daemon,
    /// Create a root plan from task text
    Plan {
        /// What to build
        task: String,
    },
    /// List all loops
    List,
    /// Show one loop
    Get { id: String },
    /// Start a pending loop now (daemon only picks it up on its own tick)
    Start { id: String },
    /// Pause a running loop at its next safe point
    Pause { id: String },
    /// Resume a paused loop
    Resume { id: String },
    /// Cancel a loop
    Cancel { id: String },
    /// Delete a terminal loop and its state
    Delete { id: String },
    /// Approve a plan held for review
    Approve { id: String },
    /// Reject a plan held for review
    Reject {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Send a plan back around with feedback
    Iterate {
        id: String,
        feedback: String,
    },
}

impl Command {
    /// The control request this command maps to; None for `daemon`.
    pub fn to_request(&self) -> Option<ControlRequest> {
        match self {
            Command::Daemon => None,
            Command::Plan { task } => Some(ControlRequest::CreatePlan { task: task.clone() }),
            Command::List => Some(ControlRequest::ListLoops),
            Command::Get { id } => Some(ControlRequest::GetLoop { id: id.clone() }),
            Command::Start { id } => Some(ControlRequest::StartLoop { id: id.clone() }),
            Command::Pause { id } => Some(ControlRequest::PauseLoop { id: id.clone() }),
            Command::Resume { id } => Some(ControlRequest::ResumeLoop { id: id.clone() }),
            Command::Cancel { id } => Some(ControlRequest::CancelLoop { id: id.clone() }),
            Command::Delete { id } => Some(ControlRequest::DeleteLoop { id: id.clone() }),
            Command::Approve { id } => Some(ControlRequest::ApprovePlan { id: id.clone() }),
            Command::Reject { id, reason } => Some(ControlRequest::RejectPlan {
                id: id.clone(),
                reason: reason.clone(),
            }),
            Command::Iterate { id, feedback } => Some(ControlRequest::IteratePlan {
                id: id.clone(),
                feedback: feedback.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daemon() {
        let cli = Cli::parse_from(["gyre", "daemon"]);
        assert!(matches!(cli.command, Command::Daemon));
        assert!(cli.command.to_request().is_none());
    }

    #[test]
    fn test_parse_plan() {
        let cli = Cli::parse_from(["gyre", "plan", "add a counter"]);
        let request = cli.command.to_request().unwrap();
        assert_eq!(
            request,
            ControlRequest::CreatePlan {
                task: "add a counter".to_string()
            }
        );
    }

    #[test]
    fn test_parse_reject_with_reason() {
        let cli = Cli::parse_from(["gyre", "reject", "a1b2", "--reason", "too broad"]);
        let request = cli.command.to_request().unwrap();
        assert_eq!(
            request,
            ControlRequest::RejectPlan {
                id: "a1b2".to_string(),
                reason: Some("too broad".to_string())
            }
        );
    }

    #[test]
    fn test_parse_iterate() {
        let cli = Cli::parse_from(["gyre", "iterate", "a1b2", "missing auth"]);
        assert!(matches!(
            cli.command.to_request(),
            Some(ControlRequest::IteratePlan { .. })
        ));
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["gyre", "--config", "/tmp/g.yml", "list"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/g.yml")));
    }
}
