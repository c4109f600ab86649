//! Shared fixtures: a scripted gateway and an engine wired into temp dirs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

use gyre::Engine;
use gyre::config::GyreConfig;
use gyre::llm::{
    CompletionRequest, CompletionResponse, LlmError, LlmGateway, StopReason, StreamEvent, TokenUsage,
    ToolCall,
};
use gyre::paths::ProjectPaths;

/// Gateway that answers by loop kind (sniffed from the system prompt) and
/// records every request for invariant checks.
pub struct MockGateway {
    pub requests: Mutex<Vec<CompletionRequest>>,
    counter: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every recorded request must carry exactly one user task message at
    /// the start of its turn (fresh-context invariant). Turn continuations
    /// are the only requests with more.
    pub fn assert_fresh_context(&self) {
        for request in self.requests.lock().unwrap().iter() {
            assert_eq!(
                request.messages.len(),
                1,
                "iteration request carried conversation history"
            );
        }
    }

    fn artifact_response(&self, kind: &str) -> CompletionResponse {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let overview = "A thorough overview of the work, long enough to satisfy the document \
                        format checks that guard against empty artifacts. "
            .repeat(3);
        let (filename, content, descriptor) = match kind {
            "plan" => (
                "plan.md",
                format!("# Plan\n\n## Overview\n\n{}\n\n## Specs\n\n- core\n", overview),
                json!({
                    "title": "Plan",
                    "overview": "the plan",
                    "specs": [{"name": "core", "title": "Core", "description": "implement the core"}]
                }),
            ),
            "spec" => (
                "spec.md",
                format!("# Spec\n\n## Overview\n\n{}\n\n## Phases\n\n- one\n- two\n- three\n", overview),
                json!({
                    "name": "core", "title": "Core", "overview": "the core spec",
                    "phases": [
                        {"name": "model", "title": "Model", "description": "build the model"},
                        {"name": "logic", "title": "Logic", "description": "build the logic"},
                        {"name": "wire", "title": "Wire", "description": "wire it up"}
                    ]
                }),
            ),
            _ => (
                "phase.md",
                format!("# Phase\n\n## Objective\n\n{}\n\n## Tasks\n\n- do the thing\n", overview),
                json!({
                    "name": "model", "title": "Model", "objective": "build the model",
                    "tasks": [{"description": "add the module", "file": "src/m.rs", "action": "create"}],
                    "validation_command": "true"
                }),
            ),
        };
        CompletionResponse {
            content: Some("emitting artifact".to_string()),
            tool_calls: vec![ToolCall {
                id: format!("tu_{}", n),
                name: "create_artifact".to_string(),
                input: json!({ "filename": filename, "content": content, "descriptor": descriptor }),
            }],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
        }
    }

    fn code_response(&self) -> CompletionResponse {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        CompletionResponse {
            content: Some("writing the change".to_string()),
            tool_calls: vec![ToolCall {
                id: format!("tu_{}", n),
                name: "write_file".to_string(),
                input: json!({
                    "path": format!("change_{}.txt", n),
                    "content": format!("change number {}", n)
                }),
            }],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
        }
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        // Continuations (tool results attached) end the turn immediately
        let is_continuation = request.messages.len() > 1;
        let system = request.system_prompt.clone();
        self.requests.lock().unwrap().push(request);
        if is_continuation {
            return Ok(CompletionResponse {
                content: Some("done".to_string()),
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage::default(),
            });
        }
        let response = if system.contains("planning") {
            self.artifact_response("plan")
        } else if system.contains("specification from a plan") {
            self.artifact_response("spec")
        } else if system.contains("specification phase") {
            self.artifact_response("phase")
        } else {
            self.code_response()
        };
        Ok(response)
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        _sink: mpsc::Sender<StreamEvent>,
    ) -> Result<CompletionResponse, LlmError> {
        self.complete(request).await
    }
}

/// Run a git command in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git not available");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Initialize a repository with an initial commit on `main`.
pub fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "--initial-branch=main"]);
    git(dir, &["config", "user.name", "gyre-test"]);
    git(dir, &["config", "user.email", "gyre-test@example.com"]);
    std::fs::write(dir.join("README.md"), "test repository\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "initial"]);
}

/// Fast test configuration: tight deadlines, permissive validation.
pub fn test_config() -> GyreConfig {
    let mut config = GyreConfig::default();
    config.scheduler.poll_interval_ms = 50;
    config.scheduler.max_concurrent = 8;
    config.worktree.rebase_ack_deadline_secs = 1;
    config.coordination.ack_deadline_secs = 1;
    for kind in [
        &mut config.kinds.plan,
        &mut config.kinds.spec,
        &mut config.kinds.phase,
        &mut config.kinds.code,
    ] {
        kind.validation_command = "true".to_string();
        kind.max_iterations = 3;
    }
    config
}

/// An engine over temp dirs with a real git repo and the mock gateway.
pub struct TestEngine {
    pub engine: Engine,
    pub gateway: Arc<MockGateway>,
    pub config: GyreConfig,
    pub repo: PathBuf,
    _tmp: TempDir,
}

impl TestEngine {
    pub fn new(config: GyreConfig) -> Self {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        init_repo(&repo);

        let paths = ProjectPaths::new(&tmp.path().join("data"), &repo).unwrap();
        let gateway = Arc::new(MockGateway::new());
        let engine = Engine::with_gateway(&config, &repo, paths, gateway.clone()).unwrap();
        Self {
            engine,
            gateway,
            config,
            repo,
            _tmp: tmp,
        }
    }
}
