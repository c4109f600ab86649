//! Tool dispatch.
//!
//! The router resolves a call's lane, validates every path against the
//! loop's worktree, runs the tool under the lane's concurrency budget, and
//! caps output. Subprocesses run in their own process group so cancellation
//! and timeouts kill transitive children too.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::catalog::{CREATE_ARTIFACT_TOOL, Tool, ToolCatalog};
use super::lane::{Lane, LanePools};
use crate::domain::ToolJobStatus;
use crate::error::{GyreError, Result};
use crate::llm::ToolCall;

/// Default output cap when neither the tool nor the caller sets one.
const DEFAULT_OUTPUT_CAP: usize = 100_000;

/// Marker appended when output is cut at the cap.
const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Where a tool call executes.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub worktree: PathBuf,
    pub loop_id: String,
    pub iteration: u32,
}

/// Structured result of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub status: ToolJobStatus,
    pub output: String,
    pub exit_code: Option<i32>,
    pub was_timeout: bool,
    pub was_cancelled: bool,
    pub duration_ms: u64,
}

impl ToolResult {
    fn success(output: String) -> Self {
        Self {
            status: ToolJobStatus::Success,
            output,
            exit_code: None,
            was_timeout: false,
            was_cancelled: false,
            duration_ms: 0,
        }
    }

    fn failed(output: String) -> Self {
        Self {
            status: ToolJobStatus::Failed,
            output,
            exit_code: None,
            was_timeout: false,
            was_cancelled: false,
            duration_ms: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != ToolJobStatus::Success
    }
}

struct RunningJob {
    loop_id: String,
    cancel: Arc<Notify>,
    cancel_requested: Arc<AtomicBool>,
}

/// Resolve `candidate` (relative to `worktree`) and refuse anything that
/// escapes the worktree. Non-existent leaves are allowed as long as the
/// nearest existing ancestor canonicalizes inside the worktree.
pub fn resolve_sandboxed(worktree: &Path, candidate: &str) -> Result<PathBuf> {
    let joined = if Path::new(candidate).is_absolute() {
        PathBuf::from(candidate)
    } else {
        worktree.join(candidate)
    };

    // Reject traversal before touching the filesystem
    let mut depth: i64 = 0;
    for component in joined.strip_prefix(worktree).unwrap_or(&joined).components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(GyreError::SandboxViolation(format!(
                "{} escapes the worktree",
                candidate
            )));
        }
    }

    let worktree_canonical = worktree
        .canonicalize()
        .map_err(|e| GyreError::SandboxViolation(format!("worktree unavailable: {}", e)))?;

    // Canonicalize the nearest existing ancestor, keep the remainder as-is
    let mut existing = joined.clone();
    let mut remainder = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_owned());
                existing = parent.to_path_buf();
            }
            _ => {
                return Err(GyreError::SandboxViolation(format!("{} has no existing ancestor", candidate)));
            }
        }
    }
    let mut resolved = existing
        .canonicalize()
        .map_err(|e| GyreError::SandboxViolation(format!("{}: {}", candidate, e)))?;
    for part in remainder.iter().rev() {
        resolved.push(part);
    }

    if !resolved.starts_with(&worktree_canonical) {
        return Err(GyreError::SandboxViolation(format!(
            "{} resolves outside the worktree",
            candidate
        )));
    }
    Ok(resolved)
}

/// Dispatches tool calls into lane worker pools.
pub struct ToolRouter {
    catalog: ToolCatalog,
    pools: LanePools,
    running: Mutex<HashMap<String, RunningJob>>,
    output_cap: usize,
}

impl ToolRouter {
    pub fn new(catalog: ToolCatalog, pools: LanePools) -> Self {
        Self {
            catalog,
            pools,
            running: Mutex::new(HashMap::new()),
            output_cap: DEFAULT_OUTPUT_CAP,
        }
    }

    pub fn with_output_cap(mut self, bytes: usize) -> Self {
        self.output_cap = bytes;
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Lane a tool would run in.
    pub fn lane_for(&self, tool_name: &str) -> Option<Lane> {
        self.catalog.lane_for(tool_name)
    }

    fn cap_output(&self, tool: &Tool, mut output: String) -> String {
        let cap = tool.output_cap_bytes.unwrap_or(self.output_cap);
        if output.len() > cap {
            let mut end = cap;
            while !output.is_char_boundary(end) {
                end -= 1;
            }
            output.truncate(end);
            output.push_str(TRUNCATION_MARKER);
        }
        output
    }

    /// Cancel every in-flight job owned by a loop. Returns how many were
    /// signalled.
    pub fn cancel_loop_jobs(&self, loop_id: &str) -> usize {
        let running = self.running.lock().expect("router registry poisoned");
        let mut count = 0;
        for job in running.values() {
            if job.loop_id == loop_id {
                job.cancel_requested.store(true, Ordering::SeqCst);
                job.cancel.notify_waiters();
                count += 1;
            }
        }
        count
    }

    /// Execute one tool call to completion.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ExecutionContext) -> Result<ToolResult> {
        if call.name == CREATE_ARTIFACT_TOOL {
            // The driver intercepts this before routing
            return Ok(ToolResult::failed(format!(
                "{} is handled by the engine, not the router",
                CREATE_ARTIFACT_TOOL
            )));
        }

        let tool = self
            .catalog
            .get(&call.name)
            .ok_or_else(|| GyreError::Tool(format!("unknown tool: {}", call.name)))?
            .clone();

        if !ctx.worktree.exists() {
            return Err(GyreError::Tool(format!(
                "worktree missing for {}: {}",
                ctx.loop_id,
                ctx.worktree.display()
            )));
        }

        let started = Instant::now();
        let _permit = self.pools.acquire(tool.lane).await;
        debug!(tool = %call.name, lane = tool.lane.as_str(), loop_id = %ctx.loop_id, "dispatching tool");

        let mut result = match call.name.as_str() {
            "read_file" => self.exec_read_file(call, ctx).await,
            "write_file" => self.exec_write_file(call, ctx).await,
            "edit_file" => self.exec_edit_file(call, ctx).await,
            "list_directory" => self.exec_list_directory(call, ctx).await,
            "run_command" | "run_validation" => self.exec_command(&tool, call, ctx).await,
            "fetch_url" => self.exec_fetch_url(call).await,
            other => Ok(ToolResult::failed(format!("tool '{}' is not implemented", other))),
        }?;

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.output = self.cap_output(&tool, result.output);
        Ok(result)
    }

    fn input_str<'a>(call: &'a ToolCall, field: &str) -> Result<&'a str> {
        call.input
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| GyreError::Tool(format!("{}: missing '{}' parameter", call.name, field)))
    }

    async fn exec_read_file(&self, call: &ToolCall, ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = resolve_sandboxed(&ctx.worktree, Self::input_str(call, "path")?)?;
        let offset = call.input.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = call.input.get("limit").and_then(|v| v.as_u64()).unwrap_or(2000) as usize;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => return Ok(ToolResult::failed(format!("cannot read {}: {}", path.display(), e))),
        };
        let numbered: Vec<String> = content
            .lines()
            .skip(offset)
            .take(limit)
            .enumerate()
            .map(|(i, line)| format!("{:>6}  {}", offset + i + 1, line))
            .collect();
        Ok(ToolResult::success(numbered.join("\n")))
    }

    async fn exec_write_file(&self, call: &ToolCall, ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = resolve_sandboxed(&ctx.worktree, Self::input_str(call, "path")?)?;
        let content = Self::input_str(call, "content")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => Ok(ToolResult::success(format!(
                "wrote {} bytes to {}",
                content.len(),
                path.display()
            ))),
            Err(e) => Ok(ToolResult::failed(format!("cannot write {}: {}", path.display(), e))),
        }
    }

    async fn exec_edit_file(&self, call: &ToolCall, ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = resolve_sandboxed(&ctx.worktree, Self::input_str(call, "path")?)?;
        let old_string = Self::input_str(call, "old_string")?;
        let new_string = Self::input_str(call, "new_string")?;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => return Ok(ToolResult::failed(format!("cannot read {}: {}", path.display(), e))),
        };
        let matches = content.matches(old_string).count();
        if matches == 0 {
            return Ok(ToolResult::failed("old_string not found".to_string()));
        }
        if matches > 1 {
            return Ok(ToolResult::failed(format!(
                "old_string matches {} times; must be unique",
                matches
            )));
        }
        let updated = content.replacen(old_string, new_string, 1);
        tokio::fs::write(&path, updated).await?;
        Ok(ToolResult::success(format!("edited {}", path.display())))
    }

    async fn exec_list_directory(&self, call: &ToolCall, ctx: &ExecutionContext) -> Result<ToolResult> {
        let rel = call.input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let path = resolve_sandboxed(&ctx.worktree, rel)?;

        let mut reader = match tokio::fs::read_dir(&path).await {
            Ok(reader) => reader,
            Err(e) => return Ok(ToolResult::failed(format!("cannot list {}: {}", path.display(), e))),
        };
        let mut names = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(ToolResult::success(names.join("\n")))
    }

    async fn exec_fetch_url(&self, call: &ToolCall) -> Result<ToolResult> {
        let url = Self::input_str(call, "url")?;
        match reqwest::get(url).await {
            Ok(response) => {
                let status = response.status();
                match response.text().await {
                    Ok(body) if status.is_success() => Ok(ToolResult::success(body)),
                    Ok(body) => Ok(ToolResult::failed(format!("{}: {}", status, body))),
                    Err(e) => Ok(ToolResult::failed(format!("cannot read body: {}", e))),
                }
            }
            Err(e) => Ok(ToolResult::failed(format!("fetch failed: {}", e))),
        }
    }

    /// Run a shell command in its own process group with timeout and
    /// cancellation. Kills the whole group on either.
    async fn exec_command(&self, tool: &Tool, call: &ToolCall, ctx: &ExecutionContext) -> Result<ToolResult> {
        let command_text = Self::input_str(call, "command")?;
        let timeout = Duration::from_millis(tool.effective_timeout_ms());

        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(command_text)
            .current_dir(&ctx.worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| GyreError::Tool(format!("failed to spawn: {}", e)))?;
        let pid = child.id();

        let cancel = Arc::new(Notify::new());
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let job_key = format!("{}:{}", ctx.loop_id, crate::id::job_id(&ctx.loop_id, ctx.iteration));
        {
            let mut running = self.running.lock().expect("router registry poisoned");
            running.insert(
                job_key.clone(),
                RunningJob {
                    loop_id: ctx.loop_id.clone(),
                    cancel: cancel.clone(),
                    cancel_requested: cancel_requested.clone(),
                },
            );
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_end(&mut buf).await;
            }
            buf
        });

        let mut was_timeout = false;
        let mut was_cancelled = false;
        // A cancel raised before this point would miss the Notify wakeup
        let status = if cancel_requested.load(Ordering::SeqCst) {
            was_cancelled = true;
            Self::kill_group(pid);
            let _ = child.wait().await;
            None
        } else {
            tokio::select! {
                status = child.wait() => Some(status?),
                _ = tokio::time::sleep(timeout) => {
                    was_timeout = true;
                    Self::kill_group(pid);
                    let _ = child.wait().await;
                    None
                }
                _ = cancel.notified() => {
                    was_cancelled = true;
                    Self::kill_group(pid);
                    let _ = child.wait().await;
                    None
                }
            }
        };

        // A cancel that raced the natural exit still reports cancelled
        if cancel_requested.load(Ordering::SeqCst) {
            was_cancelled = true;
        }
        {
            let mut running = self.running.lock().expect("router registry poisoned");
            running.remove(&job_key);
        }

        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();
        let mut output = String::from_utf8_lossy(&stdout_bytes).to_string();
        if !stderr_bytes.is_empty() {
            if !output.is_empty() {
                output.push_str("\n--- stderr ---\n");
            }
            output.push_str(&String::from_utf8_lossy(&stderr_bytes));
        }

        let (job_status, exit_code) = if was_cancelled {
            (ToolJobStatus::Cancelled, None)
        } else if was_timeout {
            warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
            (ToolJobStatus::Timeout, None)
        } else {
            let status = status.expect("status present when not killed");
            let code = status.code();
            if status.success() {
                (ToolJobStatus::Success, code)
            } else {
                (ToolJobStatus::Failed, code)
            }
        };

        Ok(ToolResult {
            status: job_status,
            output,
            exit_code,
            was_timeout,
            was_cancelled,
            duration_ms: 0, // set by dispatch
        })
    }

    #[cfg(unix)]
    fn kill_group(pid: Option<u32>) {
        if let Some(pid) = pid {
            let _ = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn kill_group(_pid: Option<u32>) {}
}
