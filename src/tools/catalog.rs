//! Static tool catalog.
//!
//! Each tool binds a name, an input schema for the model, a lane, and
//! execution limits. Which tools a loop sees depends on its kind: document
//! kinds get the artifact emitter, Code loops do not.

use std::collections::HashMap;

use serde_json::{Value, json};

use super::lane::Lane;
use crate::domain::LoopKind;
use crate::llm::ToolSchema;

/// The typed descriptor emitter; intercepted by the driver, never routed.
pub const CREATE_ARTIFACT_TOOL: &str = "create_artifact";

/// One catalog entry.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub lane: Lane,
    pub timeout_ms: Option<u64>,
    pub output_cap_bytes: Option<usize>,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, lane: Lane) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: json!({ "type": "object", "properties": {}, "required": [] }),
            lane,
            timeout_ms: None,
            output_cap_bytes: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_output_cap(mut self, bytes: usize) -> Self {
        self.output_cap_bytes = Some(bytes);
        self
    }

    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or_else(|| self.lane.default_timeout_ms())
    }

    pub fn to_schema(&self) -> ToolSchema {
        ToolSchema::new(self.name.clone(), self.description.clone(), self.input_schema.clone())
    }
}

/// Name → tool lookup plus per-kind visibility.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: HashMap<String, Tool>,
}

impl ToolCatalog {
    /// The built-in catalog.
    pub fn builtin() -> Self {
        let mut tools = HashMap::new();
        for tool in [
            Tool::new("read_file", "Read a file from the worktree, with line numbers.", Lane::NoNet).with_schema(
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Path relative to the worktree" },
                        "offset": { "type": "integer", "description": "First line to read (0-based)" },
                        "limit": { "type": "integer", "description": "Maximum lines to read" }
                    },
                    "required": ["path"]
                }),
            ),
            Tool::new("write_file", "Create or overwrite a file in the worktree.", Lane::NoNet).with_schema(json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the worktree" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            })),
            Tool::new(
                "edit_file",
                "Replace an exact string in a file. The match must be unique.",
                Lane::NoNet,
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_string": { "type": "string" },
                    "new_string": { "type": "string" }
                },
                "required": ["path", "old_string", "new_string"]
            })),
            Tool::new("list_directory", "List a directory in the worktree.", Lane::NoNet).with_schema(json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory relative to the worktree root" }
                },
                "required": []
            })),
            Tool::new("run_command", "Run a shell command in the worktree.", Lane::NoNet).with_schema(json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" }
                },
                "required": ["command"]
            })),
            Tool::new("fetch_url", "Fetch a URL and return the response body.", Lane::Net).with_schema(json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string" }
                },
                "required": ["url"]
            })),
            Tool::new(
                "run_validation",
                "Run a long build or test command in the worktree.",
                Lane::Heavy,
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" }
                },
                "required": ["command"]
            })),
            Tool::new(
                CREATE_ARTIFACT_TOOL,
                "Write the artifact for this loop: the rendered markdown plus the structured \
                 descriptor used to spawn children. Call exactly once when the work is complete.",
                Lane::NoNet,
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "filename": { "type": "string", "description": "Artifact file name, e.g. plan.md" },
                    "content": { "type": "string", "description": "Rendered markdown for human review" },
                    "descriptor": { "type": "object", "description": "Structured child definitions" }
                },
                "required": ["filename", "content", "descriptor"]
            })),
        ] {
            tools.insert(tool.name.clone(), tool);
        }
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Add or replace a tool (configuration overrides, tests).
    pub fn insert(&mut self, tool: Tool) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn lane_for(&self, name: &str) -> Option<Lane> {
        self.get(name).map(|t| t.lane)
    }

    /// Tool schemas visible to a loop kind.
    pub fn schemas_for_kind(&self, kind: LoopKind) -> Vec<ToolSchema> {
        let names: &[&str] = match kind {
            LoopKind::Plan | LoopKind::Spec | LoopKind::Phase => &[
                "read_file",
                "write_file",
                "list_directory",
                "run_command",
                CREATE_ARTIFACT_TOOL,
            ],
            LoopKind::Code => &[
                "read_file",
                "write_file",
                "edit_file",
                "list_directory",
                "run_command",
                "fetch_url",
                "run_validation",
            ],
        };
        names
            .iter()
            .filter_map(|name| self.get(name))
            .map(Tool::to_schema)
            .collect()
    }
}
