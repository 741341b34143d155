// Locally implemented tools and the seams they plug into.

use crate::protocol::{CallToolResult, ToolSchema};
use serde_json::{json, Value};

mod apply_patch;
mod write;

pub use apply_patch::ApplyPatchTool;
pub use write::WriteTool;

/// The dispatcher capability handed to local tools: issue nested forwarded
/// calls and resolve the project root. Local handlers never talk to the
/// upstream directly; their reads and writes are ordinary tool calls.
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, name: &str, arguments: Value) -> anyhow::Result<CallToolResult>;

    fn project_path(&self) -> &std::path::Path;
}

/// A tool the proxy implements itself.
#[async_trait::async_trait]
pub trait LocalTool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn execute(
        &self,
        arguments: Value,
        forwarder: &dyn Forwarder,
    ) -> anyhow::Result<CallToolResult>;
}

/// Primitive parameter kinds local tools declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
}

impl ParamKind {
    fn json_type(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
        }
    }
}

/// One declared parameter of a local tool.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
}

/// Typed description of a local tool, rendered to a JSON schema for the
/// catalog. Keeping the parameter list typed (rather than a raw JSON blob)
/// lets the dispatcher check `project_path` handling statically.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

impl ToolDescriptor {
    pub fn declares_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    pub fn schema(&self) -> ToolSchema {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(
                param.name.to_string(),
                json!({"type": param.kind.json_type(), "description": param.description}),
            );
            if param.required {
                required.push(param.name);
            }
        }
        ToolSchema {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: Some(json!({
                "type": "object",
                "properties": properties,
                "required": required,
            })),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A [`Forwarder`] backed by a temporary directory, standing in for the
    //! upstream's read/write primitives in local-tool tests.

    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    pub struct DirForwarder {
        root: PathBuf,
        pub calls: Mutex<Vec<String>>,
    }

    impl DirForwarder {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Forwarder for DirForwarder {
        async fn forward(&self, name: &str, arguments: Value) -> anyhow::Result<CallToolResult> {
            self.calls.lock().unwrap().push(name.to_string());
            let path = arguments
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            match name {
                "get_file_text_by_path" => match std::fs::read_to_string(self.root.join(&path)) {
                    Ok(text) => Ok(CallToolResult::text(text)),
                    Err(e) => Ok(CallToolResult::error(format!("file not found: {} ({})", path, e))),
                },
                "create_new_file_with_text" => {
                    let text = arguments
                        .get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    let full = self.root.join(&path);
                    if let Some(parent) = full.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(full, text)?;
                    Ok(CallToolResult::text("ok"))
                }
                other => Ok(CallToolResult::error(format!("unknown tool: {}", other))),
            }
        }

        fn project_path(&self) -> &Path {
            &self.root
        }
    }
}
