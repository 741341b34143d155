//! The `write` tool (cc mode): create or overwrite one file.
//!
//! A thin local wrapper over the upstream create/overwrite primitive. It
//! exists so the cc catalog has a stable name with a stable schema while the
//! raw upstream tool stays hidden.

use super::{Forwarder, LocalTool, ParamKind, ParamSpec, ToolDescriptor};
use crate::protocol::CallToolResult;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct WriteTool;

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    text: String,
}

#[async_trait]
impl LocalTool for WriteTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "write",
            description: "Create or overwrite a file with the given text. \
Parent directories are created as needed.",
            params: vec![
                ParamSpec {
                    name: "path",
                    kind: ParamKind::String,
                    description: "Project-relative path of the file",
                    required: true,
                },
                ParamSpec {
                    name: "text",
                    kind: ParamKind::String,
                    description: "Full new content of the file",
                    required: true,
                },
            ],
        }
    }

    async fn execute(
        &self,
        arguments: Value,
        forwarder: &dyn Forwarder,
    ) -> anyhow::Result<CallToolResult> {
        let args: WriteArgs =
            serde_json::from_value(arguments).context("invalid arguments for write")?;
        forwarder
            .forward(
                "create_new_file_with_text",
                json!({"path": args.path, "text": args.text}),
            )
            .await
    }
}
