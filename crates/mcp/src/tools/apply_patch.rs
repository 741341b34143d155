//! The `apply_patch` tool: parses the patch-text format and applies it
//! through the upstream's read/write primitives plus git rename/delete.

use super::{Forwarder, LocalTool, ParamKind, ParamSpec, ToolDescriptor};
use crate::protocol::CallToolResult;
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use toolgate_core::patch::{parse_patch, FileStore, PatchEngine};

const DESCRIPTION: &str = "Apply a multi-file patch to the project. The patch is a text envelope \
between '*** Begin Patch' and '*** End Patch' containing '*** Add File:', \
'*** Delete File:' and '*** Update File:' operations (the latter optionally \
followed by '*** Move to:'), with '@@' hunks of ' '/'-'/'+' lines. \
Operations apply in order; edits for a file are written only if all of its \
hunks match.";

pub struct ApplyPatchTool;

#[derive(Debug, Deserialize)]
struct ApplyPatchArgs {
    patch: String,
}

#[async_trait]
impl LocalTool for ApplyPatchTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "apply_patch",
            description: DESCRIPTION,
            params: vec![ParamSpec {
                name: "patch",
                kind: ParamKind::String,
                description: "Patch text starting with '*** Begin Patch'",
                required: true,
            }],
        }
    }

    async fn execute(
        &self,
        arguments: Value,
        forwarder: &dyn Forwarder,
    ) -> anyhow::Result<CallToolResult> {
        let args: ApplyPatchArgs =
            serde_json::from_value(arguments).context("invalid arguments for apply_patch")?;

        let patch = match parse_patch(&args.patch) {
            Ok(patch) => patch,
            Err(err) => return Ok(CallToolResult::error(format!("apply_patch: {}", err))),
        };

        let store = ForwardedFileStore { forwarder };
        let engine = PatchEngine::new(forwarder.project_path(), &store);
        match engine.apply(&patch).await {
            Ok(summary) => Ok(CallToolResult::text(summary.join("\n"))),
            Err(err) => Ok(CallToolResult::error(format!("apply_patch: {}", err))),
        }
    }
}

/// File access for the patch engine, routed through forwarded tool calls so
/// every read and write is visible to the upstream like any other edit.
struct ForwardedFileStore<'a> {
    forwarder: &'a dyn Forwarder,
}

#[async_trait]
impl FileStore for ForwardedFileStore<'_> {
    async fn read_text(&self, path: &str) -> anyhow::Result<String> {
        let result = self
            .forwarder
            .forward("get_file_text_by_path", json!({"path": path}))
            .await?;
        if result.is_err() {
            bail!("{}", result.joined_text());
        }
        Ok(result.joined_text())
    }

    async fn write_text(&self, path: &str, text: &str) -> anyhow::Result<()> {
        let result = self
            .forwarder
            .forward("create_new_file_with_text", json!({"path": path, "text": text}))
            .await?;
        if result.is_err() {
            bail!("{}", result.joined_text());
        }
        Ok(())
    }
}
