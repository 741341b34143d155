//! Static tool catalog tables, per client mode.
//!
//! The registry is pure data assembled at startup: which tools the proxy
//! implements itself for a given mode, which upstream names are blocked
//! outright, and which upstream names are hidden because a local tool covers
//! the same capability. No I/O happens here.

use crate::protocol::ToolSchema;
use crate::tools::{ApplyPatchTool, LocalTool, WriteTool};
use std::sync::Arc;
use toolgate_core::ToolMode;

/// Upstream names that must never be called through the proxy. Direct text
/// replacement bypasses the patch/write flow, so both raw editing tools are
/// rejected regardless of mode.
const BLOCKED_TOOLS: &[&str] = &["replace_file_text_by_path", "replace_specific_text"];

/// Upstream names hidden from the merged catalog because a local tool covers
/// the capability. Still reachable for the proxy's own nested calls.
const REPLACED_TOOLS: &[&str] = &["create_new_file_with_text"];

/// The active catalog view for one proxy instance.
pub struct ToolRegistry {
    mode: ToolMode,
    local: Vec<Arc<dyn LocalTool>>,
}

impl ToolRegistry {
    pub fn for_mode(mode: ToolMode) -> Self {
        let local: Vec<Arc<dyn LocalTool>> = match mode {
            ToolMode::Codex => vec![Arc::new(ApplyPatchTool)],
            ToolMode::Cc => vec![Arc::new(WriteTool)],
        };
        Self { mode, local }
    }

    pub fn mode(&self) -> ToolMode {
        self.mode
    }

    /// Blocked names are rejected in every mode.
    pub fn is_blocked(name: &str) -> bool {
        BLOCKED_TOOLS.contains(&name)
    }

    /// The tool a client should use instead of a blocked one.
    pub fn blocked_substitute(&self) -> &'static str {
        match self.mode {
            ToolMode::Codex => "apply_patch",
            ToolMode::Cc => "write",
        }
    }

    pub fn blocked_message(&self, name: &str) -> String {
        format!(
            "Tool '{}' is not available through this proxy; use '{}' instead.",
            name,
            self.blocked_substitute()
        )
    }

    pub fn local_handler(&self, name: &str) -> Option<Arc<dyn LocalTool>> {
        self.local
            .iter()
            .find(|tool| tool.descriptor().name == name)
            .cloned()
    }

    /// The merged catalog: local tools for this mode, then upstream tools
    /// minus blocked names, replaced names, and anything a local tool shadows.
    pub fn visible_tools(&self, upstream: &[ToolSchema]) -> Vec<ToolSchema> {
        let mut tools: Vec<ToolSchema> =
            self.local.iter().map(|tool| tool.descriptor().schema()).collect();
        for schema in upstream {
            let name = schema.name.as_str();
            if Self::is_blocked(name)
                || REPLACED_TOOLS.contains(&name)
                || tools.iter().any(|t| t.name == name)
            {
                continue;
            }
            tools.push(schema.clone());
        }
        tools
    }
}
