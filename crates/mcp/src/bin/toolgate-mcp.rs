// Standalone proxy binary: stdio MCP server in front of a JetBrains IDE.

use anyhow::{Context, Result};
use std::sync::Arc;
use toolgate_core::ProxyConfig;
use toolgate_mcp::{Dispatcher, McpServer, UpstreamClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = Arc::new(ProxyConfig::load().context("Failed to load configuration")?);
    tracing::info!(
        mode = %config.tool_mode,
        first_port = config.first_port,
        ports_count = config.ports_count,
        project_path = %config.project_path.display(),
        "toolgate starting"
    );

    let upstream =
        Arc::new(UpstreamClient::new(config.clone()).context("Failed to create upstream client")?);
    let dispatcher = Dispatcher::new(config, upstream);

    McpServer::new(dispatcher).run().await
}
