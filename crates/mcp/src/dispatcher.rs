//! The call dispatcher.
//!
//! Resolves every `tools/call` against the registry (blocked, local, or
//! forwarded), injects contextual parameters, and enforces the timeout and
//! at-most-once delivery rules for forwarded calls. All failures are
//! recovered here into well-formed tool-call error results; nothing escapes
//! to the server loop.
//!
//! A forwarded call walks a small state machine: dispatched, then exactly
//! one of resolved / timed out / reconnecting-once. The pending-call map is
//! what keeps the terminal states mutually exclusive when the upstream
//! response and the deadline fire together.

use crate::pending::PendingCalls;
use crate::protocol::{CallToolResult, JsonRpcResponse, ListToolsResult};
use crate::registry::ToolRegistry;
use crate::tools::Forwarder;
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamSession};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use toolgate_core::{ProxyConfig, Workaround};
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Dispatcher {
    config: Arc<ProxyConfig>,
    registry: ToolRegistry,
    upstream: Arc<UpstreamClient>,
    pending: Arc<PendingCalls>,
}

impl Dispatcher {
    pub fn new(config: Arc<ProxyConfig>, upstream: Arc<UpstreamClient>) -> Self {
        let registry = ToolRegistry::for_mode(config.tool_mode);
        Self {
            config,
            registry,
            upstream,
            pending: Arc::new(PendingCalls::new()),
        }
    }

    /// The merged catalog. The upstream half is fetched lazily through
    /// `ensure_connected`; if the IDE is not reachable yet the proxy serves
    /// its local tools and tries again on the next call.
    pub async fn list_tools(&self) -> ListToolsResult {
        let upstream_tools = match self.upstream.ensure_connected().await {
            Ok(session) => session.tools.clone(),
            Err(err) => {
                warn!(%err, "upstream unavailable for tools/list, serving local catalog");
                Vec::new()
            }
        };
        ListToolsResult {
            tools: self.registry.visible_tools(&upstream_tools),
        }
    }

    /// Route one tool call: blocked, locally implemented, or forwarded.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> CallToolResult {
        if ToolRegistry::is_blocked(name) {
            return CallToolResult::error(self.registry.blocked_message(name));
        }
        if let Some(tool) = self.registry.local_handler(name) {
            return match tool.execute(arguments, self).await {
                Ok(result) => result,
                Err(err) => CallToolResult::error(format!("{}: {:#}", name, err)),
            };
        }
        match self.forward_call(name, arguments).await {
            Ok(result) => result,
            Err(err) => CallToolResult::error(format!("{}: {}", name, err)),
        }
    }

    /// Forward to the upstream, reconnecting once if the session died.
    async fn forward_call(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, UpstreamError> {
        let session = self.upstream.ensure_connected().await?;
        let arguments = inject_project_path(&self.config, &session, name, arguments);
        match self.forward_once(&session, name, &arguments).await {
            Err(UpstreamError::SessionRejected) => {
                debug!(tool = name, "session rejected, reconnecting once");
                self.upstream.invalidate(&session).await;
                let fresh = self.upstream.ensure_connected().await?;
                self.forward_once(&fresh, name, &arguments).await
            }
            other => other,
        }
    }

    /// One dispatch attempt: send in a spawned task, race the response
    /// against the deadline. Whichever side claims the pending entry first
    /// produces the single client-visible outcome; the loser's payload is
    /// dropped.
    async fn forward_once(
        &self,
        session: &Arc<UpstreamSession>,
        name: &str,
        arguments: &Value,
    ) -> Result<CallToolResult, UpstreamError> {
        let request_id = Uuid::new_v4().to_string();
        self.pending.register(&request_id);

        let (tx, mut rx) = oneshot::channel();
        {
            let upstream = self.upstream.clone();
            let session = session.clone();
            let pending = self.pending.clone();
            let id = request_id.clone();
            let name = name.to_string();
            let arguments = arguments.clone();
            tokio::spawn(async move {
                let result = upstream
                    .call_tool(&session, Value::String(id.clone()), &name, &arguments)
                    .await;
                if pending.try_resolve(&id) {
                    let _ = tx.send(result);
                } else {
                    debug!(id = %id, tool = %name, "discarding late upstream response");
                }
            });
        }

        let settled = match tokio::time::timeout(self.config.tool_call_timeout(), &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpstreamError::Protocol("forward task dropped".into())),
            Err(_elapsed) => {
                if self.pending.try_resolve(&request_id) {
                    self.pending.remove(&request_id);
                    return Ok(CallToolResult::error(format!(
                        "Tool call '{}' timed out after {}s",
                        name, self.config.tool_call_timeout_secs
                    )));
                }
                // The response claimed the entry in the same instant the
                // timer fired; it is already on the channel.
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::Protocol("forward task dropped".into())),
                }
            }
        };
        self.pending.remove(&request_id);
        Ok(self.decode_result(session, settled?))
    }

    fn decode_result(&self, session: &UpstreamSession, response: JsonRpcResponse) -> CallToolResult {
        if let Some(err) = response.error {
            return CallToolResult::error(format!("upstream error {}: {}", err.code, err.message));
        }
        let Some(result) = response.result else {
            return CallToolResult::error("upstream response carried no result");
        };
        let mut result: CallToolResult = match serde_json::from_value(result) {
            Ok(result) => result,
            Err(err) => return CallToolResult::error(format!("malformed tool result: {}", err)),
        };
        if result.is_error.is_none()
            && session.workarounds.applies(Workaround::CallResultMissingIsError)
            && result.joined_text().starts_with("Error:")
        {
            result.is_error = Some(true);
        }
        result
    }
}

/// If the target tool's schema declares a `project_path` property and the
/// caller omitted it, fill in the proxy's resolved project root.
fn inject_project_path(
    config: &ProxyConfig,
    session: &UpstreamSession,
    name: &str,
    mut arguments: Value,
) -> Value {
    let declares = session
        .find_tool(name)
        .map(|tool| tool.declares_property("project_path"))
        .unwrap_or(false);
    if !declares {
        return arguments;
    }
    if arguments.is_null() {
        arguments = json!({});
    }
    if let Some(object) = arguments.as_object_mut() {
        object.entry("project_path").or_insert_with(|| {
            Value::String(config.project_path.to_string_lossy().into_owned())
        });
    }
    arguments
}

#[async_trait::async_trait]
impl Forwarder for Dispatcher {
    async fn forward(&self, name: &str, arguments: Value) -> anyhow::Result<CallToolResult> {
        Ok(self.forward_call(name, arguments).await?)
    }

    fn project_path(&self) -> &Path {
        &self.config.project_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::SESSION_HEADER;
    use std::time::Duration;
    use toolgate_core::ToolMode;
    use wiremock::matchers::{body_partial_json, header as header_match, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> Arc<ProxyConfig> {
        Arc::new(ProxyConfig {
            first_port: server.address().port(),
            ports_count: 1,
            connect_timeout_secs: 2,
            scan_timeout_secs: 5,
            tool_call_timeout_secs: 30,
            project_path: "/work/demo".into(),
            ..Default::default()
        })
    }

    fn unreachable_config() -> Arc<ProxyConfig> {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        Arc::new(ProxyConfig {
            first_port: port,
            ports_count: 1,
            connect_timeout_secs: 1,
            scan_timeout_secs: 2,
            ..Default::default()
        })
    }

    fn dispatcher(config: Arc<ProxyConfig>) -> Dispatcher {
        let upstream = Arc::new(UpstreamClient::new(config.clone()).unwrap());
        Dispatcher::new(config, upstream)
    }

    async fn mount_handshake(server: &MockServer, session_id: &str, version: &str) {
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, session_id)
                    .set_body_json(serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "result": {
                            "protocolVersion": crate::protocol::PROTOCOL_VERSION,
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "IntelliJ IDEA", "version": version}
                        }
                    })),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": {"tools": [
                    {"name": "get_file_text_by_path", "description": "",
                     "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}},
                    {"name": "create_new_file_with_text", "description": "",
                     "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}, "text": {"type": "string"}}}},
                    {"name": "replace_file_text_by_path", "description": "",
                     "inputSchema": {"type": "object", "properties": {}}},
                    {"name": "execute_run_configuration", "description": "",
                     "inputSchema": {"type": "object", "properties": {
                         "name": {"type": "string"},
                         "project_path": {"type": "string"}}}}
                ]}
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_blocked_tool_rejected_without_upstream_contact() {
        // Deliberately unreachable upstream: a blocked call must not even
        // try to connect, so this returns instantly.
        let dispatcher = dispatcher(unreachable_config());
        let started = std::time::Instant::now();
        let result = dispatcher
            .call_tool("replace_file_text_by_path", serde_json::json!({}))
            .await;

        assert!(result.is_err());
        assert!(result.joined_text().contains("'apply_patch'"));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_blocked_substitute_in_cc_mode() {
        let mut config = (*unreachable_config()).clone();
        config.tool_mode = ToolMode::Cc;
        let dispatcher = dispatcher(Arc::new(config));
        let result = dispatcher
            .call_tool("replace_specific_text", serde_json::json!({}))
            .await;
        assert!(result.is_err());
        assert!(result.joined_text().contains("'write'"));
    }

    #[tokio::test]
    async fn test_forwarded_call_round_trip() {
        let server = MockServer::start().await;
        mount_handshake(&server, "sess-1", "261.20247").await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(
                serde_json::json!({"method": "tools/call", "params": {"name": "get_file_text_by_path"}}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "any",
                "result": {"content": [{"type": "text", "text": "file contents"}]}
            })))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(config_for(&server));
        let result = dispatcher
            .call_tool("get_file_text_by_path", serde_json::json!({"path": "a.txt"}))
            .await;

        assert!(!result.is_err());
        assert_eq!(result.joined_text(), "file contents");
    }

    #[tokio::test]
    async fn test_project_path_injected_from_schema() {
        let server = MockServer::start().await;
        mount_handshake(&server, "sess-1", "261.20247").await;
        // Only matches when the injected project_path is present.
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({
                "method": "tools/call",
                "params": {"name": "execute_run_configuration",
                           "arguments": {"name": "run", "project_path": "/work/demo"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "any",
                "result": {"content": [{"type": "text", "text": "started"}]}
            })))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(config_for(&server));
        let result = dispatcher
            .call_tool("execute_run_configuration", serde_json::json!({"name": "run"}))
            .await;

        assert!(!result.is_err(), "got: {}", result.joined_text());
        assert_eq!(result.joined_text(), "started");
    }

    #[tokio::test]
    async fn test_caller_supplied_project_path_wins() {
        let server = MockServer::start().await;
        mount_handshake(&server, "sess-1", "261.20247").await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({
                "method": "tools/call",
                "params": {"arguments": {"project_path": "/elsewhere"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "any",
                "result": {"content": [{"type": "text", "text": "kept"}]}
            })))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(config_for(&server));
        let result = dispatcher
            .call_tool(
                "execute_run_configuration",
                serde_json::json!({"name": "run", "project_path": "/elsewhere"}),
            )
            .await;
        assert_eq!(result.joined_text(), "kept");
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_error() {
        let server = MockServer::start().await;
        mount_handshake(&server, "sess-1", "261.20247").await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "tools/call"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_json(serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": "late",
                        "result": {"content": [{"type": "text", "text": "too late"}]}
                    })),
            )
            .mount(&server)
            .await;

        let mut config = (*config_for(&server)).clone();
        config.tool_call_timeout_secs = 1;
        let dispatcher = dispatcher(Arc::new(config));

        let result = dispatcher
            .call_tool("get_file_text_by_path", serde_json::json!({"path": "a.txt"}))
            .await;

        assert!(result.is_err());
        assert!(result.joined_text().contains("timed out"));
        // The late response finds its pending entry already claimed and is
        // dropped; nothing is left in flight either way.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_reconnect_after_session_rejected() {
        let server = MockServer::start().await;
        // First handshake yields sess-1, every later one sess-2.
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "sess-1")
                    .set_body_json(serde_json::json!({
                        "jsonrpc": "2.0", "id": 1,
                        "result": {"protocolVersion": crate::protocol::PROTOCOL_VERSION,
                                   "capabilities": {}, "serverInfo": {"name": "IU", "version": "261.20247"}}
                    })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "sess-2")
                    .set_body_json(serde_json::json!({
                        "jsonrpc": "2.0", "id": 1,
                        "result": {"protocolVersion": crate::protocol::PROTOCOL_VERSION,
                                   "capabilities": {}, "serverInfo": {"name": "IU", "version": "261.20247"}}
                    })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 2,
                "result": {"tools": [{"name": "execute_run_configuration", "description": "",
                                      "inputSchema": {"type": "object", "properties": {}}}]}
            })))
            .mount(&server)
            .await;
        // The stale session is rejected, the fresh one succeeds.
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header_match(SESSION_HEADER, "sess-1"))
            .and(body_partial_json(serde_json::json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header_match(SESSION_HEADER, "sess-2"))
            .and(body_partial_json(serde_json::json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": "any",
                "result": {"content": [{"type": "text", "text": "after restart"}]}
            })))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(config_for(&server));
        let result = dispatcher
            .call_tool("execute_run_configuration", serde_json::json!({"name": "x"}))
            .await;

        assert!(!result.is_err(), "got: {}", result.joined_text());
        assert_eq!(result.joined_text(), "after restart");
    }

    #[tokio::test]
    async fn test_is_error_inferred_on_old_builds() {
        let server = MockServer::start().await;
        mount_handshake(&server, "sess-1", "250.1000").await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": "any",
                "result": {"content": [{"type": "text", "text": "Error: no such file"}]}
            })))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(config_for(&server));
        let result = dispatcher
            .call_tool("get_file_text_by_path", serde_json::json!({"path": "a.txt"}))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_is_error_not_inferred_on_fixed_builds() {
        let server = MockServer::start().await;
        mount_handshake(&server, "sess-1", "261.20247").await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": "any",
                "result": {"content": [{"type": "text", "text": "Error: is just a word here"}]}
            })))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(config_for(&server));
        let result = dispatcher
            .call_tool("get_file_text_by_path", serde_json::json!({"path": "a.txt"}))
            .await;

        assert!(!result.is_err());
    }

    #[tokio::test]
    async fn test_list_tools_merges_and_filters() {
        let server = MockServer::start().await;
        mount_handshake(&server, "sess-1", "261.20247").await;

        let dispatcher = dispatcher(config_for(&server));
        let listed = dispatcher.list_tools().await;
        let names: Vec<&str> = listed.tools.iter().map(|t| t.name.as_str()).collect();

        assert!(names.contains(&"apply_patch"));
        assert!(names.contains(&"get_file_text_by_path"));
        assert!(names.contains(&"execute_run_configuration"));
        assert!(!names.contains(&"replace_file_text_by_path"));
        assert!(!names.contains(&"create_new_file_with_text"));
    }

    #[tokio::test]
    async fn test_list_tools_degrades_without_upstream() {
        let dispatcher = dispatcher(unreachable_config());
        let listed = dispatcher.list_tools().await;
        let names: Vec<&str> = listed.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["apply_patch"]);
    }

    #[tokio::test]
    async fn test_local_tool_errors_stay_local() {
        // A malformed patch never touches the network.
        let dispatcher = dispatcher(unreachable_config());
        let result = dispatcher
            .call_tool("apply_patch", serde_json::json!({"patch": "garbage"}))
            .await;
        assert!(result.is_err());
        assert!(result.joined_text().contains("Begin Patch"));
    }
}
