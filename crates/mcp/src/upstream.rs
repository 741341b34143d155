//! Upstream connection management.
//!
//! The IDE's built-in server listens on one port out of a small range and
//! speaks MCP JSON-RPC over HTTP at `/mcp`, with the session established by
//! an `initialize` handshake and carried in the `Mcp-Session-Id` header.
//! Responses arrive either as plain JSON or as an SSE event stream.
//!
//! The session is the proxy's single piece of shared mutable state: it is
//! read by any number of concurrent dispatch operations, replaced wholesale
//! on reconnect, and never patched in place. Discovery is single-flight:
//! concurrent callers that find no session queue behind one scan instead of
//! starting their own.

use crate::protocol::{
    InitializeResult, JsonRpcRequest, JsonRpcResponse, ListToolsResult, ToolSchema,
    PROTOCOL_VERSION,
};
use reqwest::{header, Client, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use toolgate_core::{ProxyConfig, Workaround, WorkaroundSet};
use tracing::{debug, info};
use url::Url;

/// Header carrying the upstream session id, both directions.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

const ACCEPT_JSON_OR_SSE: &str = "application/json, text/event-stream";

/// Error talking to the upstream.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("no upstream found on ports {first}..{last}")]
    DiscoveryExhausted { first: u16, last: u16 },

    #[error("upstream discovery timed out after {0:?}")]
    ScanTimeout(Duration),

    #[error("upstream no longer recognizes the session")]
    SessionRejected,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("upstream returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed upstream response: {0}")]
    Protocol(String),
}

/// One established upstream session. Immutable once built; reconnect
/// replaces the whole value.
#[derive(Debug)]
pub struct UpstreamSession {
    pub base_url: Url,
    pub session_id: String,
    /// Build number string from the handshake's `serverInfo.version`.
    pub ide_version: Option<String>,
    /// Workarounds active for this upstream build.
    pub workarounds: WorkaroundSet,
    /// Upstream catalog captured at handshake time, unfiltered.
    pub tools: Vec<ToolSchema>,
}

impl UpstreamSession {
    pub fn find_tool(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// Discovers, holds, and renews the upstream session.
pub struct UpstreamClient {
    http: Client,
    config: Arc<ProxyConfig>,
    // Holding this lock across the scan is what makes discovery single-flight.
    session: Mutex<Option<Arc<UpstreamSession>>>,
    next_id: AtomicI64,
}

impl UpstreamClient {
    pub fn new(config: Arc<ProxyConfig>) -> Result<Self, UpstreamError> {
        // No client-wide timeout: the handshake is bounded by connect_timeout
        // and forwarded calls by the dispatcher's deadline race.
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            config,
            session: Mutex::new(None),
            next_id: AtomicI64::new(1),
        })
    }

    /// Return the current session, running discovery if there is none.
    /// Concurrent callers share one discovery attempt and observe the same
    /// session or the same failure.
    pub async fn ensure_connected(&self) -> Result<Arc<UpstreamSession>, UpstreamError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = self.discover().await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Drop the session so the next `ensure_connected` re-runs discovery.
    /// Only clears the slot if it still holds the rejected session; a
    /// reconnect that already happened must not be clobbered.
    pub async fn invalidate(&self, stale: &Arc<UpstreamSession>) {
        let mut slot = self.session.lock().await;
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, stale) {
                debug!(session_id = %stale.session_id, "invalidating upstream session");
                *slot = None;
            }
        }
    }

    async fn discover(&self) -> Result<Arc<UpstreamSession>, UpstreamError> {
        let scan_timeout = self.config.scan_timeout();
        let scan = async {
            for port in self.config.ports() {
                match tokio::time::timeout(self.config.connect_timeout(), self.handshake(port)).await
                {
                    Ok(Ok(session)) => {
                        info!(
                            port,
                            session_id = %session.session_id,
                            ide_version = session.ide_version.as_deref().unwrap_or("unknown"),
                            tools = session.tools.len(),
                            "connected to upstream"
                        );
                        return Ok(Arc::new(session));
                    }
                    Ok(Err(err)) => debug!(port, %err, "no upstream on port"),
                    Err(_) => debug!(port, "handshake attempt timed out"),
                }
            }
            Err(UpstreamError::DiscoveryExhausted {
                first: self.config.first_port,
                last: self.config.first_port.saturating_add(self.config.ports_count),
            })
        };
        match tokio::time::timeout(scan_timeout, scan).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::ScanTimeout(scan_timeout)),
        }
    }

    /// Full handshake against one candidate port: `initialize`, the
    /// `initialized` notification, and a `tools/list` to capture the catalog.
    async fn handshake(&self, port: u16) -> Result<UpstreamSession, UpstreamError> {
        let base_url = Url::parse(&format!("http://127.0.0.1:{}/mcp", port))?;

        let request = JsonRpcRequest::new(
            self.next_internal_id(),
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "toolgate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        );
        let response = self
            .http
            .post(base_url.clone())
            .header(header::ACCEPT, ACCEPT_JSON_OR_SSE)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                UpstreamError::Protocol(format!("initialize response missing {}", SESSION_HEADER))
            })?;

        let rpc = decode_body(response, request.id.as_ref()).await?;
        let result = rpc_result(rpc)?;
        let init: InitializeResult = serde_json::from_value(result)?;
        let ide_version =
            (!init.server_info.version.is_empty()).then(|| init.server_info.version.clone());
        let workarounds = WorkaroundSet::for_version(ide_version.as_deref());

        // Failure here is not fatal: the session is already established.
        if let Err(err) = self.notify_initialized(&base_url, &session_id).await {
            debug!(%err, "initialized notification failed");
        }

        let tools = self
            .fetch_tools(&base_url, &session_id, &workarounds)
            .await?;

        Ok(UpstreamSession {
            base_url,
            session_id,
            ide_version,
            workarounds,
            tools,
        })
    }

    async fn notify_initialized(
        &self,
        base_url: &Url,
        session_id: &str,
    ) -> Result<(), UpstreamError> {
        let request = JsonRpcRequest::notification("notifications/initialized");
        self.http
            .post(base_url.clone())
            .header(SESSION_HEADER, session_id)
            .header(header::ACCEPT, ACCEPT_JSON_OR_SSE)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn fetch_tools(
        &self,
        base_url: &Url,
        session_id: &str,
        workarounds: &WorkaroundSet,
    ) -> Result<Vec<ToolSchema>, UpstreamError> {
        let request = JsonRpcRequest::new(self.next_internal_id(), "tools/list", json!({}));
        let rpc = self.request(base_url, Some(session_id), &request).await?;
        let result: ListToolsResult = serde_json::from_value(rpc_result(rpc)?)?;

        let mut tools = result.tools;
        if workarounds.applies(Workaround::ListToolsMissingInputSchema) {
            for tool in tools.iter_mut().filter(|t| t.input_schema.is_none()) {
                debug!(tool = %tool.name, "substituting missing input schema");
                tool.input_schema = Some(json!({"type": "object", "properties": {}}));
            }
        }
        Ok(tools)
    }

    /// Forward one `tools/call` on an established session.
    pub async fn call_tool(
        &self,
        session: &UpstreamSession,
        id: Value,
        name: &str,
        arguments: &Value,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let request = JsonRpcRequest::new(
            id,
            "tools/call",
            json!({"name": name, "arguments": arguments}),
        );
        self.request(&session.base_url, Some(&session.session_id), &request)
            .await
    }

    async fn request(
        &self,
        base_url: &Url,
        session_id: Option<&str>,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let mut builder = self
            .http
            .post(base_url.clone())
            .header(header::ACCEPT, ACCEPT_JSON_OR_SSE)
            .json(request);
        if let Some(sid) = session_id {
            builder = builder.header(SESSION_HEADER, sid);
        }
        let response = builder.send().await?;

        let status = response.status();
        // 404 on a session-scoped request is the upstream's way of saying
        // the session died (typically an IDE restart).
        if status == StatusCode::NOT_FOUND && session_id.is_some() {
            return Err(UpstreamError::SessionRejected);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Api {
                status: status.as_u16(),
                message,
            });
        }
        decode_body(response, request.id.as_ref()).await
    }

    fn next_internal_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Unwrap a JSON-RPC envelope into its result, surfacing upstream errors.
fn rpc_result(response: JsonRpcResponse) -> Result<Value, UpstreamError> {
    if let Some(err) = response.error {
        return Err(UpstreamError::Api {
            status: 200,
            message: format!("upstream error {}: {}", err.code, err.message),
        });
    }
    response
        .result
        .ok_or_else(|| UpstreamError::Protocol("response carries neither result nor error".into()))
}

async fn decode_body(
    response: reqwest::Response,
    expected_id: Option<&Value>,
) -> Result<JsonRpcResponse, UpstreamError> {
    let streamed = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false);
    let body = response.text().await?;
    if streamed {
        parse_sse_response(&body, expected_id)
    } else {
        Ok(serde_json::from_str(&body)?)
    }
}

/// Scan an SSE body for the JSON-RPC response with the expected id.
///
/// Events are separated by blank lines; each `data:` line contributes one
/// line of the event payload. Other messages in the stream (notifications,
/// keep-alives) are skipped.
fn parse_sse_response(
    body: &str,
    expected_id: Option<&Value>,
) -> Result<JsonRpcResponse, UpstreamError> {
    let mut data = String::new();
    for line in body.lines().chain(std::iter::once("")) {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line.is_empty() && !data.is_empty() {
            let payload = std::mem::take(&mut data);
            if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&payload) {
                let id_matches = expected_id.map_or(true, |id| &response.id == id);
                if id_matches && (response.result.is_some() || response.error.is_some()) {
                    return Ok(response);
                }
            }
        }
    }
    Err(UpstreamError::Protocol(
        "no matching response in event stream".to_string(),
    ))
}
