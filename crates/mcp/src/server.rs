// MCP server: newline-delimited JSON-RPC 2.0 over stdio.
//
// Each tools/* request runs in its own task so many calls can be in flight
// at once; responses funnel through a single writer task, the only place
// that touches stdout. Per-request at-most-once delivery is the
// dispatcher's job; this loop just writes whatever single result it gets.

use crate::dispatcher::Dispatcher;
use crate::protocol::{
    CallToolParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
};
use anyhow::Result;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

const SERVER_NAME: &str = "toolgate";

pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
}

impl McpServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Serve until stdin closes.
    pub async fn run(&self) -> Result<()> {
        info!("starting MCP server on stdio");

        let stdin = tokio::io::stdin();
        let mut lines = FramedRead::new(stdin, LinesCodec::new());

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = rx.recv().await {
                if stdout.write_all(line.as_bytes()).await.is_err()
                    || stdout.write_all(b"\n").await.is_err()
                    || stdout.flush().await.is_err()
                {
                    break;
                }
            }
        });

        while let Some(line) = lines.next().await {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            debug!(line, "received");

            match serde_json::from_str::<JsonRpcRequest>(line) {
                Ok(request) => self.handle_request(request, tx.clone()),
                Err(err) => {
                    warn!(%err, "unparseable request");
                    send(
                        &tx,
                        JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error(err.to_string())),
                    )
                    .await;
                }
            }
        }

        drop(tx);
        let _ = writer.await;
        info!("stdin closed, shutting down");
        Ok(())
    }

    /// Answer one request. Catalog and call requests get their own task so a
    /// slow upstream never blocks the read loop.
    fn handle_request(&self, request: JsonRpcRequest, tx: mpsc::Sender<String>) {
        if request.is_notification() {
            debug!(method = %request.method, "notification, no response");
            return;
        }
        let id = request.id.clone().unwrap_or(Value::Null);

        match request.method.as_str() {
            "initialize" => {
                let response = JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {
                            "name": SERVER_NAME,
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                );
                tokio::spawn(async move { send(&tx, response).await });
            }
            "ping" => {
                let response = JsonRpcResponse::success(id, json!({}));
                tokio::spawn(async move { send(&tx, response).await });
            }
            "tools/list" => {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    let listed = dispatcher.list_tools().await;
                    let response = match serde_json::to_value(&listed) {
                        Ok(result) => JsonRpcResponse::success(id, result),
                        Err(err) => JsonRpcResponse::error(
                            id,
                            JsonRpcError::internal_error(err.to_string()),
                        ),
                    };
                    send(&tx, response).await;
                });
            }
            "tools/call" => {
                let params = request.params.unwrap_or(Value::Null);
                let params: CallToolParams = match serde_json::from_value(params) {
                    Ok(params) => params,
                    Err(err) => {
                        let response = JsonRpcResponse::error(
                            id,
                            JsonRpcError::invalid_params(format!("invalid tools/call params: {}", err)),
                        );
                        tokio::spawn(async move { send(&tx, response).await });
                        return;
                    }
                };
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    let result = dispatcher.call_tool(&params.name, params.arguments).await;
                    let response = match serde_json::to_value(&result) {
                        Ok(result) => JsonRpcResponse::success(id, result),
                        Err(err) => JsonRpcResponse::error(
                            id,
                            JsonRpcError::internal_error(err.to_string()),
                        ),
                    };
                    send(&tx, response).await;
                });
            }
            other => {
                warn!(method = other, "unknown method");
                let response = JsonRpcResponse::error(id, JsonRpcError::method_not_found(other));
                tokio::spawn(async move { send(&tx, response).await });
            }
        }
    }
}

async fn send(tx: &mpsc::Sender<String>, response: JsonRpcResponse) {
    match serde_json::to_string(&response) {
        Ok(line) => {
            if tx.send(line).await.is_err() {
                debug!("writer task gone, dropping response");
            }
        }
        Err(err) => error!(%err, "failed to serialize response"),
    }
}
