//! The protocol server each SSE session gets by default.
//!
//! It speaks enough MCP for clients to connect and probe the Canvas
//! connection: `initialize`, `ping`, `tools/list` and `tools/call`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    canvas::{CanvasClient, HealthProbe},
    error::ServerError,
    model::{ErrorData, JsonRpcMessage, JsonRpcRequest},
    service::{Credentials, ProtocolServer},
    transport::SseServerTransport,
};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "canvas-mcp-server";
pub const HEALTH_CHECK_TOOL: &str = "canvas_health_check";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a [`CanvasServer`] talking to Canvas with the given credentials.
pub fn canvas_server_factory(
    credentials: Credentials,
) -> Result<Box<dyn ProtocolServer>, ServerError> {
    let client = CanvasClient::new(&credentials)
        .map_err(|e| ServerError::other("failed to build Canvas client", e))?;
    Ok(Box::new(CanvasServer::new(Arc::new(client))))
}

pub struct CanvasServer {
    handler: Handler,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CanvasServer {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            handler: Handler { probe },
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProtocolServer for CanvasServer {
    async fn connect(&self, transport: SseServerTransport) -> Result<(), ServerError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(ServerError::other(
                "connect",
                "server is already bound to a transport",
            ));
        }
        let span = tracing::info_span!("canvas-server", session_id = %transport.session_id());
        let handler = self.handler.clone();
        *task = Some(tokio::spawn(serve(handler, transport).instrument(span)));
        Ok(())
    }

    async fn close(&self) -> Result<(), ServerError> {
        let Some(mut task) = self.task.lock().take() else {
            return Ok(());
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(ServerError::Runtime(e)),
            Err(_) => {
                task.abort();
                Err(ServerError::other("close", "server loop did not stop in time"))
            }
        }
    }
}

async fn serve(handler: Handler, mut transport: SseServerTransport) {
    let ct = transport.cancellation_token().clone();
    tracing::debug!("server loop started");
    loop {
        let message = tokio::select! {
            biased;
            _ = ct.cancelled() => break,
            message = transport.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let reply = tokio::select! {
            biased;
            _ = ct.cancelled() => break,
            reply = handler.handle(message) => reply,
        };
        let Some(reply) = reply else {
            continue;
        };
        if let Err(e) = transport.send(reply).await {
            tracing::error!(error = %e, "failed to push message to client");
            break;
        }
    }
    tracing::debug!("server loop finished");
}

#[derive(Clone)]
struct Handler {
    probe: Arc<dyn HealthProbe>,
}

impl Handler {
    async fn handle(&self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        match message {
            JsonRpcMessage::Request(request) => {
                let id = request.id.clone();
                tracing::debug!(request_id = %id, method = %request.method, "received request");
                Some(match self.handle_request(request).await {
                    Ok(result) => JsonRpcMessage::response(id, result),
                    Err(error) => {
                        tracing::debug!(request_id = %id, %error, "request failed");
                        JsonRpcMessage::error(id, error)
                    }
                })
            }
            JsonRpcMessage::Notification(notification) => {
                tracing::debug!(method = %notification.method, "received notification");
                None
            }
            // the server never sends requests, so there is nothing to match these against
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => None,
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Result<Value, ErrorData> {
        match request.method.as_str() {
            "initialize" => Ok(self.initialize(request.params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": [health_check_tool()] })),
            "tools/call" => self.call_tool(request.params.as_ref()).await,
            method => Err(ErrorData::method_not_found(method)),
        }
    }

    fn initialize(&self, params: Option<&Value>) -> Value {
        let protocol_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "tools": { "listChanged": false }
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "instructions": "Tools for the Canvas LMS API.",
        })
    }

    async fn call_tool(&self, params: Option<&Value>) -> Result<Value, ErrorData> {
        let name = params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorData::invalid_params("missing tool name"))?;
        if name != HEALTH_CHECK_TOOL {
            return Err(ErrorData::invalid_params(format!("unknown tool: {name}")));
        }
        // tool failures are results, not protocol errors
        let (text, is_error) = match self.probe.health_check().await {
            Ok(health) => (
                serde_json::to_string_pretty(&health)
                    .map_err(|e| ErrorData::internal_error(e.to_string()))?,
                false,
            ),
            Err(e) => (format!("Canvas health check failed: {e}"), true),
        };
        Ok(json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error,
        }))
    }
}

fn health_check_tool() -> Value {
    json!({
        "name": HEALTH_CHECK_TOOL,
        "description": "Check connectivity to the Canvas API and report the authenticated user",
        "inputSchema": {
            "type": "object",
            "properties": {},
        }
    })
}
