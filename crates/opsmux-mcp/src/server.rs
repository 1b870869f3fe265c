//! Upstream MCP server.
//!
//! The server handles the MCP protocol lifecycle towards the client:
//! 1. Initialize - exchange capabilities
//! 2. List and call - tools, resources and prompts answered by a [`ProxyBackend`]
//! 3. Shutdown - on EOF, after in-flight calls have been answered
//!
//! Backend calls run as separate tasks: a call waiting on a provider that is
//! being reloaded must not block requests for other providers.

use std::sync::Arc;

use async_trait::async_trait;
use opsmux_core::{PromptDescriptor, ResourceDescriptor, Result, ToolDescriptor};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::connection::PromptArguments;
use crate::protocol::{
    InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    PromptGetParams, PromptsCapability, PromptsListResult, RequestId, ResourceReadParams,
    ResourcesCapability, ResourcesListResult, ServerCapabilities, ServerInfo, ToolCallParams,
    ToolCallResult, ToolsCapability, ToolsListResult, MCP_VERSION,
};
use crate::transport::{self, IncomingMessage, MessageReader, MessageWriter};

/// What the server needs from the proxy behind it.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    fn list_tools(&self) -> Vec<ToolDescriptor>;

    fn list_resources(&self) -> Vec<ResourceDescriptor>;

    fn list_prompts(&self) -> Vec<PromptDescriptor>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    async fn read_resource(&self, uri: &str) -> Result<Value>;

    async fn get_prompt(&self, name: &str, arguments: Option<PromptArguments>) -> Result<Value>;
}

/// MCP server for opsmux.
pub struct McpServer<B> {
    backend: Arc<B>,
    initialized: bool,
}

impl<B: ProxyBackend + 'static> McpServer<B> {
    /// Create a new MCP server.
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            initialized: false,
        }
    }

    /// Run the MCP server over the process stdin/stdout.
    pub async fn run(&mut self) -> Result<()> {
        let (reader, writer) = transport::stdio();
        self.serve(reader, writer).await
    }

    /// Serve until the reader hits EOF.
    pub async fn serve<R, W>(
        &mut self,
        mut reader: MessageReader<R>,
        writer: MessageWriter<W>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tracing::info!("Starting MCP server");

        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(response) = rx.recv().await {
                if let Err(e) = writer.write_response(&response).await {
                    tracing::error!("Failed to write response: {}", e);
                    break;
                }
            }
        });

        let mut in_flight = JoinSet::new();
        loop {
            while in_flight.try_join_next().is_some() {}

            match reader.read_message().await {
                Ok(Some(IncomingMessage::Request(req))) if is_backend_call(&req.method) => {
                    let backend = self.backend.clone();
                    let tx = tx.clone();
                    in_flight.spawn(async move {
                        let _ = tx.send(handle_backend_call(backend.as_ref(), req).await);
                    });
                }
                Ok(Some(IncomingMessage::Request(req))) => {
                    let response = self.handle_request(req).await;
                    if tx.send(response).is_err() {
                        break;
                    }
                }
                Ok(Some(IncomingMessage::Notification(notif))) => {
                    self.handle_notification(&notif.method);
                }
                Ok(None) => {
                    tracing::info!("EOF received, shutting down");
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    let _ = tx.send(JsonRpcResponse::error(
                        RequestId::Null,
                        JsonRpcError::parse_error(&e.to_string()),
                    ));
                }
                Err(e) => {
                    tracing::error!("Transport error: {}", e);
                    break;
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        drop(tx);
        let _ = writer_task.await;

        tracing::info!("MCP server stopped");
        Ok(())
    }

    /// Handle a JSON-RPC request.
    async fn handle_request(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        tracing::debug!("Handling request: {} (id: {:?})", req.method, req.id);

        match req.method.as_str() {
            "initialize" => self.handle_initialize(req.id, req.params),
            "ping" => JsonRpcResponse::success(req.id, serde_json::json!({})),
            "tools/list" => to_response(
                req.id,
                &ToolsListResult {
                    tools: self.backend.list_tools(),
                    next_cursor: None,
                },
            ),
            "resources/list" => to_response(
                req.id,
                &ResourcesListResult {
                    resources: self.backend.list_resources(),
                    next_cursor: None,
                },
            ),
            "prompts/list" => to_response(
                req.id,
                &PromptsListResult {
                    prompts: self.backend.list_prompts(),
                    next_cursor: None,
                },
            ),
            method if is_backend_call(method) => {
                handle_backend_call(self.backend.as_ref(), req).await
            }
            method => {
                tracing::warn!("Unknown method: {}", method);
                JsonRpcResponse::error(req.id, JsonRpcError::method_not_found(method))
            }
        }
    }

    /// Handle notifications (no response).
    fn handle_notification(&mut self, method: &str) {
        match method {
            "initialized" | "notifications/initialized" => tracing::info!("Client initialized"),
            "notifications/cancelled" => tracing::debug!("Request cancelled by client"),
            _ => tracing::debug!("Ignoring notification: {}", method),
        }
    }

    /// Handle initialize request.
    fn handle_initialize(&mut self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        if self.initialized {
            return JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("Server already initialized"),
            );
        }

        if let Some(params) = params {
            match serde_json::from_value::<InitializeParams>(params) {
                Ok(init_params) => {
                    tracing::info!(
                        "Client: {} v{} (protocol: {})",
                        init_params.client_info.name,
                        init_params.client_info.version,
                        init_params.protocol_version
                    );
                }
                Err(e) => tracing::warn!("Failed to parse initialize params: {}", e),
            }
        }

        self.initialized = true;

        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                resources: Some(ResourcesCapability {
                    subscribe: false,
                    list_changed: false,
                }),
                prompts: Some(PromptsCapability {
                    list_changed: false,
                }),
            },
            server_info: ServerInfo {
                name: "opsmux".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        to_response(id, &result)
    }
}

fn is_backend_call(method: &str) -> bool {
    matches!(method, "tools/call" | "resources/read" | "prompts/get")
}

/// Answer a call that is forwarded to a provider.
async fn handle_backend_call<B: ProxyBackend + ?Sized>(
    backend: &B,
    req: JsonRpcRequest,
) -> JsonRpcResponse {
    let id = req.id;
    let Some(params) = req.params else {
        return JsonRpcResponse::error(id, JsonRpcError::invalid_params("Missing params"));
    };

    match req.method.as_str() {
        "tools/call" => {
            let params: ToolCallParams = match serde_json::from_value(params) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(id, JsonRpcError::invalid_params(&e.to_string()))
                }
            };
            tracing::info!("Calling tool: {}", params.name);

            let arguments = params.arguments.unwrap_or_else(|| serde_json::json!({}));
            match backend.call_tool(&params.name, arguments).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => {
                    tracing::warn!("Tool {} failed: {}", params.name, e);
                    to_response(id, &ToolCallResult::error(e.to_string()))
                }
            }
        }
        "resources/read" => {
            let params: ResourceReadParams = match serde_json::from_value(params) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(id, JsonRpcError::invalid_params(&e.to_string()))
                }
            };
            match backend.read_resource(&params.uri).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(&e.to_string())),
            }
        }
        "prompts/get" => {
            let params: PromptGetParams = match serde_json::from_value(params) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(id, JsonRpcError::invalid_params(&e.to_string()))
                }
            };
            match backend.get_prompt(&params.name, params.arguments).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(&e.to_string())),
            }
        }
        method => JsonRpcResponse::error(id, JsonRpcError::method_not_found(method)),
    }
}

fn to_response<T: Serialize>(id: RequestId, value: &T) -> JsonRpcResponse {
    match serde_json::to_value(value) {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(&e.to_string())),
    }
}
