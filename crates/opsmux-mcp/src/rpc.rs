//! JSON-RPC client session shared by the downstream transports.
//!
//! Transports own the byte streams; this module owns request ids, the table
//! of in-flight requests and the typed MCP calls. Outbound messages are
//! handed to the transport's writer task as serialized lines, inbound lines
//! are fed back through [`RpcClient::handle_incoming`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use opsmux_core::{Error, PromptDescriptor, ResourceDescriptor, Result, ToolDescriptor};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::connection::PromptArguments;
use crate::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, PromptGetParams,
    RequestId, ResourceReadParams, ToolCallParams, MCP_VERSION,
};

/// Upper bound on list pages followed through `nextCursor`.
const MAX_LIST_PAGES: usize = 50;

type Pending = HashMap<i64, oneshot::Sender<Result<JsonRpcResponse>>>;

/// Request/response bookkeeping for one provider session.
pub(crate) struct RpcClient {
    provider: String,
    next_id: AtomicI64,
    pending: Mutex<Pending>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    request_timeout: Duration,
}

impl RpcClient {
    pub(crate) fn new(provider: &str, request_timeout: Duration) -> Self {
        Self {
            provider: provider.to_string(),
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            request_timeout,
        }
    }

    /// Route outbound messages to a freshly started writer task.
    pub(crate) fn attach(&self, outbound: mpsc::UnboundedSender<String>) {
        *lock(&self.outbound) = Some(outbound);
    }

    /// Stop accepting requests and fail everything in flight.
    pub(crate) fn detach(&self, reason: &str) {
        lock(&self.outbound).take();
        self.fail_all(reason);
    }

    /// Fail every in-flight request; their callers see `ConnectionClosed`.
    pub(crate) fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            debug!(
                provider = %self.provider,
                count = drained.len(),
                reason,
                "Failing in-flight requests"
            );
        }
    }

    /// Feed one inbound line from the transport.
    pub(crate) fn handle_incoming(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match Message::parse(line) {
            Ok(Message::Response(response)) => {
                let RequestId::Number(id) = response.id else {
                    warn!(provider = %self.provider, id = ?response.id, "Response with foreign id");
                    return;
                };
                match lock(&self.pending).remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => debug!(provider = %self.provider, id, "Response for unknown request"),
                }
            }
            Ok(Message::Request(request)) => self.answer_server_request(request),
            Ok(Message::Notification(notification)) => {
                debug!(
                    provider = %self.provider,
                    method = %notification.method,
                    "Provider notification"
                );
            }
            // Servers commonly print banners on stdout; they are not protocol traffic.
            Err(_) => trace!(provider = %self.provider, line, "Ignoring non JSON-RPC output"),
        }
    }

    /// Fail the pending request carried by an outbound `line`, for transports
    /// that learn about a delivery failure out of band. Returns false when the
    /// line is not an in-flight request.
    pub(crate) fn reject_outbound(&self, line: &str, error: Error) -> bool {
        let Ok(Message::Request(request)) = Message::parse(line) else {
            return false;
        };
        let RequestId::Number(id) = request.id else {
            return false;
        };
        match lock(&self.pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    fn answer_server_request(&self, request: JsonRpcRequest) {
        let response = match request.method.as_str() {
            "ping" => JsonRpcResponse::success(request.id, serde_json::json!({})),
            method => JsonRpcResponse::error(request.id, JsonRpcError::method_not_found(method)),
        };
        if let Ok(line) = serde_json::to_string(&response) {
            let _ = self.send_line(line);
        }
    }

    fn send_line(&self, line: String) -> Result<()> {
        let guard = lock(&self.outbound);
        let sender = guard.as_ref().ok_or_else(|| self.closed_error())?;
        sender.send(line).map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> Error {
        Error::ConnectionClosed(format!("connection to provider {} is closed", self.provider))
    }

    /// Send a request and wait for its response.
    pub(crate) async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);
        let line = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if let Err(e) = self.send_line(line) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        trace!(provider = %self.provider, id, method, "Request sent");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(response))) => extract_result(response),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(Error::Timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }

    /// Send a notification (no response expected).
    pub(crate) fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.send_line(line)
    }

    // ------------------------------------------------------------------------
    // Typed MCP calls
    // ------------------------------------------------------------------------

    /// Perform the MCP initialization handshake.
    pub(crate) async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "opsmux".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            Error::InvalidData(format!("failed to parse initialize response: {}", e))
        })?;

        self.notify("notifications/initialized", None)?;
        debug!(
            provider = %self.provider,
            server = %init.server_info.name,
            version = %init.server_info.version,
            protocol = %init.protocol_version,
            "MCP handshake complete"
        );
        Ok(init)
    }

    pub(crate) async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.list_paginated("tools/list", "tools").await
    }

    pub(crate) async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        self.list_paginated("resources/list", "resources").await
    }

    pub(crate) async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        self.list_paginated("prompts/list", "prompts").await
    }

    pub(crate) async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        self.request("tools/call", Some(serde_json::to_value(params)?))
            .await
    }

    pub(crate) async fn read_resource(&self, uri: &str) -> Result<Value> {
        let params = ResourceReadParams {
            uri: uri.to_string(),
        };
        self.request("resources/read", Some(serde_json::to_value(params)?))
            .await
    }

    pub(crate) async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<PromptArguments>,
    ) -> Result<Value> {
        let params = PromptGetParams {
            name: name.to_string(),
            arguments,
        };
        self.request("prompts/get", Some(serde_json::to_value(params)?))
            .await
    }

    /// Follow `nextCursor` pages, skipping entries that do not parse.
    async fn list_paginated<T: DeserializeOwned>(&self, method: &str, key: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let page = self.request(method, params).await?;

            if let Some(entries) = page.get(key).and_then(Value::as_array) {
                for entry in entries {
                    match serde_json::from_value::<T>(entry.clone()) {
                        Ok(item) => items.push(item),
                        Err(e) => warn!(
                            provider = %self.provider,
                            method,
                            error = %e,
                            "Skipping malformed list entry"
                        ),
                    }
                }
            }

            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(items);
            }
        }

        warn!(provider = %self.provider, method, "List pagination limit reached");
        Ok(items)
    }
}

/// Extract the result from a JSON-RPC response, converting errors to `Error::Rpc`.
pub(crate) fn extract_result(response: JsonRpcResponse) -> Result<Value> {
    if let Some(err) = response.error {
        return Err(Error::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
