//! Server-Sent Events transport.
//!
//! The provider exposes a long-lived `text/event-stream` GET endpoint. Its
//! first `endpoint` event names the URL that client messages are POSTed to;
//! `message` events carry the server's JSON-RPC traffic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use opsmux_core::{Error, PromptDescriptor, ResourceDescriptor, Result, ToolDescriptor};
use reqwest::{Client, Url};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{McpConnection, PromptArguments, TransportHooks};
use crate::rpc::RpcClient;

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed raw bytes, returning every event completed by them.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id and retry carry nothing the proxy needs
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Background tasks of one SSE session.
#[derive(Default)]
struct Session {
    tasks: Vec<JoinHandle<()>>,
    ready: bool,
}

impl Session {
    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.ready = false;
    }
}

/// MCP session over an SSE stream plus POSTed requests.
pub struct SseConnection {
    provider: String,
    url: String,
    headers: BTreeMap<String, String>,
    client: Client,
    rpc: Arc<RpcClient>,
    session: Mutex<Session>,
    request_timeout: Duration,
}

impl SseConnection {
    pub fn new(
        provider: &str,
        url: String,
        headers: BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("opsmux/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            provider: provider.to_string(),
            url,
            headers,
            client,
            rpc: Arc::new(RpcClient::new(provider, request_timeout)),
            session: Mutex::new(Session::default()),
            request_timeout,
        })
    }

    async fn open_stream(&self) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream");
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            Error::transport(format!("network error connecting to {}: {}", self.url, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(provider = %self.provider, url = %self.url, %status, "SSE stream refused");
            return Err(Error::transport(format!("SSE endpoint returned HTTP {}", status)));
        }
        Ok(response)
    }

    /// Open the stream, start the pump tasks and run the handshake. Tasks are
    /// registered on `session` as soon as they exist so `close` can stop them
    /// even when this future is dropped halfway.
    async fn start(&self, session: &mut Session, hooks: TransportHooks) -> Result<()> {
        let response = self.open_stream().await?;
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let rpc = self.rpc.clone();
        let provider = self.provider.clone();
        let reader_hooks = hooks.clone();
        session.tasks.push(tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::default();
            let mut endpoint_tx = Some(endpoint_tx);
            let reason = loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        for event in parser.feed(&chunk) {
                            match event.event.as_str() {
                                "endpoint" => {
                                    if let Some(tx) = endpoint_tx.take() {
                                        let _ = tx.send(event.data);
                                    }
                                }
                                "message" => rpc.handle_incoming(&event.data),
                                other => debug!(provider = %provider, event = other, "Ignoring SSE event"),
                            }
                        }
                    }
                    None => break "SSE stream ended".to_string(),
                    Some(Err(e)) => break format!("SSE stream network error: {}", e),
                }
            };
            debug!(provider = %provider, reason = %reason, "SSE reader finished");
            rpc.detach(&reason);
            reader_hooks.closed(reason);
        }));

        let endpoint = match tokio::time::timeout(self.request_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                return Err(Error::ConnectionClosed(format!(
                    "SSE stream for provider {} ended before the endpoint event",
                    self.provider
                )));
            }
            Err(_) => return Err(Error::Timeout(self.request_timeout.as_millis() as u64)),
        };
        let post_url = resolve_endpoint(&self.url, &endpoint)?;
        debug!(provider = %self.provider, endpoint = %post_url, "SSE endpoint received");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        self.rpc.attach(out_tx);

        let client = self.client.clone();
        let headers = self.headers.clone();
        let rpc = self.rpc.clone();
        let provider = self.provider.clone();
        session.tasks.push(tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                let mut request = client
                    .post(post_url.clone())
                    .header("Content-Type", "application/json")
                    .body(line.clone());
                for (name, value) in &headers {
                    request = request.header(name, value);
                }
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => {
                        let status = resp.status();
                        warn!(provider = %provider, %status, "SSE message POST rejected");
                        let message = format!("SSE message POST returned HTTP {}", status);
                        if !rpc.reject_outbound(&line, Error::transport(message.clone())) {
                            hooks.error(message);
                        }
                    }
                    Err(e) => {
                        hooks.error(format!("network error posting to provider: {}", e));
                        break;
                    }
                }
            }
        }));

        self.rpc.initialize().await?;
        Ok(())
    }
}

/// Resolve the `endpoint` event payload against the stream URL.
fn resolve_endpoint(base: &str, endpoint: &str) -> Result<Url> {
    let base = Url::parse(base)
        .map_err(|e| Error::Config(format!("invalid SSE url '{}': {}", base, e)))?;
    base.join(endpoint.trim()).map_err(|e| {
        Error::InvalidData(format!("invalid SSE endpoint '{}': {}", endpoint, e))
    })
}

#[async_trait]
impl McpConnection for SseConnection {
    async fn connect(&self, hooks: TransportHooks) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.ready {
            return Ok(());
        }
        // left behind by a connect that was cancelled mid-handshake
        session.abort_all();

        if let Err(e) = self.start(&mut session, hooks).await {
            session.abort_all();
            self.rpc.detach("initialization failed");
            return Err(e);
        }

        session.ready = true;
        info!(provider = %self.provider, url = %self.url, "SSE provider connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.session.lock().await.abort_all();
        self.rpc.detach("connection closed");
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.rpc.list_tools().await
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        self.rpc.list_resources().await
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        self.rpc.list_prompts().await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.rpc.call_tool(name, arguments).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.rpc.read_resource(uri).await
    }

    async fn get_prompt(&self, name: &str, arguments: Option<PromptArguments>) -> Result<Value> {
        self.rpc.get_prompt(name, arguments).await
    }
}
