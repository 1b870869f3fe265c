//! Scripted in-memory MCP provider.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use opsmux_core::{
    Error, PromptDescriptor, ResourceDescriptor, Result, ToolDescriptor, TransportConfig,
};
use opsmux_mcp::{Connector, McpConnection, PromptArguments, TransportHooks};
use serde_json::{json, Value};
use tokio::sync::Notify;

/// Behaviour and counters of one fake provider, shared by all its connections.
#[derive(Default)]
pub struct FakeProvider {
    connect_errors: Mutex<VecDeque<Error>>,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    tools: Mutex<Vec<ToolDescriptor>>,
    resources: Mutex<Vec<ResourceDescriptor>>,
    hooks: Mutex<Option<TransportHooks>>,
    calls: Mutex<Vec<String>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeProvider {
    /// Make the next connect attempt fail with `error`.
    pub fn fail_next_connect(&self, error: Error) {
        self.connect_errors.lock().unwrap().push_back(error);
    }

    /// Make the next connect attempt wait until the returned gate is
    /// notified.
    pub fn hold_next_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.connect_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn set_tools(&self, names: &[&str]) {
        *self.tools.lock().unwrap() = names.iter().map(|n| ToolDescriptor::new(*n)).collect();
    }

    pub fn set_resources(&self, uris: &[&str]) {
        *self.resources.lock().unwrap() = uris
            .iter()
            .map(|uri| ResourceDescriptor::new(*uri, *uri))
            .collect();
    }

    /// Simulate the peer going away.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(hooks) = self.hooks.lock().unwrap().as_ref() {
            hooks.closed(reason);
        }
    }

    /// Calls received, as `tool:<name>`, `resource:<uri>` or `prompt:<name>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Connector handing out connections to fake providers, created on demand.
#[derive(Default)]
pub struct FakeConnector {
    providers: Mutex<BTreeMap<String, Arc<FakeProvider>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn provider(&self, id: &str) -> Arc<FakeProvider> {
        self.providers
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .clone()
    }
}

impl Connector for FakeConnector {
    fn create(
        &self,
        provider_id: &str,
        _transport: &TransportConfig,
    ) -> Result<Arc<dyn McpConnection>> {
        Ok(Arc::new(FakeConnection {
            provider: self.provider(provider_id),
        }))
    }
}

struct FakeConnection {
    provider: Arc<FakeProvider>,
}

impl FakeConnection {
    fn record(&self, call: String) {
        self.provider.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl McpConnection for FakeConnection {
    async fn connect(&self, hooks: TransportHooks) -> Result<()> {
        self.provider.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.provider.connect_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.provider.connect_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        *self.provider.hooks.lock().unwrap() = Some(hooks);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.provider.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.provider.tools.lock().unwrap().clone())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        Ok(self.provider.resources.lock().unwrap().clone())
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        Err(Error::Rpc {
            code: -32601,
            message: "Method not found: prompts/list".to_string(),
        })
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.record(format!("tool:{}", name));
        if name == "explode" {
            return Err(Error::Rpc {
                code: -32000,
                message: "tool exploded".to_string(),
            });
        }
        Ok(json!({ "tool": name, "arguments": arguments }))
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.record(format!("resource:{}", uri));
        Ok(json!({ "contents": [{ "uri": uri, "text": "hello" }] }))
    }

    async fn get_prompt(&self, name: &str, arguments: Option<PromptArguments>) -> Result<Value> {
        self.record(format!("prompt:{}", name));
        Ok(json!({ "prompt": name, "arguments": arguments }))
    }
}
