//! Per-provider connection supervision.
//!
//! A [`ProviderSlot`] holds everything the proxy knows about one configured
//! provider: its status, live connection, namespaced capabilities, failure
//! info, reconnect counters and request queue. [`Supervisor`] owns the
//! collaborators (connector, credential validator, settings) and performs
//! the connect and disconnect steps on a slot.
//!
//! Short critical sections use the slot's `std::sync::Mutex`, never held
//! across an await. Whole lifecycle operations (initialize, disconnect,
//! reload, a scheduled attempt) serialize on the slot's async `lifecycle`
//! lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opsmux_core::{
    CredentialCheck, CredentialValidator, Error, PromptDescriptor, ProviderConfig,
    ProviderStatus, ResourceDescriptor, Settings, ToolDescriptor,
};
use opsmux_mcp::{Connector, McpConnection, TransportEvent, TransportHooks};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classifier::{classify, ClassifiedError, ErrorKind};
use crate::events::{EventSender, ProviderEvent};
use crate::policy::ReconnectPolicy;
use crate::queue::RequestQueue;

/// Delimiter between provider id and tool/prompt name.
pub const NAME_DELIMITER: char = '_';
/// Delimiter between provider id and resource uri.
pub const URI_DELIMITER: char = ':';

/// Namespaced capability maps of one provider.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub tools: BTreeMap<String, ToolDescriptor>,
    pub resources: BTreeMap<String, ResourceDescriptor>,
    pub prompts: BTreeMap<String, PromptDescriptor>,
}

impl Capabilities {
    /// Namespace and insert tools, skipping descriptors that fail validation.
    pub fn insert_tools(&mut self, provider: &str, tools: Vec<ToolDescriptor>) {
        for mut tool in tools {
            if let Err(e) = tool.validate() {
                warn!(provider = %provider, error = %e, "Skipping invalid tool");
                continue;
            }
            tool.name = format!("{}{}{}", provider, NAME_DELIMITER, tool.name);
            self.tools.insert(tool.name.clone(), tool);
        }
    }

    pub fn insert_resources(&mut self, provider: &str, resources: Vec<ResourceDescriptor>) {
        for mut resource in resources {
            if let Err(e) = resource.validate() {
                warn!(provider = %provider, error = %e, "Skipping invalid resource");
                continue;
            }
            resource.uri = format!("{}{}{}", provider, URI_DELIMITER, resource.uri);
            self.resources.insert(resource.uri.clone(), resource);
        }
    }

    pub fn insert_prompts(&mut self, provider: &str, prompts: Vec<PromptDescriptor>) {
        for mut prompt in prompts {
            if let Err(e) = prompt.validate() {
                warn!(provider = %provider, error = %e, "Skipping invalid prompt");
                continue;
            }
            prompt.name = format!("{}{}{}", provider, NAME_DELIMITER, prompt.name);
            self.prompts.insert(prompt.name.clone(), prompt);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.resources.is_empty() && self.prompts.is_empty()
    }
}

/// Reconnection bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempt_count: u32,
    pub last_attempt: Option<Instant>,
}

/// Mutable state of a slot.
pub(crate) struct SlotState {
    pub status: ProviderStatus,
    pub updating: bool,
    pub error: Option<ClassifiedError>,
    pub reconnect: ReconnectState,
    pub capabilities: Capabilities,
    pub connection: Option<Arc<dyn McpConnection>>,
    pub watcher: Option<JoinHandle<()>>,
    pub reconnect_timer: Option<JoinHandle<()>>,
    pub pending_delay: Option<Duration>,
    /// Bumped whenever a scheduled timer is replaced or cancelled.
    pub epoch: u64,
    /// Bumped whenever a connection is established or torn down.
    pub generation: u64,
}

impl SlotState {
    fn new() -> Self {
        Self {
            status: ProviderStatus::Disconnected,
            updating: false,
            error: None,
            reconnect: ReconnectState::default(),
            capabilities: Capabilities::default(),
            connection: None,
            watcher: None,
            reconnect_timer: None,
            pending_delay: None,
            epoch: 0,
            generation: 0,
        }
    }

    /// Abort a pending reconnect timer and invalidate one that already fired.
    pub fn cancel_reconnect(&mut self) {
        self.epoch += 1;
        self.pending_delay = None;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

/// Point-in-time view of a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSnapshot {
    pub id: String,
    pub status: ProviderStatus,
    pub updating: bool,
    pub error: Option<ClassifiedError>,
    pub reconnect: ReconnectState,
    pub reconnect_pending: Option<Duration>,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub queued: usize,
}

/// One configured provider.
pub struct ProviderSlot {
    id: String,
    config: ProviderConfig,
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
    queue: RequestQueue,
}

impl ProviderSlot {
    pub fn new(id: impl Into<String>, config: ProviderConfig, queue_timeout: Duration) -> Self {
        let id = id.into();
        Self {
            queue: RequestQueue::new(id.clone(), queue_timeout),
            id,
            config,
            lifecycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> ProviderStatus {
        self.state().status
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        let state = self.state();
        ProviderSnapshot {
            id: self.id.clone(),
            status: state.status,
            updating: state.updating,
            error: state.error.clone(),
            reconnect: state.reconnect,
            reconnect_pending: state.pending_delay,
            tools: state.capabilities.tools.len(),
            resources: state.capabilities.resources.len(),
            prompts: state.capabilities.prompts.len(),
            queued: self.queue.len(),
        }
    }

    /// Live connection if the provider is connected and not updating.
    pub(crate) fn ready_connection(&self) -> Option<Arc<dyn McpConnection>> {
        let state = self.state();
        if state.status.is_connected() && !state.updating {
            state.connection.clone()
        } else {
            None
        }
    }
}

/// A freshly connected session, not yet committed to its slot.
pub(crate) struct Established {
    pub connection: Arc<dyn McpConnection>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub capabilities: Capabilities,
}

/// Shared collaborators for connecting providers.
pub(crate) struct Supervisor {
    pub connector: Arc<dyn Connector>,
    pub validator: Arc<dyn CredentialValidator>,
    pub settings: Settings,
    pub policy: ReconnectPolicy,
    pub events: EventSender,
}

impl Supervisor {
    pub fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    /// Credential check, connect and capability load.
    ///
    /// Leaves the slot in `starting`; the caller commits success or failure.
    pub async fn establish(
        &self,
        slot: &ProviderSlot,
    ) -> std::result::Result<Established, ClassifiedError> {
        slot.state().status = ProviderStatus::Starting;

        if let CredentialCheck::Missing { env_var, reason } =
            self.validator.validate(&slot.id, &slot.config)
        {
            debug!(provider = %slot.id, env_var = %env_var, "Credential check failed");
            return Err(ClassifiedError::missing_credentials(reason));
        }

        let transport = slot.config.transport().map_err(config_failure)?;
        let connection = self
            .connector
            .create(&slot.id, &transport)
            .map_err(|e| match e {
                Error::NotImplemented(_) | Error::Config(_) => config_failure(e),
                other => classify(&other),
            })?;

        let (hooks, events) = TransportHooks::channel();
        let timeout = self.settings.connect_timeout();
        let connected = match tokio::time::timeout(timeout, connection.connect(hooks)).await {
            Ok(result) => result,
            Err(_) => Err(Error::transport(format!(
                "connect timeout after {}ms",
                timeout.as_millis()
            ))),
        };
        if let Err(e) = connected {
            if let Err(close_err) = connection.close().await {
                debug!(provider = %slot.id, error = %close_err, "Close after failed connect");
            }
            return Err(classify(&e));
        }

        let capabilities = load_capabilities(&slot.id, connection.as_ref()).await;
        Ok(Established {
            connection,
            events,
            capabilities,
        })
    }

    /// Store a successful connection. Returns the new generation.
    pub fn commit_connected(
        &self,
        slot: &ProviderSlot,
        established: Established,
    ) -> (u64, mpsc::UnboundedReceiver<TransportEvent>) {
        let Established {
            connection,
            events,
            capabilities,
        } = established;

        let (tools, resources, prompts) = (
            capabilities.tools.len(),
            capabilities.resources.len(),
            capabilities.prompts.len(),
        );
        let generation = {
            let mut state = slot.state();
            // a connected provider has no pending reconnect
            state.cancel_reconnect();
            state.generation += 1;
            state.status = ProviderStatus::Connected;
            state.error = None;
            state.reconnect.attempt_count = 0;
            state.capabilities = capabilities;
            state.connection = Some(connection);
            state.generation
        };

        self.emit(ProviderEvent::Connected {
            provider: slot.id.clone(),
            tools,
            resources,
            prompts,
        });
        (generation, events)
    }

    /// Drop the current connection without touching the watcher task.
    ///
    /// Used from the failure path, which may itself run on the watcher.
    pub async fn release_connection(&self, slot: &ProviderSlot) {
        let connection = {
            let mut state = slot.state();
            state.generation += 1;
            // Detach, do not abort: the watcher may be the caller.
            state.watcher.take();
            state.connection.take()
        };
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!(provider = %slot.id, error = %e, "Error closing failed connection");
            }
        }
    }

    /// Cancel timers, stop watching, close the connection. Idempotent.
    pub async fn disconnect(&self, slot: &ProviderSlot) {
        let (connection, was_disconnected) = {
            let mut state = slot.state();
            state.cancel_reconnect();
            state.generation += 1;
            if let Some(watcher) = state.watcher.take() {
                watcher.abort();
            }
            let was_disconnected = state.status == ProviderStatus::Disconnected;
            state.status = ProviderStatus::Disconnected;
            (state.connection.take(), was_disconnected)
        };

        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(provider = %slot.id, error = %e, "Error while closing provider connection");
            }
        }

        if !was_disconnected {
            info!(provider = %slot.id, "Provider disconnected");
            self.emit(ProviderEvent::Disconnected {
                provider: slot.id.clone(),
            });
        }
    }
}

fn config_failure(error: Error) -> ClassifiedError {
    match error {
        Error::Config(message) => ClassifiedError::new(ErrorKind::Config, message),
        other => ClassifiedError::new(ErrorKind::Config, other),
    }
}

/// Best-effort load of the three capability lists.
async fn load_capabilities(provider: &str, connection: &dyn McpConnection) -> Capabilities {
    let mut capabilities = Capabilities::default();

    match connection.list_tools().await {
        Ok(tools) => capabilities.insert_tools(provider, tools),
        Err(e) => warn!(provider = %provider, error = %e, "Failed to load tools"),
    }
    match connection.list_resources().await {
        Ok(resources) => capabilities.insert_resources(provider, resources),
        Err(e) => warn!(provider = %provider, error = %e, "Failed to load resources"),
    }
    match connection.list_prompts().await {
        Ok(prompts) => capabilities.insert_prompts(provider, prompts),
        Err(e) => warn!(provider = %provider, error = %e, "Failed to load prompts"),
    }

    capabilities
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use opsmux_core::{EnvCredentialValidator, Result, TransportConfig};
    use opsmux_mcp::PromptArguments;
    use serde_json::Value;

    mock! {
        Connection {}

        #[async_trait]
        impl McpConnection for Connection {
            async fn connect(&self, hooks: TransportHooks) -> Result<()>;
            async fn close(&self) -> Result<()>;
            async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;
            async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>>;
            async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>>;
            async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;
            async fn read_resource(&self, uri: &str) -> Result<Value>;
            async fn get_prompt(&self, name: &str, arguments: Option<PromptArguments>) -> Result<Value>;
        }
    }

    struct OneShotConnector(Mutex<Option<Arc<dyn McpConnection>>>);

    impl Connector for OneShotConnector {
        fn create(
            &self,
            _provider_id: &str,
            _transport: &TransportConfig,
        ) -> Result<Arc<dyn McpConnection>> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::transport("connector used twice"))
        }
    }

    fn supervisor(connection: Option<MockConnection>) -> Supervisor {
        let (events, _rx) = mpsc::unbounded_channel();
        Supervisor {
            connector: Arc::new(OneShotConnector(Mutex::new(
                connection.map(|c| Arc::new(c) as Arc<dyn McpConnection>),
            ))),
            validator: Arc::new(EnvCredentialValidator::with_lookup(|_| None)),
            settings: Settings::default(),
            policy: ReconnectPolicy::default(),
            events,
        }
    }

    fn slot(id: &str) -> ProviderSlot {
        ProviderSlot::new(
            id,
            ProviderConfig::stdio("fake-mcp", vec![]),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_capabilities_are_namespaced_and_validated() {
        let mut caps = Capabilities::default();
        caps.insert_tools(
            "github",
            vec![ToolDescriptor::new("list_issues"), ToolDescriptor::new("  ")],
        );
        caps.insert_resources(
            "github",
            vec![ResourceDescriptor::new("repo://octo/hello", "hello")],
        );
        caps.insert_prompts("github", vec![PromptDescriptor::new("triage")]);

        assert_eq!(caps.tools.len(), 1);
        assert!(caps.tools.contains_key("github_list_issues"));
        assert_eq!(caps.tools["github_list_issues"].name, "github_list_issues");
        assert!(caps.resources.contains_key("github:repo://octo/hello"));
        assert!(caps.prompts.contains_key("github_triage"));
    }

    #[tokio::test]
    async fn test_missing_credentials_never_reach_the_connector() {
        // No connection: creating one would fail the test with a transport error.
        let sup = supervisor(None);
        let slot = slot("github");

        let err = sup.establish(&slot).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert!(!err.should_reconnect);
        assert!(err.message.contains("GITHUB_PERSONAL_ACCESS_TOKEN"));
    }

    #[tokio::test]
    async fn test_capability_failures_are_not_fatal() {
        let mut conn = MockConnection::new();
        conn.expect_connect().returning(|_| Ok(()));
        conn.expect_list_tools()
            .returning(|| Ok(vec![ToolDescriptor::new("list_pipelines")]));
        conn.expect_list_resources()
            .returning(|| Err(Error::Rpc { code: -32601, message: "Method not found".into() }));
        conn.expect_list_prompts()
            .returning(|| Err(Error::Rpc { code: -32601, message: "Method not found".into() }));

        let sup = supervisor(Some(conn));
        let slot = slot("jenkins");
        let established = sup.establish(&slot).await.ok().unwrap();
        assert_eq!(established.capabilities.tools.len(), 1);
        assert!(established.capabilities.resources.is_empty());

        let (generation, _events) = sup.commit_connected(&slot, established);
        assert_eq!(generation, 1);
        assert_eq!(slot.status(), ProviderStatus::Connected);
        assert!(slot.ready_connection().is_some());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_and_classifies() {
        let mut conn = MockConnection::new();
        conn.expect_connect()
            .returning(|_| Err(Error::transport("connect ECONNREFUSED 127.0.0.1:3000")));
        conn.expect_close().times(1).returning(|| Ok(()));

        let sup = supervisor(Some(conn));
        let slot = slot("jenkins");
        let err = sup.establish(&slot).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(slot.status(), ProviderStatus::Starting);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let sup = supervisor(None);
        let slot = slot("jenkins");

        sup.disconnect(&slot).await;
        sup.disconnect(&slot).await;
        assert_eq!(slot.status(), ProviderStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_closes_live_connection_once() {
        let mut conn = MockConnection::new();
        conn.expect_close().times(1).returning(|| Ok(()));

        let sup = supervisor(None);
        let slot = slot("jenkins");
        {
            let mut state = slot.state();
            state.status = ProviderStatus::Connected;
            state.connection = Some(Arc::new(conn));
        }

        sup.disconnect(&slot).await;
        sup.disconnect(&slot).await;
        assert_eq!(slot.status(), ProviderStatus::Disconnected);
    }
}
