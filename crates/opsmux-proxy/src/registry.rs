//! Provider registry: the proxy's single entry point.
//!
//! [`ProviderRegistry`] is a cheap, cloneable handle built once at startup.
//! It owns every [`ProviderSlot`], routes namespaced calls to the right
//! provider, aggregates capabilities of connected providers and is the only
//! place provider failures are handled.
//!
//! # Example
//!
//! ```ignore
//! let registry = ProviderRegistry::from_config(&config)?;
//! registry.initialize_all().await;
//! let result = registry.call_tool("github_list_issues", json!({"repo": "octo/hello"})).await?;
//! registry.shutdown().await;
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use opsmux_core::config::validate_provider_id;
use opsmux_core::{
    Config, CredentialValidator, EnvCredentialValidator, Error, PromptDescriptor, ProviderConfig,
    ProviderStatus, ResourceDescriptor, Result, Settings, ToolDescriptor,
};
use opsmux_mcp::{
    Connector, McpConnection, PromptArguments, ProxyBackend, TransportConnector, TransportEvent,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, ClassifiedError, ErrorKind};
use crate::events::{spawn_dispatcher, LoggingListener, ProviderEvent, ProviderEventListener};
use crate::policy::{ReconnectDecision, ReconnectPolicy};
use crate::queue::{PendingCall, QueueTicket};
use crate::scheduler;
use crate::status::{ProviderStatusEntry, StatusReport};
use crate::supervisor::{
    Capabilities, ProviderSlot, ProviderSnapshot, ReconnectState, Supervisor, NAME_DELIMITER,
    URI_DELIMITER,
};

/// Message used when a failure is reported without details.
const UNSPECIFIED_FAILURE: &str = "connection lost";

pub(crate) struct RegistryInner {
    supervisor: Supervisor,
    providers: Mutex<BTreeMap<String, Arc<ProviderSlot>>>,
}

/// Handle to the set of supervised providers.
#[derive(Clone)]
pub struct ProviderRegistry {
    inner: Arc<RegistryInner>,
}

/// Builder for [`ProviderRegistry`].
pub struct ProviderRegistryBuilder {
    settings: Settings,
    providers: Vec<(String, ProviderConfig)>,
    connector: Option<Arc<dyn Connector>>,
    credential_validator: Option<Arc<dyn CredentialValidator>>,
    listeners: Vec<Arc<dyn ProviderEventListener>>,
}

impl ProviderRegistryBuilder {
    fn new() -> Self {
        Self {
            settings: Settings::default(),
            providers: Vec::new(),
            connector: None,
            credential_validator: None,
            listeners: Vec::new(),
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn provider(mut self, id: impl Into<String>, config: ProviderConfig) -> Self {
        self.providers.push((id.into(), config));
        self
    }

    /// Defaults to [`TransportConnector`].
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Defaults to [`EnvCredentialValidator`] over the process environment.
    pub fn credential_validator(mut self, validator: Arc<dyn CredentialValidator>) -> Self {
        self.credential_validator = Some(validator);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ProviderEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the registry. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<ProviderRegistry> {
        let queue_timeout = self.settings.queue_timeout();
        let mut providers = BTreeMap::new();
        for (id, config) in self.providers {
            validate_provider_id(&id)?;
            let slot = Arc::new(ProviderSlot::new(id.clone(), config, queue_timeout));
            if providers.insert(id.clone(), slot).is_some() {
                return Err(Error::Config(format!("provider '{}' is defined twice", id)));
            }
        }

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TransportConnector::new(self.settings.request_timeout())));
        let validator = self
            .credential_validator
            .unwrap_or_else(|| Arc::new(EnvCredentialValidator::new()));
        let (events, _dispatcher) = spawn_dispatcher(self.listeners);

        Ok(ProviderRegistry {
            inner: Arc::new(RegistryInner {
                supervisor: Supervisor {
                    connector,
                    validator,
                    policy: ReconnectPolicy::from(&self.settings.reconnect),
                    settings: self.settings,
                    events,
                },
                providers: Mutex::new(providers),
            }),
        })
    }
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::new()
    }

    /// Registry over the enabled providers of `config`, using the real
    /// transports and logging every state change.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Self::builder()
            .settings(config.settings.clone())
            .listener(Arc::new(LoggingListener));
        for (id, provider) in config.enabled_providers() {
            builder = builder.provider(id.clone(), provider.clone());
        }
        builder.build()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Initialize every provider concurrently and wait for all to settle.
    pub async fn initialize_all(&self) -> Vec<(String, ProviderStatus)> {
        let mut set = JoinSet::new();
        for slot in self.inner.slots() {
            let inner = self.inner.clone();
            set.spawn(async move {
                let status = inner.initialize(&slot).await;
                (slot.id().to_string(), status)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Provider initialization task failed"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let connected = results.iter().filter(|(_, s)| s.is_connected()).count();
        info!(connected, total = results.len(), "Providers initialized");
        results
    }

    /// Connect one provider. Providers in `auth_failed` stay there until reloaded.
    pub async fn initialize_provider(&self, id: &str) -> Result<ProviderStatus> {
        let slot = self.inner.require(id)?;
        Ok(self.inner.initialize(&slot).await)
    }

    /// Disconnect, reset counters and error, then initialize again.
    ///
    /// The provider is `updating` for the whole reload, so calls made in the
    /// meantime are queued. They are drained on success and rejected if the
    /// provider does not come back.
    pub async fn reload_provider(&self, id: &str) -> Result<ProviderStatus> {
        let slot = self.inner.require(id)?;
        Ok(self.inner.reload(&slot).await)
    }

    pub async fn disconnect_provider(&self, id: &str) -> Result<()> {
        let slot = self.inner.require(id)?;
        let _guard = slot.lifecycle.lock().await;
        self.inner.supervisor.disconnect(&slot).await;
        Ok(())
    }

    /// Mark a provider as updating (calls are queued) or done updating
    /// (queued calls are drained if the provider is connected).
    pub async fn set_provider_updating(&self, id: &str, updating: bool) -> Result<()> {
        let slot = self.inner.require(id)?;
        slot.state().updating = updating;
        debug!(provider = %id, updating, "Provider updating flag changed");
        if !updating {
            self.inner.drain_if_ready(&slot).await;
        }
        Ok(())
    }

    /// Report a failure of provider `id`. Never fails: unknown ids and
    /// disconnected providers are ignored.
    pub async fn handle_provider_failure(&self, id: &str, error: Option<&str>) {
        let Some(slot) = self.inner.slot(id) else {
            debug!(provider = %id, "Ignoring failure for unknown provider");
            return;
        };
        self.inner
            .fail(&slot, None, error.unwrap_or(UNSPECIFIED_FAILURE))
            .await;
    }

    /// Cancel every timer, disconnect every provider and reject whatever is
    /// still queued. The registry is empty afterwards.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<ProviderSlot>> = std::mem::take(&mut *self.inner.providers())
            .into_values()
            .collect();

        let cancelled = slots.iter().filter(|slot| scheduler::cancel(slot)).count();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending reconnect timers");
        }

        for slot in &slots {
            let _guard = slot.lifecycle.lock().await;
            self.inner.supervisor.disconnect(slot).await;
            slot.queue()
                .reject_all(&format!("Provider {} shut down", slot.id()));
        }
        info!(providers = slots.len(), "All providers shut down");
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Call `<provider>_<tool>`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let (provider, tool) = split_routed(name, NAME_DELIMITER);
        let call = PendingCall::Tool {
            name: tool.to_string(),
            arguments,
        };
        self.inner.submit(provider, call).await
    }

    /// Read `<provider>:<uri>`.
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        let (provider, resource) = split_routed(uri, URI_DELIMITER);
        let call = PendingCall::Resource {
            uri: resource.to_string(),
        };
        self.inner.submit(provider, call).await
    }

    /// Fetch `<provider>_<prompt>`.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<PromptArguments>,
    ) -> Result<Value> {
        let (provider, prompt) = split_routed(name, NAME_DELIMITER);
        let call = PendingCall::Prompt {
            name: prompt.to_string(),
            arguments,
        };
        self.inner.submit(provider, call).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.collect_connected(|caps| caps.tools.values().cloned().collect())
    }

    pub fn get_all_resources(&self) -> Vec<ResourceDescriptor> {
        self.inner
            .collect_connected(|caps| caps.resources.values().cloned().collect())
    }

    pub fn get_all_prompts(&self) -> Vec<PromptDescriptor> {
        self.inner
            .collect_connected(|caps| caps.prompts.values().cloned().collect())
    }

    pub fn get_provider(&self, id: &str) -> Option<ProviderSnapshot> {
        self.inner.slot(id).map(|slot| slot.snapshot())
    }

    pub fn get_all_providers(&self) -> Vec<ProviderSnapshot> {
        self.inner.slots().iter().map(|slot| slot.snapshot()).collect()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.inner.providers().keys().cloned().collect()
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport::new(
            self.inner
                .slots()
                .iter()
                .map(|slot| ProviderStatusEntry::new(slot.snapshot(), slot.config()))
                .collect(),
        )
    }

    /// Delay of the pending reconnect timer of `id`, if one is armed.
    pub fn pending_reconnect(&self, id: &str) -> Option<Duration> {
        self.inner.slot(id).and_then(|slot| slot.state().pending_delay)
    }
}

impl RegistryInner {
    fn providers(&self) -> MutexGuard<'_, BTreeMap<String, Arc<ProviderSlot>>> {
        self.providers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, id: &str) -> Option<Arc<ProviderSlot>> {
        self.providers().get(id).cloned()
    }

    fn slots(&self) -> Vec<Arc<ProviderSlot>> {
        self.providers().values().cloned().collect()
    }

    fn require(&self, id: &str) -> Result<Arc<ProviderSlot>> {
        self.slot(id)
            .ok_or_else(|| Error::ProviderNotFound(id.to_string()))
    }

    fn collect_connected<T>(
        &self,
        pick: impl Fn(&Capabilities) -> Vec<T>,
    ) -> Vec<T> {
        self.slots()
            .iter()
            .flat_map(|slot| {
                let state = slot.state();
                if state.status.is_connected() {
                    pick(&state.capabilities)
                } else {
                    Vec::new()
                }
            })
            .collect()
    }

    async fn initialize(self: &Arc<Self>, slot: &Arc<ProviderSlot>) -> ProviderStatus {
        let guard = slot.lifecycle.lock().await;
        if !slot.status().is_connected() {
            scheduler::cancel(slot);
        }
        let status = self.initialize_locked(slot).await;
        drop(guard);

        if status.is_connected() {
            self.drain_if_ready(slot).await;
        }
        status
    }

    /// Connect `slot` and commit the outcome. Caller holds the lifecycle lock.
    async fn initialize_locked(self: &Arc<Self>, slot: &Arc<ProviderSlot>) -> ProviderStatus {
        match slot.status() {
            ProviderStatus::Connected => return ProviderStatus::Connected,
            ProviderStatus::AuthFailed => {
                debug!(provider = %slot.id(), "Provider needs a reload to retry authentication");
                return ProviderStatus::AuthFailed;
            }
            _ => {}
        }

        match self.supervisor.establish(slot).await {
            Ok(established) => {
                let (generation, events) = self.supervisor.commit_connected(slot, established);
                let watcher = spawn_watcher(
                    Arc::downgrade(self),
                    Arc::downgrade(slot),
                    generation,
                    events,
                );
                slot.state().watcher = Some(watcher);
                ProviderStatus::Connected
            }
            Err(error) => {
                self.on_failure_locked(slot, error);
                slot.status()
            }
        }
    }

    /// Record a classified failure and decide what happens next.
    fn on_failure_locked(self: &Arc<Self>, slot: &Arc<ProviderSlot>, error: ClassifiedError) {
        let provider = slot.id().to_string();

        if error.kind == ErrorKind::Auth {
            {
                let mut state = slot.state();
                state.cancel_reconnect();
                state.status = ProviderStatus::AuthFailed;
                state.error = Some(error.clone());
            }
            self.supervisor
                .emit(ProviderEvent::AuthFailed { provider, error });
            return;
        }

        let decision = {
            let mut state = slot.state();
            state.status = ProviderStatus::Error;
            state.error = Some(error.clone());
            error.should_reconnect.then(|| {
                self.supervisor.policy.decide(
                    state.reconnect.attempt_count,
                    state.reconnect.last_attempt,
                    Instant::now(),
                )
            })
        };
        self.supervisor.emit(ProviderEvent::Error {
            provider: provider.clone(),
            error,
        });

        match decision {
            Some(ReconnectDecision::Schedule(delay)) => {
                let attempt = scheduler::schedule(self, slot, delay);
                self.supervisor.emit(ProviderEvent::ReconnectScheduled {
                    provider,
                    attempt,
                    delay,
                });
            }
            Some(ReconnectDecision::Exhausted) => {
                let attempts = slot.state().reconnect.attempt_count;
                self.supervisor
                    .emit(ProviderEvent::ReconnectExhausted { provider, attempts });
            }
            None => {
                warn!(provider = %provider, "Failure is not retryable; provider stays in error");
            }
        }
    }

    /// Failure entry point. `expected_generation` is set when the failure
    /// comes from a connection watcher and filters out stale reports.
    async fn fail(
        self: &Arc<Self>,
        slot: &Arc<ProviderSlot>,
        expected_generation: Option<u64>,
        raw: &str,
    ) {
        let _guard = slot.lifecycle.lock().await;
        {
            let state = slot.state();
            if matches!(
                state.status,
                ProviderStatus::Disconnected | ProviderStatus::AuthFailed
            ) {
                debug!(provider = %slot.id(), status = %state.status, "Ignoring failure");
                return;
            }
            if expected_generation.is_some_and(|g| g != state.generation) {
                debug!(provider = %slot.id(), "Ignoring failure of a replaced connection");
                return;
            }
        }

        let error = classify(raw);
        warn!(provider = %slot.id(), kind = %error.kind, "Provider failure: {}", raw);
        self.supervisor.release_connection(slot).await;
        self.on_failure_locked(slot, error);
    }

    /// Body of a fired reconnect timer.
    pub(crate) async fn run_scheduled_attempt(self: &Arc<Self>, slot: &Arc<ProviderSlot>, epoch: u64) {
        let guard = slot.lifecycle.lock().await;
        let attempt = {
            let mut state = slot.state();
            if state.epoch != epoch {
                debug!(provider = %slot.id(), "Reconnect timer was superseded");
                return;
            }
            // This task's own handle: detach it, aborting would cancel us.
            state.reconnect_timer.take();
            state.pending_delay = None;
            state.reconnect.attempt_count += 1;
            state.reconnect.last_attempt = Some(Instant::now());
            state.status = ProviderStatus::Starting;
            state.reconnect.attempt_count
        };
        info!(provider = %slot.id(), attempt, "Attempting reconnection");

        let status = self.initialize_locked(slot).await;
        drop(guard);

        if status.is_connected() {
            self.drain_if_ready(slot).await;
        }
    }

    async fn reload(self: &Arc<Self>, slot: &Arc<ProviderSlot>) -> ProviderStatus {
        {
            let mut state = slot.state();
            state.cancel_reconnect();
            state.updating = true;
        }
        let guard = slot.lifecycle.lock().await;
        info!(provider = %slot.id(), "Reloading provider");

        self.supervisor.disconnect(slot).await;
        {
            let mut state = slot.state();
            state.reconnect = ReconnectState::default();
            state.error = None;
        }
        tokio::time::sleep(self.supervisor.settings.reload_debounce()).await;

        let status = self.initialize_locked(slot).await;
        let failure = {
            let mut state = slot.state();
            state.updating = false;
            state.error.clone()
        };
        drop(guard);

        if status.is_connected() {
            self.drain_if_ready(slot).await;
        } else {
            let reason = failure
                .map(|e| e.message)
                .unwrap_or_else(|| format!("status {}", status));
            slot.queue()
                .reject_all(&format!("Provider reload failed: {}", reason));
        }
        status
    }

    async fn drain_if_ready(&self, slot: &ProviderSlot) {
        if slot.queue().is_empty() {
            return;
        }
        if let Some(connection) = slot.ready_connection() {
            let drained = slot.queue().drain(connection.as_ref()).await;
            info!(provider = %slot.id(), drained, "Drained queued requests");
        }
    }

    /// Queue while updating, dispatch while connected, refuse otherwise.
    async fn submit(&self, provider: &str, call: PendingCall) -> Result<Value> {
        let slot = self.require(provider)?;
        let route = {
            let state = slot.state();
            if state.updating {
                Route::Queued(slot.queue().enqueue(call))
            } else {
                match (&state.connection, state.status) {
                    (Some(connection), ProviderStatus::Connected) => {
                        Route::Direct(connection.clone(), call)
                    }
                    (_, status) => {
                        return Err(Error::ProviderUnavailable {
                            provider: provider.to_string(),
                            status,
                        })
                    }
                }
            }
        };

        match route {
            Route::Queued(ticket) => ticket.wait().await,
            Route::Direct(connection, call) => call.dispatch(connection.as_ref()).await,
        }
    }
}

enum Route {
    Queued(QueueTicket),
    Direct(Arc<dyn McpConnection>, PendingCall),
}

fn spawn_watcher(
    registry: Weak<RegistryInner>,
    slot: Weak<ProviderSlot>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(event) = events.recv().await else {
            return;
        };
        if let (Some(registry), Some(slot)) = (registry.upgrade(), slot.upgrade()) {
            registry.fail(&slot, Some(generation), event.describe()).await;
        }
    })
}

/// Split a routed name at the first delimiter into (provider, rest).
fn split_routed(routed: &str, delimiter: char) -> (&str, &str) {
    routed.split_once(delimiter).unwrap_or((routed, ""))
}

#[async_trait]
impl ProxyBackend for ProviderRegistry {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.get_all_tools()
    }

    fn list_resources(&self) -> Vec<ResourceDescriptor> {
        self.get_all_resources()
    }

    fn list_prompts(&self) -> Vec<PromptDescriptor> {
        self.get_all_prompts()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        ProviderRegistry::call_tool(self, name, arguments).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        ProviderRegistry::read_resource(self, uri).await
    }

    async fn get_prompt(&self, name: &str, arguments: Option<PromptArguments>) -> Result<Value> {
        ProviderRegistry::get_prompt(self, name, arguments).await
    }
}
