//! Machine-readable provider status.

use opsmux_core::credentials::{remediation_hint, required_env_var};
use opsmux_core::{ProviderConfig, ProviderStatus};
use serde::Serialize;

use crate::classifier::ErrorKind;
use crate::supervisor::ProviderSnapshot;

/// Status of one provider as exposed to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatusEntry {
    pub id: String,
    pub status: ProviderStatus,
    pub updating: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub should_reconnect: bool,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_reconnect_ms: Option<u64>,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub queued: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl ProviderStatusEntry {
    pub fn new(snapshot: ProviderSnapshot, config: &ProviderConfig) -> Self {
        let remediation = snapshot
            .error
            .as_ref()
            .and_then(|error| remediation_for(&snapshot.id, config, error.kind));
        Self {
            error_type: snapshot.error.as_ref().map(|e| e.kind),
            error_message: snapshot.error.as_ref().map(|e| e.message.clone()),
            should_reconnect: snapshot.error.as_ref().is_some_and(|e| e.should_reconnect),
            reconnect_attempts: snapshot.reconnect.attempt_count,
            next_reconnect_ms: snapshot
                .reconnect_pending
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            id: snapshot.id,
            status: snapshot.status,
            updating: snapshot.updating,
            tools: snapshot.tools,
            resources: snapshot.resources,
            prompts: snapshot.prompts,
            queued: snapshot.queued,
            remediation,
        }
    }
}

fn remediation_for(id: &str, config: &ProviderConfig, kind: ErrorKind) -> Option<String> {
    match kind {
        ErrorKind::Auth => Some(match required_env_var(id, config) {
            Some(env_var) => remediation_hint(id, &env_var),
            None => format!(
                "Check the credentials configured for provider '{}', then reload it",
                id
            ),
        }),
        ErrorKind::Config => Some(format!(
            "Fix the [providers.{}] section of the config file, then reload it",
            id
        )),
        ErrorKind::Network | ErrorKind::Unknown => None,
    }
}

/// Status of every provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connected: usize,
    pub total: usize,
    pub providers: Vec<ProviderStatusEntry>,
}

impl StatusReport {
    pub fn new(providers: Vec<ProviderStatusEntry>) -> Self {
        Self {
            connected: providers.iter().filter(|p| p.status.is_connected()).count(),
            total: providers.len(),
            providers,
        }
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderStatusEntry> {
        self.providers.iter().find(|p| p.id == id)
    }
}
