//! Common test utilities for the provider registry.
//!
//! - `FakeConnector` / `FakeProvider`: scripted in-memory MCP connections
//! - `Recorder`: event listener that keeps every provider event
//! - `registry_with`: registry over fake providers with fast test settings

#![allow(dead_code)]

pub mod fake_provider;

pub use fake_provider::{FakeConnector, FakeProvider};

use std::sync::{Arc, Mutex};

use opsmux_core::{EnvCredentialValidator, ProviderConfig, Settings};
use opsmux_proxy::{ProviderEvent, ProviderEventListener, ProviderRegistry};

/// Token that passes every credential check.
pub const VALID_TOKEN: &str = "ghp_0123456789abcdefghijklmnop";

/// Listener recording every event in arrival order.
#[derive(Default)]
pub struct Recorder(Mutex<Vec<ProviderEvent>>);

impl ProviderEventListener for Recorder {
    fn on_event(&self, event: &ProviderEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

impl Recorder {
    /// Events seen so far, after letting the dispatcher catch up.
    pub async fn events(&self) -> Vec<ProviderEvent> {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        self.0.lock().unwrap().clone()
    }
}

/// Settings with a short reload debounce.
pub fn test_settings() -> Settings {
    Settings {
        reload_debounce_ms: 10,
        ..Settings::default()
    }
}

/// Which credentials the registry sees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Credentials {
    Present,
    Missing,
}

/// Registry over fake stdio providers named `ids`.
pub fn registry_with(
    connector: &Arc<FakeConnector>,
    ids: &[&str],
    credentials: Credentials,
    recorder: &Arc<Recorder>,
) -> ProviderRegistry {
    let validator = match credentials {
        Credentials::Present => {
            EnvCredentialValidator::with_lookup(|_| Some(VALID_TOKEN.to_string()))
        }
        Credentials::Missing => EnvCredentialValidator::with_lookup(|_| None),
    };

    let mut builder = ProviderRegistry::builder()
        .settings(test_settings())
        .connector(connector.clone())
        .credential_validator(Arc::new(validator))
        .listener(recorder.clone());
    for id in ids {
        builder = builder.provider(*id, ProviderConfig::stdio("fake-mcp-server", vec![]));
    }
    builder.build().unwrap()
}
