//! Configuration management for opsmux.
//!
//! Handles loading and saving configuration from TOML files.
//! Config files are stored in platform-specific locations:
//!
//! - **macOS/Linux**: `~/.config/opsmux/config.toml`
//! - **Windows**: `%APPDATA%\opsmux\config.toml`
//!
//! # Example
//!
//! ```toml
//! [settings]
//! queue_timeout_ms = 30000
//!
//! [settings.reconnect]
//! max_attempts = 3
//!
//! [providers.github]
//! type = "stdio"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-github"]
//! env = { GITHUB_PERSONAL_ACCESS_TOKEN = "ghp_..." }
//!
//! [providers.gitlab]
//! type = "sse"
//! url = "http://localhost:3002/sse"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Config file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Config directory name.
const CONFIG_DIR_NAME: &str = "opsmux";

/// Delimiters used to route namespaced capability names; forbidden in ids.
const ROUTING_DELIMITERS: [char; 2] = ['_', ':'];

// =============================================================================
// Configuration structures
// =============================================================================

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Proxy-wide tuning knobs
    #[serde(default)]
    pub settings: Settings,

    /// Provider id -> provider definition
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Proxy-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// How long a request may wait in a provider queue
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// Deadline for establishing a provider connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for a single request to a provider
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Pause between disconnect and re-initialize on reload
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// Reconnection policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

/// Transport kind of a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Sse,
    Http,
}

/// A single provider entry as written in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Transport kind (`stdio`, `sse`, `http`)
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    /// Disabled providers are not registered
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Executable for stdio providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment passed to the child and consulted for credentials
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Endpoint for sse/http providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Overrides the credential variable required for this provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_env: Option<String>,
}

/// Validated launch spec for a provider transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<String>,
    },
    Sse {
        url: String,
        headers: BTreeMap<String, String>,
    },
    Http {
        url: String,
    },
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_reload_debounce_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_enabled() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_timeout_ms: default_queue_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reload_debounce_ms: default_reload_debounce_ms(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            cooldown_ms: default_cooldown_ms(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Settings {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}

// =============================================================================
// ProviderConfig implementation
// =============================================================================

impl ProviderConfig {
    /// Stdio provider launched from `command`.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: TransportKind::Stdio,
            enabled: true,
            command: Some(command.into()),
            args,
            ..Default::default()
        }
    }

    /// Network-stream provider reachable at `url`.
    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Sse,
            enabled: true,
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Build the validated transport spec.
    pub fn transport(&self) -> Result<TransportConfig> {
        match self.kind {
            TransportKind::Stdio => {
                let command = self
                    .command
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        Error::Config("stdio provider requires a non-empty 'command'".to_string())
                    })?;
                Ok(TransportConfig::Stdio {
                    command: command.to_string(),
                    args: self.args.clone(),
                    env: self.env.clone(),
                    cwd: self.cwd.clone(),
                })
            }
            TransportKind::Sse => Ok(TransportConfig::Sse {
                url: self.required_url("sse")?,
                headers: self.headers.clone(),
            }),
            TransportKind::Http => Ok(TransportConfig::Http {
                url: self.required_url("http")?,
            }),
        }
    }

    fn required_url(&self, kind: &str) -> Result<String> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::Config(format!("{} provider requires a non-empty 'url'", kind)))
    }
}

// =============================================================================
// Config implementation
// =============================================================================

impl Config {
    /// Get the configuration directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join(CONFIG_DIR_NAME))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from a specific path.
    ///
    /// Returns a default (empty) config if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = ?path, "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        debug!(path = ?path, "Loading config");

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        info!(path = ?path, providers = config.providers.len(), "Config loaded successfully");
        Ok(config)
    }

    /// Check the whole config, reporting the first problem found.
    pub fn validate(&self) -> Result<()> {
        for (id, provider) in &self.providers {
            validate_provider_id(id)?;
            provider
                .transport()
                .map_err(|e| Error::Config(format!("provider '{}': {}", id, e)))?;
        }
        if self.settings.reconnect.max_attempts == 0 {
            return Err(Error::Config(
                "settings.reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Check if any provider is configured.
    pub fn has_any_provider(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Providers that should be registered, in id order.
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&String, &ProviderConfig)> {
        self.providers.iter().filter(|(_, p)| p.enabled)
    }
}

/// Provider ids become routing prefixes and must not contain the delimiters.
pub fn validate_provider_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Config("provider id must not be empty".to_string()));
    }
    if id.contains(ROUTING_DELIMITERS) {
        return Err(Error::Config(format!(
            "provider id '{}' must not contain '_' or ':'",
            id
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.has_any_provider());
        assert_eq!(config.settings.queue_timeout_ms, 30_000);
        assert_eq!(config.settings.reconnect.max_attempts, 3);
        assert_eq!(config.settings.reconnect.cooldown_ms, 30_000);
        assert_eq!(config.settings.reconnect.base_delay_ms, 5_000);
    }

    #[test]
    fn test_parse_providers() {
        let toml_str = r#"
            [providers.github]
            type = "stdio"
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-github"]
            env = { GITHUB_PERSONAL_ACCESS_TOKEN = "ghp_1234567890" }

            [providers.gitlab]
            type = "sse"
            url = "http://localhost:3002/sse"

            [providers.azure]
            type = "http"
            url = "http://localhost:4000/mcp"
            enabled = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.providers.len(), 3);
        assert!(config.validate().is_ok());

        let enabled: Vec<&String> = config.enabled_providers().map(|(id, _)| id).collect();
        assert_eq!(enabled, vec!["github", "gitlab"]);

        match config.providers["github"].transport().unwrap() {
            TransportConfig::Stdio { command, args, env, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
                assert!(env.contains_key("GITHUB_PERSONAL_ACCESS_TOKEN"));
            }
            other => panic!("Expected stdio transport, got {:?}", other),
        }
        assert_eq!(
            config.providers["gitlab"].transport().unwrap(),
            TransportConfig::Sse {
                url: "http://localhost:3002/sse".to_string(),
                headers: BTreeMap::new(),
            }
        );
    }

    #[test]
    fn test_invalid_provider_ids() {
        assert!(validate_provider_id("github").is_ok());
        assert!(validate_provider_id("azure-devops").is_ok());
        assert!(validate_provider_id("my_github").is_err());
        assert!(validate_provider_id("git:lab").is_err());
        assert!(validate_provider_id("").is_err());
    }

    #[test]
    fn test_missing_command_or_url() {
        let provider = ProviderConfig {
            kind: TransportKind::Stdio,
            ..Default::default()
        };
        assert!(provider.transport().is_err());

        let provider = ProviderConfig {
            kind: TransportKind::Sse,
            url: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(provider.transport().is_err());

        let mut config = Config::default();
        config.providers.insert("github".to_string(), ProviderConfig::default());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("github"));
    }

    #[test]
    fn test_load_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(
            temp_file,
            r#"
[settings]
reload_debounce_ms = 100

[providers.github]
type = "stdio"
command = "npx"
args = ["server-github"]
env = {{ GITHUB_PERSONAL_ACCESS_TOKEN = "ghp_abcdefghij" }}
"#
        )
        .unwrap();

        let loaded = Config::load_from(temp_file.path()).unwrap();
        assert_eq!(loaded.settings.reload_debounce_ms, 100);
        let github = &loaded.providers["github"];
        assert_eq!(github.kind, TransportKind::Stdio);
        assert_eq!(github.command.as_deref(), Some("npx"));
        assert_eq!(
            github.env.get("GITHUB_PERSONAL_ACCESS_TOKEN").map(String::as_str),
            Some("ghp_abcdefghij")
        );
    }

    #[test]
    fn test_load_from_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "[providers.github\ncommand = ").unwrap();
        let err = Config::load_from(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_nonexistent() {
        let path = PathBuf::from("/nonexistent/path/config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut config = Config::default();
        config.settings.reconnect.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
