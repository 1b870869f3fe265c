//! Provider-facing connection abstraction.
//!
//! A [`McpConnection`] is one live session to a provider's MCP server. The
//! supervisor never talks to a transport directly: it asks a [`Connector`]
//! for a connection, connects it with a set of [`TransportHooks`], and then
//! listens on the hooks channel for unsolicited close/error notifications.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opsmux_core::{
    Error, PromptDescriptor, ResourceDescriptor, Result, ToolDescriptor, TransportConfig,
};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::sse::SseConnection;
use crate::stdio::StdioConnection;

/// String-valued prompt arguments.
pub type PromptArguments = BTreeMap<String, String>;

/// Unsolicited notification from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The peer went away (process exit, stream end).
    Closed { reason: String },
    /// The transport hit an error it could not recover from.
    Error { message: String },
}

impl TransportEvent {
    pub fn describe(&self) -> &str {
        match self {
            TransportEvent::Closed { reason } => reason,
            TransportEvent::Error { message } => message,
        }
    }
}

/// Sending half handed to a connection on `connect`.
#[derive(Debug, Clone)]
pub struct TransportHooks {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportHooks {
    /// Create hooks and the receiver the supervisor watches.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn closed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(TransportEvent::Closed {
            reason: reason.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.tx.send(TransportEvent::Error {
            message: message.into(),
        });
    }
}

/// One session with a provider's MCP server.
#[async_trait]
pub trait McpConnection: Send + Sync {
    /// Establish the session and complete the MCP handshake.
    async fn connect(&self, hooks: TransportHooks) -> Result<()>;

    /// Tear the session down. Closing a closed connection is a no-op.
    async fn close(&self) -> Result<()>;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>>;

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    async fn read_resource(&self, uri: &str) -> Result<Value>;

    async fn get_prompt(&self, name: &str, arguments: Option<PromptArguments>) -> Result<Value>;
}

/// Factory creating unconnected connections from a launch spec.
pub trait Connector: Send + Sync {
    fn create(
        &self,
        provider_id: &str,
        transport: &TransportConfig,
    ) -> Result<Arc<dyn McpConnection>>;
}

/// Connector for the real transports.
#[derive(Debug, Clone)]
pub struct TransportConnector {
    request_timeout: Duration,
}

impl TransportConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Connector for TransportConnector {
    fn create(
        &self,
        provider_id: &str,
        transport: &TransportConfig,
    ) -> Result<Arc<dyn McpConnection>> {
        match transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => Ok(Arc::new(StdioConnection::new(
                provider_id,
                command.clone(),
                args.clone(),
                env.clone(),
                cwd.clone(),
                self.request_timeout,
            ))),
            TransportConfig::Sse { url, headers } => Ok(Arc::new(SseConnection::new(
                provider_id,
                url.clone(),
                headers.clone(),
                self.request_timeout,
            )?)),
            TransportConfig::Http { url } => Err(Error::NotImplemented(format!(
                "HTTP transport for provider '{}' ({})",
                provider_id, url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_transport_fails_fast() {
        let connector = TransportConnector::default();
        let result = connector.create(
            "azure",
            &TransportConfig::Http {
                url: "http://localhost:4000/mcp".to_string(),
            },
        );
        let err = result.err().expect("http transport should be rejected");
        assert!(matches!(err, Error::NotImplemented(_)));
        assert!(err.to_string().contains("not yet implemented"));
    }

    #[test]
    fn test_stdio_transport_is_created_unconnected() {
        let connector = TransportConnector::default();
        let result = connector.create(
            "github",
            &TransportConfig::Stdio {
                command: "definitely-not-a-real-binary".to_string(),
                args: vec![],
                env: BTreeMap::new(),
                cwd: None,
            },
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_hooks_deliver_events_in_order() {
        let (hooks, mut rx) = TransportHooks::channel();
        hooks.error("broken pipe");
        hooks.closed("process exited");

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Error {
                message: "broken pipe".to_string()
            })
        );
        let closed = rx.recv().await.unwrap();
        assert_eq!(closed.describe(), "process exited");
    }
}
