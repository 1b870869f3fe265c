//! MCP (Model Context Protocol) plumbing for opsmux.
//!
//! Two directions live here: the downstream client sessions opsmux opens to
//! each provider's MCP server (stdio subprocess or SSE stream), and the
//! upstream server that exposes the merged providers to the AI client.

pub mod connection;
pub mod protocol;
mod rpc;
pub mod server;
pub mod sse;
pub mod stdio;
pub mod transport;

pub use connection::{
    Connector, McpConnection, PromptArguments, TransportConnector, TransportEvent,
    TransportHooks,
};
pub use server::{McpServer, ProxyBackend};
pub use sse::SseConnection;
pub use stdio::StdioConnection;
