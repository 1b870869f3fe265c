//! Provider supervision for opsmux.
//!
//! Keeps one MCP connection per configured provider alive: validates
//! credentials before connecting, classifies failures, reconnects with
//! exponential backoff, queues calls while a provider is updating and routes
//! namespaced calls to the right provider.

pub mod classifier;
pub mod events;
pub mod policy;
pub mod queue;
pub mod registry;
mod scheduler;
pub mod status;
pub mod supervisor;

pub use classifier::{classify, classify_value, ClassifiedError, ErrorKind};
pub use events::{LoggingListener, ProviderEvent, ProviderEventListener};
pub use policy::{should_attempt_reconnection, ReconnectDecision, ReconnectPolicy};
pub use queue::{PendingCall, QueueTicket, RequestQueue};
pub use registry::{ProviderRegistry, ProviderRegistryBuilder};
pub use status::{ProviderStatusEntry, StatusReport};
pub use supervisor::{Capabilities, ProviderSlot, ProviderSnapshot, ReconnectState};
