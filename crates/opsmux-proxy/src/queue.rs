//! Per-provider queue of calls issued while the provider is updating.
//!
//! Every entry is settled exactly once. Whoever removes an entry from the
//! queue (drain, expiry, teardown) owns it and sends its result; nothing
//! else can reach its responder afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opsmux_core::{Error, Result};
use opsmux_mcp::{McpConnection, PromptArguments};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A call held until its provider is available again.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingCall {
    Tool {
        name: String,
        arguments: Value,
    },
    Resource {
        uri: String,
    },
    Prompt {
        name: String,
        arguments: Option<PromptArguments>,
    },
}

impl PendingCall {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingCall::Tool { .. } => "tool-call",
            PendingCall::Resource { .. } => "resource-read",
            PendingCall::Prompt { .. } => "prompt-fetch",
        }
    }

    /// Issue the call against a live connection.
    pub async fn dispatch(self, connection: &dyn McpConnection) -> Result<Value> {
        match self {
            PendingCall::Tool { name, arguments } => connection.call_tool(&name, arguments).await,
            PendingCall::Resource { uri } => connection.read_resource(&uri).await,
            PendingCall::Prompt { name, arguments } => {
                connection.get_prompt(&name, arguments).await
            }
        }
    }
}

type Responder = oneshot::Sender<Result<Value>>;

struct QueuedRequest {
    id: u64,
    call: PendingCall,
    responder: Responder,
    enqueued_at: Instant,
    timeout_handle: JoinHandle<()>,
}

/// Handle to a queued call's eventual result.
#[derive(Debug)]
pub struct QueueTicket {
    id: u64,
    provider: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl QueueTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the entry is drained, rejected or expires.
    pub async fn wait(self) -> Result<Value> {
        self.rx.await.unwrap_or_else(|_| {
            Err(Error::QueueRejected(format!(
                "Queued request for provider {} was dropped",
                self.provider
            )))
        })
    }
}

struct QueueInner {
    provider: String,
    timeout: Duration,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<QueuedRequest>>,
}

impl QueueInner {
    fn entries(&self) -> MutexGuard<'_, VecDeque<QueuedRequest>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn timeout_error(&self) -> Error {
        Error::QueueTimeout {
            provider: self.provider.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Called by an entry's own timeout task.
    fn expire(&self, id: u64) {
        let entry = {
            let mut entries = self.entries();
            entries
                .iter()
                .position(|e| e.id == id)
                .and_then(|pos| entries.remove(pos))
        };
        if let Some(entry) = entry {
            warn!(
                provider = %self.provider,
                id,
                kind = entry.call.kind(),
                "Queued request timed out"
            );
            let _ = entry.responder.send(Err(self.timeout_error()));
        }
    }
}

/// FIFO of calls for one provider.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn new(provider: impl Into<String>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                provider: provider.into(),
                timeout,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a call and arm its timeout. Must run inside a tokio runtime.
    pub fn enqueue(&self, call: PendingCall) -> QueueTicket {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, rx) = oneshot::channel();

        // Pushed under the lock the timeout task needs, so it cannot miss the entry.
        let mut entries = self.inner.entries();
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(id);
            }
        });
        debug!(
            provider = %self.inner.provider,
            id,
            kind = call.kind(),
            queued = entries.len() + 1,
            "Request queued"
        );
        entries.push_back(QueuedRequest {
            id,
            call,
            responder,
            enqueued_at: Instant::now(),
            timeout_handle,
        });

        QueueTicket {
            id,
            provider: self.inner.provider.clone(),
            rx,
        }
    }

    fn take_all(&self) -> Vec<QueuedRequest> {
        let taken: Vec<QueuedRequest> = self.inner.entries().drain(..).collect();
        for entry in &taken {
            entry.timeout_handle.abort();
        }
        taken
    }

    /// Issue every queued call in submission order, one at a time.
    ///
    /// Each entry settles with its own result; a failure does not affect the
    /// entries behind it. Returns the number of entries processed.
    pub async fn drain(&self, connection: &dyn McpConnection) -> usize {
        let entries = self.take_all();
        let count = entries.len();
        if count > 0 {
            debug!(provider = %self.inner.provider, count, "Draining queued requests");
        }

        for entry in entries {
            let result = entry.call.dispatch(connection).await;
            if result.is_err() {
                debug!(provider = %self.inner.provider, id = entry.id, "Queued request failed");
            }
            let _ = entry.responder.send(result);
        }
        count
    }

    /// Reject every entry with `reason` and clear the queue.
    pub fn reject_all(&self, reason: &str) -> usize {
        let entries = self.take_all();
        let count = entries.len();
        if count > 0 {
            warn!(provider = %self.inner.provider, count, reason, "Rejecting queued requests");
        }
        for entry in entries {
            let _ = entry
                .responder
                .send(Err(Error::QueueRejected(reason.to_string())));
        }
        count
    }

    /// Expire every entry older than the queue timeout. Returns how many expired.
    pub fn timeout_stale(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<QueuedRequest> = {
            let mut entries = self.inner.entries();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = entries
                .drain(..)
                .partition(|e| now.saturating_duration_since(e.enqueued_at) >= self.inner.timeout);
            *entries = fresh;
            stale.into_iter().collect()
        };

        for entry in &expired {
            entry.timeout_handle.abort();
        }
        let count = expired.len();
        for entry in expired {
            let _ = entry.responder.send(Err(self.inner.timeout_error()));
        }
        count
    }
}
