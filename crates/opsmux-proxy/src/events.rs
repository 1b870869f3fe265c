//! Provider state-change notifications.
//!
//! State transitions publish typed events on an unbounded channel; a single
//! dispatcher task hands each event to every registered listener in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::ClassifiedError;

/// A provider state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Connected {
        provider: String,
        tools: usize,
        resources: usize,
        prompts: usize,
    },
    Disconnected {
        provider: String,
    },
    Error {
        provider: String,
        error: ClassifiedError,
    },
    AuthFailed {
        provider: String,
        error: ClassifiedError,
    },
    ReconnectScheduled {
        provider: String,
        attempt: u32,
        delay: Duration,
    },
    ReconnectExhausted {
        provider: String,
        attempts: u32,
    },
}

impl ProviderEvent {
    pub fn provider(&self) -> &str {
        match self {
            ProviderEvent::Connected { provider, .. }
            | ProviderEvent::Disconnected { provider }
            | ProviderEvent::Error { provider, .. }
            | ProviderEvent::AuthFailed { provider, .. }
            | ProviderEvent::ReconnectScheduled { provider, .. }
            | ProviderEvent::ReconnectExhausted { provider, .. } => provider,
        }
    }
}

/// Observer of provider transitions.
pub trait ProviderEventListener: Send + Sync {
    fn on_event(&self, event: &ProviderEvent);
}

/// Writes every transition to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl ProviderEventListener for LoggingListener {
    fn on_event(&self, event: &ProviderEvent) {
        match event {
            ProviderEvent::Connected {
                provider,
                tools,
                resources,
                prompts,
            } => info!(
                provider = %provider,
                tools,
                resources,
                prompts,
                "Provider connected"
            ),
            ProviderEvent::Disconnected { provider } => {
                info!(provider = %provider, "Provider disconnected")
            }
            ProviderEvent::Error { provider, error } => warn!(
                provider = %provider,
                kind = %error.kind,
                should_reconnect = error.should_reconnect,
                "{}",
                error.message
            ),
            ProviderEvent::AuthFailed { provider, error } => {
                error!(provider = %provider, "{}", error.message)
            }
            ProviderEvent::ReconnectScheduled {
                provider,
                attempt,
                delay,
            } => info!(
                provider = %provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnection scheduled"
            ),
            ProviderEvent::ReconnectExhausted { provider, attempts } => warn!(
                provider = %provider,
                attempts,
                "Giving up on reconnection; reload the provider to retry"
            ),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ProviderEvent>;

/// Start the dispatcher loop. It ends once every sender is dropped.
pub fn spawn_dispatcher(
    listeners: Vec<Arc<dyn ProviderEventListener>>,
) -> (EventSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProviderEvent>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for listener in &listeners {
                listener.on_event(&event);
            }
        }
        debug!("Provider event dispatcher stopped");
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProviderEvent>>);

    impl ProviderEventListener for Recorder {
        fn on_event(&self, event: &ProviderEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn test_dispatcher_fans_out_in_order() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let (tx, handle) = spawn_dispatcher(vec![
            first.clone() as Arc<dyn ProviderEventListener>,
            second.clone() as Arc<dyn ProviderEventListener>,
            Arc::new(LoggingListener) as Arc<dyn ProviderEventListener>,
        ]);

        tx.send(ProviderEvent::Disconnected {
            provider: "github".to_string(),
        })
        .unwrap();
        tx.send(ProviderEvent::ReconnectExhausted {
            provider: "gitlab".to_string(),
            attempts: 3,
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        for recorder in [first, second] {
            let events = recorder.0.lock().unwrap();
            let providers: Vec<&str> = events.iter().map(|e| e.provider()).collect();
            assert_eq!(providers, vec!["github", "gitlab"]);
        }
    }
}
