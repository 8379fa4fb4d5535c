//! Terminal backends
//!
//! A backend launches one tool at its execution time, pushes progress
//! through the `EventBus`, and resolves the launch call once with a
//! `LaunchOutcome`.

mod process;

pub use crate::protocol::{BackendEvent, LaunchOutcome, TerminalStatus};
pub use process::ProcessBackend;

use crate::settings::ExecutionSettings;
use crate::tool::ToolIdentity;
use crate::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

/// Launches tools in a terminal and reports how the run ended.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Whether the terminal is installed and running
    async fn check_status(&self) -> Result<TerminalStatus>;

    /// Run `tool` with `settings`. Returns once the run ends, is cancelled,
    /// or stops on a rate limit.
    async fn launch(&self, tool: ToolIdentity, settings: ExecutionSettings) -> Result<LaunchOutcome>;

    /// Abort a pending or running launch of `tool`
    async fn cancel(&self, tool: ToolIdentity) -> Result<()>;
}

const EVENT_CAPACITY: usize = 256;

/// Broadcast channel carrying backend events to every attached listener.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackendEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens.
    pub fn emit(&self, event: BackendEvent) {
        debug!("Backend event: {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);

        bus.emit(BackendEvent::Started {
            tool: Some(ToolIdentity::Codex),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.tool(), Some(ToolIdentity::Codex));
    }

    #[test]
    fn emit_without_listeners_is_harmless() {
        let bus = EventBus::default();
        bus.emit(BackendEvent::Output {
            tool: None,
            text: "hello".to_string(),
        });
        assert_eq!(bus.listener_count(), 0);
    }
}
