//! Broadcast bus for `EngineEvent`s.
//!
//! The executor and benchmark runner publish lifecycle events here; the CLI
//! subscribes to drive progress output. Publishing with no subscribers is a
//! no-op, so the engine never blocks on a slow or absent consumer.

use flowbench_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Default channel capacity for a single CLI invocation.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Multi-consumer engine event bus.
///
/// Cloning the bus clones the sender; every clone publishes into the same
/// channel.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers. Dropped if there are none.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
