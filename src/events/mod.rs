//! C2: process-wide fan-out of lifecycle events.
//!
//! Grounded in the teacher's orchestrator result channel (`mpsc::channel` used
//! to fan task results back out of `AgentOrchestrator::run`), generalized to
//! multiple subscribers with the lossy, drop-and-close-on-slow-consumer policy
//! §4.2 requires — `tokio::sync::broadcast` already implements exactly that
//! semantics (a lagging receiver gets `RecvError::Lagged` rather than blocking
//! the sender), so it is used directly rather than hand-rolled.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    ActivityLogged,
    DeliverableAdded,
    AgentSpawned,
    AgentCompleted,
    PluginToggled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self { kind, payload }
    }
}

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out bus. Cloning is cheap (`broadcast::Sender` is itself an `Arc`
/// handle); the bus is meant to be owned once by the application root and
/// shared by reference.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Best-effort publish. No subscribers is not an error; a lagging
    /// subscriber silently drops the oldest events it missed rather than
    /// blocking this call (the channel never backs up the publisher).
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
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
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::new(EventKind::TaskCreated, serde_json::json!({"id": "t1"})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::TaskCreated);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.publish(Event::new(EventKind::TaskDeleted, serde_json::json!({})));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking_publisher() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(Event::new(EventKind::ActivityLogged, serde_json::json!({ "i": i })));
        }

        // The channel is bounded; a subscriber that never drained it sees a
        // Lagged error rather than causing publish() to block.
        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(_)) | Ok(_) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
