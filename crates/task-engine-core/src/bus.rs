//! The event bus: a best-effort fanout sink for status/log/progress
//! events, consumed by external observers (CLI, dashboards).
//!
//! Naming follows `EventBus` as used elsewhere in the retrieved corpus;
//! the teacher crate has no bus of its own, so the in-process
//! implementation here is built directly on `tokio::sync::broadcast`.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

/// The three event kinds the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Status,
    Log,
    Progress,
}

/// A fanout sink for engine events.
///
/// Delivery is best-effort and asynchronous; `emit` never propagates a
/// failure back to the caller (the engine logs a failed delivery and
/// moves on -- the task itself is never affected).
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, kind: EventKind, payload: Value);
}

/// An event observed on the bus, as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub kind: EventKind,
    pub payload: Value,
}

/// In-process event bus backed by a `tokio::sync::broadcast` channel.
///
/// Subscribers that lag behind the configured capacity miss the oldest
/// events rather than blocking the emitter -- broadcast's usual trade-off,
/// appropriate here since bus delivery is explicitly best-effort.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn emit(&self, kind: EventKind, payload: Value) {
        // `send` only errors when there are no subscribers; that is the
        // expected steady state when nobody is watching, not a failure.
        let _ = self.sender.send(BusEvent { kind, payload });
    }
}

// Compile-time assertion: EventBus must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn EventBus) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = BroadcastEventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(EventKind::Status, serde_json::json!({"status": "running"}))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Status);
        assert_eq!(event.payload, serde_json::json!({"status": "running"}));
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_error() {
        let bus = BroadcastEventBus::new(16);
        bus.emit(EventKind::Log, serde_json::json!("hello")).await;
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_the_event() {
        let bus = BroadcastEventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(EventKind::Progress, serde_json::json!({"pct": 10}))
            .await;

        assert_eq!(a.recv().await.unwrap().payload, serde_json::json!({"pct": 10}));
        assert_eq!(b.recv().await.unwrap().payload, serde_json::json!({"pct": 10}));
    }
}
