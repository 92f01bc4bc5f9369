// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::{Arc, Mutex};

use harmony_domain::DomainEvent;
use serde_json::json;

/// Event publisher abstraction. Payloads are JSON values so publishers can
/// be passed around as trait objects.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &DomainEvent<serde_json::Value>);
}

/// Production bus: forwards events to structured logging and keeps
/// nothing in memory.
#[derive(Clone, Default)]
pub struct TracingEventBus;

impl EventPublisher for TracingEventBus {
    fn publish(&self, event: &DomainEvent<serde_json::Value>) {
        tracing::info!(
            target: "events",
            event = event.name,
            payload = %event.payload,
        );
    }
}

/// A minimal in-memory event bus that stores serialized events.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Failed to acquire lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieve and clear all captured events
    pub fn drain(&self) -> Vec<serde_json::Value> {
        let mut guard = self.inner.lock().expect("Failed to acquire lock");
        std::mem::take(&mut *guard)
    }

    /// Events with the given name, in publish order.
    pub fn named(&self, name: &str) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .expect("Failed to acquire lock")
            .iter()
            .filter(|v| v["name"] == name)
            .cloned()
            .collect()
    }
}

impl EventPublisher for InMemoryEventBus {
    fn publish(&self, event: &DomainEvent<serde_json::Value>) {
        let value = json!({
            "name": event.name,
            "occurred_at": event.occurred_at,
            "payload": event.payload,
        });
        self.inner
            .lock()
            .expect("Failed to acquire lock")
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_drain_events() {
        let bus = InMemoryEventBus::new();
        assert!(bus.is_empty());

        let evt = DomainEvent::new(
            "orchestrator.dispatch",
            json!({"job_id": 7, "type": "matching", "attempt": 2}),
        );

        bus.publish(&evt);
        assert_eq!(bus.len(), 1);

        let drained = bus.drain();
        assert_eq!(drained.len(), 1);
        let v = &drained[0];
        assert_eq!(v["name"], "orchestrator.dispatch");
        assert_eq!(v["payload"]["attempt"], 2);
        assert!(bus.is_empty());
    }

    #[test]
    fn named_filters_by_event_name() {
        let bus = InMemoryEventBus::new();
        bus.publish(&DomainEvent::new(
            "orchestrator.dispatch",
            json!({"job_id": 1}),
        ));
        bus.publish(&DomainEvent::new(
            "orchestrator.commit",
            json!({"job_id": 1}),
        ));

        assert_eq!(bus.named("orchestrator.commit").len(), 1);
        assert_eq!(bus.named("orchestrator.dead").len(), 0);
    }
}
