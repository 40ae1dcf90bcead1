//! Lifecycle event bus.
//!
//! Engine components take an `Arc<dyn EventSink>` and publish flow
//! lifecycle events through it. Sinks fan out to whatever the deployment
//! wires up: an analytics pipeline, a message topic, customer webhooks.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::types::{EntryId, EventType, FlowEvent, FlowId, SubscriberId};

pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlowEvent);
}

/// Discards everything. Default for components built without an explicit
/// sink.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: FlowEvent) {}
}

/// Buffers emitted events for inspection in tests.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FlowEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.lock().expect("capture sink poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("capture sink poisoned").len()
    }

    /// How many captured events carry the given type.
    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("capture sink poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("capture sink poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: FlowEvent) {
        self.events.lock().expect("capture sink poisoned").push(event);
    }
}

/// Builds a `FlowEvent` stamped with a fresh id and the current time.
pub fn make_event(
    event_type: EventType,
    flow_id: FlowId,
    entry_id: Option<EntryId>,
    subscriber_id: Option<SubscriberId>,
) -> FlowEvent {
    FlowEvent {
        event_id: Uuid::new_v4(),
        event_type,
        flow_id,
        entry_id,
        subscriber_id,
        node_id: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
