use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a published flow definition.
pub type FlowId = Uuid;

/// Identifier of a single node within a flow graph.
pub type NodeId = Uuid;

/// Identifier of one subscriber's execution ledger entry.
pub type EntryId = Uuid;

/// Opaque commerce-platform customer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Opaque commerce-platform store identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle event emitted by the engine into the analytics pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub flow_id: FlowId,
    pub entry_id: Option<EntryId>,
    pub subscriber_id: Option<SubscriberId>,
    pub node_id: Option<NodeId>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Flow lifecycle
    FlowPublished,
    FlowArchived,
    // Execution lifecycle
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    // Step-level events
    StepCompleted,
    DelayScheduled,
    ActionDispatched,
    ActionFailed,
}
