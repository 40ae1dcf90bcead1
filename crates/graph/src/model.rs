use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowline_core::types::{FlowId, NodeId};

use crate::predicates::PredicateGroup;

/// A flow definition describing a multi-step automated subscriber journey.
///
/// Produced by the external visual builder; the engine only ever consumes
/// the validated form ([`crate::ValidGraph`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraph {
    pub id: FlowId,
    pub name: String,
    pub description: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
}

/// A single node within a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
}

impl Node {
    /// Creates a node with a fresh id.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
        }
    }

    /// Short label for logs and history records.
    pub fn kind_label(&self) -> &'static str {
        match &self.kind {
            NodeKind::Trigger { .. } => "trigger",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Delay(_) => "delay",
            NodeKind::Action { .. } => "action",
            NodeKind::Split => "split",
            NodeKind::Exit { .. } => "exit",
        }
    }
}

/// The kind of work a node performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodeKind {
    /// Entry point; the event filter is applied by the external trigger
    /// router, the engine treats `event_type` as opaque.
    Trigger { event_type: String },
    /// Branching over the subscriber context; each rule is tried in order
    /// and the first match selects the edge labeled with that branch.
    Condition { rules: Vec<BranchRule> },
    /// Pause until a computed wake time.
    Delay(DelayPolicy),
    /// Invoke an external action executor.
    Action {
        action: ActionKind,
        params: serde_json::Value,
    },
    /// Deterministic weighted A/B split over variant-labeled edges.
    Split,
    /// Terminal node; completes the execution.
    Exit { reason: String },
}

/// One branch of a condition node: a label and the predicate that selects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRule {
    pub label: String,
    pub predicate: PredicateGroup,
}

/// How a delay node computes its wake time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum DelayPolicy {
    /// Wake a fixed duration after the delay node is entered.
    FixedDuration { duration_secs: u64 },
    /// Wake at the next timestamp the store's engagement profile rates
    /// highly; falls back to "now" when no profile is available.
    OptimalSendTime,
}

/// Concrete action kinds dispatchable from an Action node. The snake_case
/// serialization doubles as the stable registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendEmail,
    SendSms,
    SendPush,
    UpdateProfile,
    AddTag,
    RemoveTag,
    Webhook,
}

impl ActionKind {
    /// Every dispatchable kind, for bulk executor registration.
    pub const ALL: [ActionKind; 7] = [
        ActionKind::SendEmail,
        ActionKind::SendSms,
        ActionKind::SendPush,
        ActionKind::UpdateProfile,
        ActionKind::AddTag,
        ActionKind::RemoveTag,
        ActionKind::Webhook,
    ];

    /// Stable string key used for registry lookup and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SendEmail => "send_email",
            ActionKind::SendSms => "send_sms",
            ActionKind::SendPush => "send_push",
            ActionKind::UpdateProfile => "update_profile",
            ActionKind::AddTag => "add_tag",
            ActionKind::RemoveTag => "remove_tag",
            ActionKind::Webhook => "webhook",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<EdgeLabel>,
}

impl Edge {
    /// Plain edge between two nodes (no branch semantics).
    pub fn new(source: NodeId, target: NodeId) -> Self {
        Self {
            source,
            target,
            label: None,
        }
    }

    /// Edge selected when a condition rule with `label` matches.
    pub fn branch(source: NodeId, target: NodeId, label: impl Into<String>) -> Self {
        Self {
            source,
            target,
            label: Some(EdgeLabel::Branch {
                label: label.into(),
            }),
        }
    }

    /// Edge taken when no condition rule matches.
    pub fn default_branch(source: NodeId, target: NodeId) -> Self {
        Self {
            source,
            target,
            label: Some(EdgeLabel::Default),
        }
    }

    /// Weighted variant edge out of a split node.
    pub fn variant(source: NodeId, target: NodeId, name: impl Into<String>, weight: u32) -> Self {
        Self {
            source,
            target,
            label: Some(EdgeLabel::Variant {
                name: name.into(),
                weight,
            }),
        }
    }
}

/// Optional semantics attached to an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EdgeLabel {
    /// Selected by the condition rule with the same label.
    Branch { label: String },
    /// Fallback edge of a condition node.
    Default,
    /// Weighted arm of a split node.
    Variant { name: String, weight: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_serde_roundtrip() {
        let node = Node::new(NodeKind::Delay(DelayPolicy::FixedDuration {
            duration_secs: 3600,
        }));
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"kind\":\"delay\""));
        assert!(json.contains("\"policy\":\"fixed_duration\""));

        let back: Node = serde_json::from_str(&json).unwrap();
        match back.kind {
            NodeKind::Delay(DelayPolicy::FixedDuration { duration_secs }) => {
                assert_eq!(duration_secs, 3600)
            }
            other => panic!("Expected fixed delay, got {:?}", other),
        }
    }

    #[test]
    fn test_action_kind_stable_keys() {
        let kind = ActionKind::SendEmail;
        assert_eq!(kind.as_str(), "send_email");
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"send_email\"");
    }

    #[test]
    fn test_edge_constructors() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(Edge::new(a, b).label.is_none());
        assert_eq!(
            Edge::branch(a, b, "vip").label,
            Some(EdgeLabel::Branch {
                label: "vip".to_string()
            })
        );
        assert_eq!(Edge::default_branch(a, b).label, Some(EdgeLabel::Default));
    }
}
