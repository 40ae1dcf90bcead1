//! Structural validation. Turns a builder-authored [`FlowGraph`] into a
//! read-only [`ValidGraph`]: an arena of nodes indexed by id plus an
//! adjacency map. Published graphs are never mutated; executions hold an
//! `Arc<ValidGraph>` for their captured version.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use flowline_core::types::{FlowId, NodeId};

use crate::model::{DelayPolicy, Edge, EdgeLabel, FlowGraph, Node, NodeKind};

/// Structural defects rejected at publish time, never seen at runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("flow graph has no trigger node")]
    MissingEntry,

    #[error("second trigger node {node_id}; a flow has exactly one entry")]
    DuplicateEntry { node_id: NodeId },

    #[error("node id {node_id} appears more than once")]
    DuplicateNode { node_id: NodeId },

    #[error("edge {from} -> {target} references a missing node")]
    DanglingEdge { from: NodeId, target: NodeId },

    #[error("node {node_id} is unreachable from the trigger")]
    Unreachable { node_id: NodeId },

    #[error("branching at node {node_id} is ambiguous: {detail}")]
    AmbiguousBranch { node_id: NodeId, detail: String },

    #[error("split node {node_id} needs at least two positively weighted variant edges")]
    InvalidSplit { node_id: NodeId },

    #[error("delay of {duration_secs}s at node {node_id} exceeds the ten-year ceiling")]
    InvalidDelay { node_id: NodeId, duration_secs: u64 },
}

/// Longest fixed delay a flow may schedule, in seconds (ten years).
pub const MAX_DELAY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Immutable, validated flow graph. All engine consumers receive this
/// read-only view; the raw [`FlowGraph`] never leaves the publish path.
#[derive(Debug)]
pub struct ValidGraph {
    graph: FlowGraph,
    index: HashMap<NodeId, usize>,
    // node id -> indexes into graph.edges, in declaration order
    adjacency: HashMap<NodeId, Vec<usize>>,
    entry: NodeId,
}

impl ValidGraph {
    pub fn id(&self) -> FlowId {
        self.graph.id
    }

    pub fn name(&self) -> &str {
        &self.graph.name
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.index.get(&id).map(|&i| &self.graph.nodes[i])
    }

    pub fn node_count(&self) -> usize {
        self.graph.nodes.len()
    }

    /// The underlying definition, for serialization and operator tooling.
    pub fn definition(&self) -> &FlowGraph {
        &self.graph
    }

    /// Outgoing edges of a node in declaration order.
    pub fn outgoing(&self, id: NodeId) -> Vec<&Edge> {
        self.adjacency
            .get(&id)
            .map(|idxs| idxs.iter().map(|&i| &self.graph.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Targets of a node's outgoing edges; with `branch_label` set, only
    /// edges carrying that branch label.
    pub fn next_nodes(&self, id: NodeId, branch_label: Option<&str>) -> Vec<NodeId> {
        self.outgoing(id)
            .into_iter()
            .filter(|edge| match branch_label {
                None => true,
                Some(wanted) => matches!(
                    &edge.label,
                    Some(EdgeLabel::Branch { label }) if label == wanted
                ),
            })
            .map(|edge| edge.target)
            .collect()
    }

    /// The sole successor of a linear node, if it has exactly one.
    pub fn single_target(&self, id: NodeId) -> Option<NodeId> {
        let out = self.outgoing(id);
        match out.as_slice() {
            [edge] => Some(edge.target),
            _ => None,
        }
    }

    /// Target of the edge labeled with `label` out of a condition node.
    pub fn branch_target(&self, id: NodeId, label: &str) -> Option<NodeId> {
        self.outgoing(id).into_iter().find_map(|edge| match &edge.label {
            Some(EdgeLabel::Branch { label: l }) if l == label => Some(edge.target),
            _ => None,
        })
    }

    /// Target of the default edge out of a condition node.
    pub fn default_target(&self, id: NodeId) -> Option<NodeId> {
        self.outgoing(id).into_iter().find_map(|edge| match &edge.label {
            Some(EdgeLabel::Default) => Some(edge.target),
            _ => None,
        })
    }

    /// Variant arms of a split node as (name, weight, target).
    pub fn variants(&self, id: NodeId) -> Vec<(&str, u32, NodeId)> {
        self.outgoing(id)
            .into_iter()
            .filter_map(|edge| match &edge.label {
                Some(EdgeLabel::Variant { name, weight }) => {
                    Some((name.as_str(), *weight, edge.target))
                }
                _ => None,
            })
            .collect()
    }
}

/// Validates a flow graph and produces the immutable execution view.
pub fn validate(graph: FlowGraph) -> Result<ValidGraph, GraphError> {
    // Arena index; duplicate ids are authoring corruption.
    let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(graph.nodes.len());
    for (i, node) in graph.nodes.iter().enumerate() {
        if index.insert(node.id, i).is_some() {
            return Err(GraphError::DuplicateNode { node_id: node.id });
        }
    }

    // Exactly one trigger.
    let mut entry: Option<NodeId> = None;
    for node in &graph.nodes {
        if matches!(node.kind, NodeKind::Trigger { .. }) {
            if entry.is_some() {
                return Err(GraphError::DuplicateEntry { node_id: node.id });
            }
            entry = Some(node.id);
        }
    }
    let entry = entry.ok_or(GraphError::MissingEntry)?;

    // Every edge endpoint must exist.
    let mut adjacency: HashMap<NodeId, Vec<usize>> = HashMap::new();
    for (i, edge) in graph.edges.iter().enumerate() {
        if !index.contains_key(&edge.source) || !index.contains_key(&edge.target) {
            return Err(GraphError::DanglingEdge {
                from: edge.source,
                target: edge.target,
            });
        }
        adjacency.entry(edge.source).or_default().push(i);
    }

    // Per-node out-degree and labeling rules.
    for node in &graph.nodes {
        let out: Vec<&Edge> = adjacency
            .get(&node.id)
            .map(|idxs| idxs.iter().map(|&i| &graph.edges[i]).collect())
            .unwrap_or_default();
        check_node_edges(node, &out)?;
    }

    // Reachability from the entry.
    let mut visited: HashSet<NodeId> = HashSet::with_capacity(graph.nodes.len());
    let mut queue = VecDeque::from([entry]);
    visited.insert(entry);
    while let Some(id) = queue.pop_front() {
        if let Some(idxs) = adjacency.get(&id) {
            for &i in idxs {
                let target = graph.edges[i].target;
                if visited.insert(target) {
                    queue.push_back(target);
                }
            }
        }
    }
    for node in &graph.nodes {
        if !visited.contains(&node.id) {
            return Err(GraphError::Unreachable { node_id: node.id });
        }
    }

    Ok(ValidGraph {
        graph,
        index,
        adjacency,
        entry,
    })
}

fn check_node_edges(node: &Node, out: &[&Edge]) -> Result<(), GraphError> {
    match &node.kind {
        NodeKind::Trigger { .. } => {
            if out.len() != 1 {
                return Err(ambiguous(node, "trigger node must have exactly one outgoing edge"));
            }
        }
        NodeKind::Delay(policy) => {
            if let DelayPolicy::FixedDuration { duration_secs } = policy {
                if *duration_secs > MAX_DELAY_SECS {
                    return Err(GraphError::InvalidDelay {
                        node_id: node.id,
                        duration_secs: *duration_secs,
                    });
                }
            }
            if out.len() != 1 {
                return Err(ambiguous(node, "delay node must have exactly one outgoing edge"));
            }
        }
        NodeKind::Action { .. } => {
            if out.len() > 1 {
                return Err(ambiguous(node, "action node may have at most one outgoing edge"));
            }
        }
        NodeKind::Exit { .. } => {
            if !out.is_empty() {
                return Err(ambiguous(node, "exit node cannot have outgoing edges"));
            }
        }
        NodeKind::Condition { rules } => {
            let mut labels: HashSet<&str> = HashSet::new();
            let mut defaults = 0usize;
            for edge in out {
                match &edge.label {
                    Some(EdgeLabel::Branch { label }) => {
                        if !labels.insert(label.as_str()) {
                            return Err(ambiguous(
                                node,
                                &format!("duplicate branch label `{label}`"),
                            ));
                        }
                    }
                    Some(EdgeLabel::Default) => defaults += 1,
                    _ => {
                        return Err(ambiguous(node, "condition edges must carry a branch label"))
                    }
                }
            }
            if defaults > 1 {
                return Err(ambiguous(node, "more than one default edge"));
            }
            if out.len() < 2 {
                return Err(ambiguous(node, "condition node needs at least two outgoing edges"));
            }
            // The node's rules and the labeled edges must agree exactly.
            for rule in rules {
                if !labels.contains(rule.label.as_str()) {
                    return Err(ambiguous(
                        node,
                        &format!("no edge for branch label `{}`", rule.label),
                    ));
                }
            }
            for label in &labels {
                if !rules.iter().any(|r| r.label == *label) {
                    return Err(ambiguous(
                        node,
                        &format!("edge label `{label}` has no matching rule"),
                    ));
                }
            }
        }
        NodeKind::Split => {
            let mut names: HashSet<&str> = HashSet::new();
            for edge in out {
                match &edge.label {
                    Some(EdgeLabel::Variant { name, weight }) if *weight > 0 => {
                        if !names.insert(name.as_str()) {
                            return Err(GraphError::InvalidSplit { node_id: node.id });
                        }
                    }
                    _ => return Err(GraphError::InvalidSplit { node_id: node.id }),
                }
            }
            if out.len() < 2 {
                return Err(GraphError::InvalidSplit { node_id: node.id });
            }
        }
    }
    Ok(())
}

fn ambiguous(node: &Node, detail: &str) -> GraphError {
    GraphError::AmbiguousBranch {
        node_id: node.id,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionKind, BranchRule, DelayPolicy};
    use crate::predicates::PredicateGroup;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn graph_with(nodes: Vec<Node>, edges: Vec<Edge>) -> FlowGraph {
        FlowGraph {
            id: Uuid::new_v4(),
            name: "Test Flow".to_string(),
            description: "flow under test".to_string(),
            nodes,
            edges,
            created_at: Utc::now(),
        }
    }

    fn linear_flow() -> FlowGraph {
        let trigger = Node::new(NodeKind::Trigger {
            event_type: "order/created".into(),
        });
        let delay = Node::new(NodeKind::Delay(DelayPolicy::FixedDuration {
            duration_secs: 3600,
        }));
        let action = Node::new(NodeKind::Action {
            action: ActionKind::SendEmail,
            params: json!({"template": "thank_you"}),
        });
        let exit = Node::new(NodeKind::Exit {
            reason: "done".into(),
        });
        let edges = vec![
            Edge::new(trigger.id, delay.id),
            Edge::new(delay.id, action.id),
            Edge::new(action.id, exit.id),
        ];
        graph_with(vec![trigger, delay, action, exit], edges)
    }

    #[test]
    fn test_valid_linear_flow() {
        let graph = linear_flow();
        let trigger_id = graph.nodes[0].id;
        let delay_id = graph.nodes[1].id;

        let valid = validate(graph).unwrap();
        assert_eq!(valid.entry(), trigger_id);
        assert_eq!(valid.single_target(trigger_id), Some(delay_id));
        assert_eq!(valid.node_count(), 4);
    }

    #[test]
    fn test_missing_entry() {
        let exit = Node::new(NodeKind::Exit {
            reason: "done".into(),
        });
        let graph = graph_with(vec![exit], vec![]);
        assert_eq!(validate(graph).unwrap_err(), GraphError::MissingEntry);
    }

    #[test]
    fn test_duplicate_entry() {
        let t1 = Node::new(NodeKind::Trigger {
            event_type: "a".into(),
        });
        let t2 = Node::new(NodeKind::Trigger {
            event_type: "b".into(),
        });
        let exit = Node::new(NodeKind::Exit {
            reason: "done".into(),
        });
        let t2_id = t2.id;
        let edges = vec![Edge::new(t1.id, exit.id), Edge::new(t2.id, exit.id)];
        let graph = graph_with(vec![t1, t2, exit], edges);
        assert_eq!(
            validate(graph).unwrap_err(),
            GraphError::DuplicateEntry { node_id: t2_id }
        );
    }

    #[test]
    fn test_dangling_edge() {
        let mut graph = linear_flow();
        let ghost = Uuid::new_v4();
        let from = graph.nodes[2].id;
        graph.edges.push(Edge::new(from, ghost));
        let err = validate(graph).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingEdge {
                from,
                target: ghost
            }
        );
        assert_eq!(
            err.to_string(),
            format!("edge {from} -> {ghost} references a missing node")
        );
    }

    #[test]
    fn test_delay_beyond_ceiling_rejected() {
        for duration_secs in [MAX_DELAY_SECS + 1, 1 << 62, u64::MAX] {
            let mut graph = linear_flow();
            let delay_id = graph.nodes[1].id;
            graph.nodes[1].kind = NodeKind::Delay(DelayPolicy::FixedDuration { duration_secs });
            assert_eq!(
                validate(graph).unwrap_err(),
                GraphError::InvalidDelay {
                    node_id: delay_id,
                    duration_secs
                }
            );
        }
    }

    #[test]
    fn test_delay_at_ceiling_accepted() {
        let mut graph = linear_flow();
        graph.nodes[1].kind = NodeKind::Delay(DelayPolicy::FixedDuration {
            duration_secs: MAX_DELAY_SECS,
        });
        assert!(validate(graph).is_ok());
    }

    #[test]
    fn test_unreachable_node() {
        let mut graph = linear_flow();
        let orphan = Node::new(NodeKind::Action {
            action: ActionKind::SendSms,
            params: json!({}),
        });
        let orphan_id = orphan.id;
        graph.nodes.push(orphan);
        assert_eq!(
            validate(graph).unwrap_err(),
            GraphError::Unreachable { node_id: orphan_id }
        );
    }

    #[test]
    fn test_condition_duplicate_label() {
        let trigger = Node::new(NodeKind::Trigger {
            event_type: "order/created".into(),
        });
        let cond = Node::new(NodeKind::Condition {
            rules: vec![BranchRule {
                label: "vip".into(),
                predicate: PredicateGroup::all(vec![]),
            }],
        });
        let a = Node::new(NodeKind::Exit { reason: "a".into() });
        let b = Node::new(NodeKind::Exit { reason: "b".into() });
        let cond_id = cond.id;
        let edges = vec![
            Edge::new(trigger.id, cond.id),
            Edge::branch(cond.id, a.id, "vip"),
            Edge::branch(cond.id, b.id, "vip"),
        ];
        let graph = graph_with(vec![trigger, cond, a, b], edges);
        match validate(graph).unwrap_err() {
            GraphError::AmbiguousBranch { node_id, .. } => assert_eq!(node_id, cond_id),
            other => panic!("Expected AmbiguousBranch, got {:?}", other),
        }
    }

    #[test]
    fn test_condition_rule_without_edge() {
        let trigger = Node::new(NodeKind::Trigger {
            event_type: "order/created".into(),
        });
        let cond = Node::new(NodeKind::Condition {
            rules: vec![
                BranchRule {
                    label: "vip".into(),
                    predicate: PredicateGroup::all(vec![]),
                },
                BranchRule {
                    label: "lapsed".into(),
                    predicate: PredicateGroup::all(vec![]),
                },
            ],
        });
        let a = Node::new(NodeKind::Exit { reason: "a".into() });
        let b = Node::new(NodeKind::Exit { reason: "b".into() });
        let edges = vec![
            Edge::new(trigger.id, cond.id),
            Edge::branch(cond.id, a.id, "vip"),
            Edge::default_branch(cond.id, b.id),
        ];
        let graph = graph_with(vec![trigger, cond, a, b], edges);
        match validate(graph).unwrap_err() {
            GraphError::AmbiguousBranch { detail, .. } => {
                assert!(detail.contains("lapsed"))
            }
            other => panic!("Expected AmbiguousBranch, got {:?}", other),
        }
    }

    #[test]
    fn test_split_requires_weighted_variants() {
        let trigger = Node::new(NodeKind::Trigger {
            event_type: "order/created".into(),
        });
        let split = Node::new(NodeKind::Split);
        let a = Node::new(NodeKind::Exit { reason: "a".into() });
        let b = Node::new(NodeKind::Exit { reason: "b".into() });
        let split_id = split.id;
        let edges = vec![
            Edge::new(trigger.id, split.id),
            Edge::variant(split.id, a.id, "control", 50),
            // Zero weight is rejected.
            Edge::variant(split.id, b.id, "treatment", 0),
        ];
        let graph = graph_with(vec![trigger, split, a, b], edges);
        assert_eq!(
            validate(graph).unwrap_err(),
            GraphError::InvalidSplit { node_id: split_id }
        );
    }

    #[test]
    fn test_branch_queries() {
        let trigger = Node::new(NodeKind::Trigger {
            event_type: "order/created".into(),
        });
        let cond = Node::new(NodeKind::Condition {
            rules: vec![BranchRule {
                label: "vip".into(),
                predicate: PredicateGroup::all(vec![]),
            }],
        });
        let a = Node::new(NodeKind::Exit { reason: "a".into() });
        let b = Node::new(NodeKind::Exit { reason: "b".into() });
        let (cond_id, a_id, b_id) = (cond.id, a.id, b.id);
        let edges = vec![
            Edge::new(trigger.id, cond.id),
            Edge::branch(cond.id, a.id, "vip"),
            Edge::default_branch(cond.id, b.id),
        ];
        let graph = graph_with(vec![trigger, cond, a, b], edges);
        let valid = validate(graph).unwrap();

        assert_eq!(valid.branch_target(cond_id, "vip"), Some(a_id));
        assert_eq!(valid.default_target(cond_id), Some(b_id));
        assert_eq!(valid.next_nodes(cond_id, Some("vip")), vec![a_id]);
        assert_eq!(valid.next_nodes(cond_id, None).len(), 2);
    }
}
