//! Flow graph model: the immutable, validated representation of a flow's
//! nodes and edges, plus the predicate language used by condition nodes.

pub mod model;
pub mod predicates;
pub mod validate;

pub use model::{
    ActionKind, BranchRule, DelayPolicy, Edge, EdgeLabel, FlowGraph, Node, NodeKind,
};
pub use predicates::{ComparisonOperator, LogicalOperator, Predicate, PredicateGroup};
pub use validate::{validate, GraphError, ValidGraph, MAX_DELAY_SECS};
