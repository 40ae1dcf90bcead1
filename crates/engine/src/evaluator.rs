//! Per-node transition logic. The evaluator owns no mutable state: it
//! reads the pinned graph version, consults the engagement clock for delay
//! nodes, and dispatches registered executors for action nodes. All ledger
//! writes stay with the scheduler.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use flowline_core::types::{NodeId, StoreId, SubscriberId};
use flowline_graph::{ActionKind, DelayPolicy, NodeKind, ValidGraph, MAX_DELAY_SECS};

use crate::executor::{ActionError, ActionRequest, ExecutorRegistry};
use crate::ledger::ExecutionEntry;
use crate::send_time::{next_optimal_time, EngagementProfile, ProfileProvider};

/// Where an entry goes after its current node is evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Move to `next` and evaluate it within the same tick.
    Advance { next: NodeId },
    /// A condition or split resolved; move to `next` under `label`.
    Branch { label: String, next: NodeId },
    /// Park until `wake_at`, then resume at `next`.
    Sleep { next: NodeId, wake_at: DateTime<Utc> },
    /// An action dispatched; `next` is `None` when the action node ends
    /// the flow.
    Acted { action: ActionKind, next: Option<NodeId> },
    /// The flow is finished for this subscriber.
    Complete { reason: Option<String> },
}

#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("no branch matched at node {node_id} and no default edge exists")]
    UnresolvedBranch { node_id: NodeId },

    #[error("no executor registered for action {action}")]
    NoExecutor { action: ActionKind },

    #[error("node {node_id} missing from the pinned graph version")]
    MissingNode { node_id: NodeId },

    #[error("node {node_id} has no outgoing edge")]
    NoTarget { node_id: NodeId },

    #[error("action {action} failed: {source}")]
    Action {
        action: ActionKind,
        #[source]
        source: ActionError,
    },

    #[error("action {action} timed out after {timeout_ms}ms")]
    ActionTimeout { action: ActionKind, timeout_ms: u64 },
}

impl EvalError {
    /// Transient errors feed the retry and backoff policy; everything
    /// else fails the entry on the first attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EvalError::Action { .. } | EvalError::ActionTimeout { .. }
        )
    }
}

pub struct NodeEvaluator {
    executors: Arc<ExecutorRegistry>,
    profiles: Arc<dyn ProfileProvider>,
    action_timeout: StdDuration,
    search_horizon_days: u32,
}

impl NodeEvaluator {
    pub fn new(executors: Arc<ExecutorRegistry>, profiles: Arc<dyn ProfileProvider>) -> Self {
        Self {
            executors,
            profiles,
            action_timeout: StdDuration::from_secs(10),
            search_horizon_days: 7,
        }
    }

    pub fn with_action_timeout(mut self, timeout: StdDuration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_search_horizon(mut self, days: u32) -> Self {
        self.search_horizon_days = days;
        self
    }

    /// Evaluates the entry's current node. Pure with respect to the
    /// ledger; action dispatch is the only side effect.
    pub async fn evaluate(
        &self,
        graph: &ValidGraph,
        entry: &ExecutionEntry,
        store_id: &StoreId,
        now: DateTime<Utc>,
    ) -> Result<Transition, EvalError> {
        let node_id = entry.current_node_id;
        let node = graph
            .node(node_id)
            .ok_or(EvalError::MissingNode { node_id })?;

        match &node.kind {
            NodeKind::Trigger { .. } => {
                let next = graph
                    .single_target(node_id)
                    .ok_or(EvalError::NoTarget { node_id })?;
                Ok(Transition::Advance { next })
            }

            NodeKind::Exit { reason } => Ok(Transition::Complete {
                reason: Some(reason.clone()),
            }),

            NodeKind::Condition { rules } => {
                for rule in rules {
                    if rule.predicate.evaluate(&entry.context) {
                        debug!(node_id = %node_id, label = %rule.label, "Branch matched");
                        let next = graph
                            .branch_target(node_id, &rule.label)
                            .ok_or(EvalError::UnresolvedBranch { node_id })?;
                        return Ok(Transition::Branch {
                            label: rule.label.clone(),
                            next,
                        });
                    }
                }
                match graph.default_target(node_id) {
                    Some(next) => Ok(Transition::Branch {
                        label: "default".to_string(),
                        next,
                    }),
                    None => Err(EvalError::UnresolvedBranch { node_id }),
                }
            }

            NodeKind::Delay(policy) => {
                let next = graph
                    .single_target(node_id)
                    .ok_or(EvalError::NoTarget { node_id })?;
                let wake_at = match policy {
                    DelayPolicy::FixedDuration { duration_secs } => {
                        // Publish-time validation caps fixed durations.
                        let secs = (*duration_secs).min(MAX_DELAY_SECS);
                        now + Duration::seconds(secs as i64)
                    }
                    DelayPolicy::OptimalSendTime => {
                        let profile = self
                            .profiles
                            .profile(store_id)
                            .await
                            .unwrap_or_else(|| EngagementProfile::flat(store_id.clone()));
                        next_optimal_time(&profile, now, self.search_horizon_days)
                    }
                };
                Ok(Transition::Sleep { next, wake_at })
            }

            NodeKind::Action { action, params } => {
                let executor = self
                    .executors
                    .get(*action)
                    .ok_or(EvalError::NoExecutor { action: *action })?;
                let request = ActionRequest {
                    action: *action,
                    params: params.clone(),
                    idempotency_key: format!(
                        "{}:{}:{}",
                        entry.id, node_id, entry.attempt_count
                    ),
                    subscriber_id: entry.subscriber_id.clone(),
                    store_id: store_id.clone(),
                };
                match tokio::time::timeout(self.action_timeout, executor.execute(&request)).await
                {
                    Ok(Ok(outcome)) => {
                        debug!(
                            action = %action,
                            provider_ref = ?outcome.provider_ref,
                            deduplicated = outcome.deduplicated,
                            "Action dispatched"
                        );
                        Ok(Transition::Acted {
                            action: *action,
                            next: graph.single_target(node_id),
                        })
                    }
                    Ok(Err(source)) => Err(EvalError::Action {
                        action: *action,
                        source,
                    }),
                    Err(_) => Err(EvalError::ActionTimeout {
                        action: *action,
                        timeout_ms: self.action_timeout.as_millis() as u64,
                    }),
                }
            }

            NodeKind::Split => split_variant(graph, node_id, &entry.subscriber_id),
        }
    }
}

/// Deterministic variant assignment: the subscriber and node ids hash to a
/// bucket over the total variant weight, so the same subscriber always
/// lands on the same arm of a given split.
fn split_variant(
    graph: &ValidGraph,
    node_id: NodeId,
    subscriber_id: &SubscriberId,
) -> Result<Transition, EvalError> {
    let variants = graph.variants(node_id);
    let total: u64 = variants.iter().map(|(_, weight, _)| u64::from(*weight)).sum();
    if total == 0 {
        return Err(EvalError::UnresolvedBranch { node_id });
    }

    let mut hasher = Sha256::new();
    hasher.update(subscriber_id.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(node_id.as_bytes());
    let digest = hasher.finalize();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    let bucket = u64::from_be_bytes(raw) % total;

    let mut cursor = 0u64;
    for (name, weight, target) in variants {
        cursor += u64::from(weight);
        if bucket < cursor {
            return Ok(Transition::Branch {
                label: name.to_string(),
                next: target,
            });
        }
    }
    Err(EvalError::UnresolvedBranch { node_id })
}
