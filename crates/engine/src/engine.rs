//! Engine facade. Publishes flows, enters subscribers, and handles the
//! external cancellation and stats surfaces. Step advancement itself
//! lives in the scheduler.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use flowline_core::event_bus::{make_event, noop_sink, EventSink};
use flowline_core::types::{EntryId, EventType, FlowId, StoreId, SubscriberId};
use flowline_graph::{
    validate, ActionKind, BranchRule, ComparisonOperator, DelayPolicy, Edge, FlowGraph,
    GraphError, Node, NodeKind, Predicate, PredicateGroup,
};

use crate::ledger::{
    ConflictError, ExecutionStatus, HistoryRecord, LedgerStore, NewEntry, StateUpdate, StepOutcome,
};
use crate::registry::{FlowRegistry, FlowSummary};

/// Aggregate execution counts for one flow across all versions.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStats {
    pub flow_id: FlowId,
    pub total_entered: u64,
    pub pending: u64,
    pub running: u64,
    pub waiting_delay: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_completion_secs: f64,
}

#[derive(Clone)]
pub struct FlowEngine {
    registry: Arc<FlowRegistry>,
    ledger: Arc<dyn LedgerStore>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("flows", &self.registry.len())
            .finish()
    }
}

impl FlowEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            registry: Arc::new(FlowRegistry::new()),
            ledger,
            event_sink: noop_sink(),
        }
    }

    /// Attach an event sink for emitting lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// The version registry, shared with the scheduler.
    pub fn registry(&self) -> Arc<FlowRegistry> {
        Arc::clone(&self.registry)
    }

    /// Validates and publishes a graph for a store, returning the version
    /// assigned to it. Structural defects are rejected here and never
    /// reach execution.
    pub fn publish_flow(
        &self,
        graph: FlowGraph,
        store_id: StoreId,
    ) -> Result<(FlowId, u32), GraphError> {
        let valid = validate(graph)?;
        let flow_id = valid.id();
        let name = valid.name().to_string();
        let version = self.registry.publish(valid, store_id);
        info!(flow_id = %flow_id, version, name = %name, "Published flow");
        self.event_sink
            .emit(make_event(EventType::FlowPublished, flow_id, None, None));
        Ok((flow_id, version))
    }

    /// Archives a flow and cancels its active executions. Returns how
    /// many executions were cancelled.
    pub async fn archive_flow(&self, flow_id: FlowId) -> Result<u64> {
        if !self.registry.archive(flow_id) {
            return Err(anyhow!("Flow {} not found", flow_id));
        }
        let mut cancelled = 0u64;
        for entry_id in self.ledger.active_for_flow(flow_id).await {
            if self.cancel_entry(entry_id).await? {
                cancelled += 1;
            }
        }
        info!(flow_id = %flow_id, cancelled, "Archived flow");
        self.event_sink
            .emit(make_event(EventType::FlowArchived, flow_id, None, None));
        Ok(cancelled)
    }

    /// Enters a subscriber into the latest version of an active flow.
    /// `context` carries the subscriber attributes and triggering event
    /// payload that condition predicates read.
    pub async fn start_execution(
        &self,
        flow_id: FlowId,
        subscriber_id: SubscriberId,
        context: serde_json::Value,
    ) -> Result<EntryId> {
        let (version, graph) = self
            .registry
            .latest_active(flow_id)
            .ok_or_else(|| anyhow!("Flow {} is not active", flow_id))?;

        let now = Utc::now();
        let entry_id = self
            .ledger
            .create(
                NewEntry {
                    flow_id,
                    flow_version: version,
                    subscriber_id: subscriber_id.clone(),
                    entry_node_id: graph.entry(),
                    context,
                },
                now,
            )
            .await?;

        info!(
            entry_id = %entry_id,
            flow_id = %flow_id,
            version,
            subscriber_id = %subscriber_id,
            "Subscriber entered flow"
        );
        metrics::counter!("engine.executions_started").increment(1);
        self.event_sink.emit(make_event(
            EventType::ExecutionStarted,
            flow_id,
            Some(entry_id),
            Some(subscriber_id),
        ));
        Ok(entry_id)
    }

    /// Cancels a subscriber's active execution of a flow, if one exists.
    /// Unsubscribes and flow archival route through here.
    pub async fn cancel(&self, flow_id: FlowId, subscriber_id: &SubscriberId) -> Result<bool> {
        match self.ledger.find_active(flow_id, subscriber_id).await {
            Some(entry) => self.cancel_entry(entry.id).await,
            None => Ok(false),
        }
    }

    /// CAS loop to `Cancelled` from whatever non-terminal status the entry
    /// is in. Returns false when the entry is already terminal or gone.
    pub async fn cancel_entry(&self, entry_id: EntryId) -> Result<bool> {
        loop {
            let Some(entry) = self.ledger.get(entry_id).await else {
                return Ok(false);
            };
            if entry.status.is_terminal() {
                return Ok(false);
            }

            let now = Utc::now();
            let update = StateUpdate {
                status: ExecutionStatus::Cancelled,
                current_node_id: entry.current_node_id,
                wake_at: None,
                attempt_count: entry.attempt_count,
                last_error: entry.last_error.clone(),
                record: Some(HistoryRecord {
                    node_id: entry.current_node_id,
                    entered_at: entry.node_entered_at,
                    exited_at: Some(now),
                    outcome: StepOutcome::Cancelled,
                }),
            };
            match self
                .ledger
                .transition(entry_id, entry.status, update, now)
                .await
            {
                Ok(()) => {
                    info!(entry_id = %entry_id, "Execution cancelled");
                    metrics::counter!("engine.executions_cancelled").increment(1);
                    self.event_sink.emit(make_event(
                        EventType::ExecutionCancelled,
                        entry.flow_id,
                        Some(entry_id),
                        Some(entry.subscriber_id.clone()),
                    ));
                    return Ok(true);
                }
                // A worker advanced the entry between read and CAS; retry
                // from its new status.
                Err(ConflictError::StaleStatus { .. }) => continue,
                Err(ConflictError::Missing { .. }) => return Ok(false),
            }
        }
    }

    pub fn list_flows(&self) -> Vec<FlowSummary> {
        self.registry.list()
    }

    pub async fn get_entry(&self, entry_id: EntryId) -> Option<crate::ledger::ExecutionEntry> {
        self.ledger.get(entry_id).await
    }

    /// Computes aggregate statistics for a flow from its ledger entries.
    pub async fn stats(&self, flow_id: FlowId) -> FlowStats {
        let mut stats = FlowStats {
            flow_id,
            total_entered: 0,
            pending: 0,
            running: 0,
            waiting_delay: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            avg_completion_secs: 0.0,
        };
        let mut completion_secs = 0.0_f64;

        for entry in self.ledger.entries_for_flow(flow_id).await {
            stats.total_entered += 1;
            match entry.status {
                ExecutionStatus::Pending => stats.pending += 1,
                ExecutionStatus::Running => stats.running += 1,
                ExecutionStatus::WaitingDelay => stats.waiting_delay += 1,
                ExecutionStatus::Completed => {
                    stats.completed += 1;
                    completion_secs += entry
                        .updated_at
                        .signed_duration_since(entry.entered_at)
                        .num_seconds() as f64;
                }
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Cancelled => stats.cancelled += 1,
            }
        }
        if stats.completed > 0 {
            stats.avg_completion_secs = completion_secs / stats.completed as f64;
        }
        stats
    }

    /// Seeds three demo flows for development and testing.
    pub fn seed_demo_flows(&self, store_id: &StoreId) -> Vec<FlowId> {
        info!("Seeding demo flows");
        let now = Utc::now();

        // ---- 1. Welcome Series (email sequence) ----
        let signup = Node::new(NodeKind::Trigger {
            event_type: "subscriber/signed_up".into(),
        });
        let welcome_email = Node::new(NodeKind::Action {
            action: ActionKind::SendEmail,
            params: json!({"template": "welcome_email"}),
        });
        let tips_wait = Node::new(NodeKind::Delay(DelayPolicy::FixedDuration {
            duration_secs: 86_400,
        }));
        let tips_email = Node::new(NodeKind::Action {
            action: ActionKind::SendEmail,
            params: json!({"template": "tips_email"}),
        });
        let welcome_exit = Node::new(NodeKind::Exit {
            reason: "Welcome series complete".into(),
        });
        let edges = vec![
            Edge::new(signup.id, welcome_email.id),
            Edge::new(welcome_email.id, tips_wait.id),
            Edge::new(tips_wait.id, tips_email.id),
            Edge::new(tips_email.id, welcome_exit.id),
        ];
        let welcome = FlowGraph {
            id: Uuid::new_v4(),
            name: "Welcome Series".to_string(),
            description: "Onboarding email sequence for new subscribers".to_string(),
            nodes: vec![signup, welcome_email, tips_wait, tips_email, welcome_exit],
            edges,
            created_at: now,
        };

        // ---- 2. Cart Recovery (delay, then channel by tier) ----
        let abandoned = Node::new(NodeKind::Trigger {
            event_type: "cart/abandoned".into(),
        });
        let settle = Node::new(NodeKind::Delay(DelayPolicy::FixedDuration {
            duration_secs: 3_600,
        }));
        let tier_check = Node::new(NodeKind::Condition {
            rules: vec![BranchRule {
                label: "vip".into(),
                predicate: PredicateGroup::all(vec![Predicate::Attribute {
                    key: "tier".into(),
                    operator: ComparisonOperator::Equals,
                    value: json!("vip"),
                }]),
            }],
        });
        let reminder_sms = Node::new(NodeKind::Action {
            action: ActionKind::SendSms,
            params: json!({"template": "cart_reminder_sms"}),
        });
        let reminder_email = Node::new(NodeKind::Action {
            action: ActionKind::SendEmail,
            params: json!({"template": "cart_reminder_email"}),
        });
        let cart_exit = Node::new(NodeKind::Exit {
            reason: "Cart recovery complete".into(),
        });
        let edges = vec![
            Edge::new(abandoned.id, settle.id),
            Edge::new(settle.id, tier_check.id),
            Edge::branch(tier_check.id, reminder_sms.id, "vip"),
            Edge::default_branch(tier_check.id, reminder_email.id),
            Edge::new(reminder_sms.id, cart_exit.id),
            Edge::new(reminder_email.id, cart_exit.id),
        ];
        let cart_recovery = FlowGraph {
            id: Uuid::new_v4(),
            name: "Cart Recovery".to_string(),
            description: "Re-engage subscribers who abandoned their cart".to_string(),
            nodes: vec![
                abandoned,
                settle,
                tier_check,
                reminder_sms,
                reminder_email,
                cart_exit,
            ],
            edges,
            created_at: now,
        };

        // ---- 3. Winback (optimal send time, split-tested channel) ----
        let lapsed = Node::new(NodeKind::Trigger {
            event_type: "segment/lapsed_entered".into(),
        });
        let optimal = Node::new(NodeKind::Delay(DelayPolicy::OptimalSendTime));
        let channel_split = Node::new(NodeKind::Split);
        let offer_email = Node::new(NodeKind::Action {
            action: ActionKind::SendEmail,
            params: json!({"template": "winback_offer_email"}),
        });
        let offer_push = Node::new(NodeKind::Action {
            action: ActionKind::SendPush,
            params: json!({"template": "winback_offer_push"}),
        });
        let winback_exit = Node::new(NodeKind::Exit {
            reason: "Winback complete".into(),
        });
        let edges = vec![
            Edge::new(lapsed.id, optimal.id),
            Edge::new(optimal.id, channel_split.id),
            Edge::variant(channel_split.id, offer_email.id, "email", 50),
            Edge::variant(channel_split.id, offer_push.id, "push", 50),
            Edge::new(offer_email.id, winback_exit.id),
            Edge::new(offer_push.id, winback_exit.id),
        ];
        let winback = FlowGraph {
            id: Uuid::new_v4(),
            name: "Winback".to_string(),
            description: "Multi-channel winback for lapsed subscribers".to_string(),
            nodes: vec![
                lapsed,
                optimal,
                channel_split,
                offer_email,
                offer_push,
                winback_exit,
            ],
            edges,
            created_at: now,
        };

        let mut flow_ids = Vec::with_capacity(3);
        for graph in [welcome, cart_recovery, winback] {
            if let Ok((flow_id, _)) = self.publish_flow(graph, store_id.clone()) {
                flow_ids.push(flow_id);
            }
        }
        info!(count = flow_ids.len(), "Seeded demo flows");
        flow_ids
    }
}
