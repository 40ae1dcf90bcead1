//! Step scheduler: a pool of workers draining due ledger entries. There
//! is no global lock. Workers race to claim entries with the ledger CAS,
//! losers skip, and every error path lands the entry back in a definite
//! status before the tick ends.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flowline_core::config::EngineConfig;
use flowline_core::event_bus::{make_event, noop_sink, EventSink};
use flowline_core::types::{EntryId, EventType};

use crate::evaluator::{EvalError, NodeEvaluator, Transition};
use crate::ledger::{
    ConflictError, ExecutionEntry, ExecutionStatus, HistoryRecord, LedgerStore, StateUpdate,
    StepOutcome,
};
use crate::registry::FlowRegistry;

/// Counters for a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub claimed: u64,
    pub conflicts: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub slept: u64,
}

pub struct StepScheduler {
    ledger: Arc<dyn LedgerStore>,
    registry: Arc<FlowRegistry>,
    evaluator: Arc<NodeEvaluator>,
    event_sink: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl StepScheduler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        registry: Arc<FlowRegistry>,
        evaluator: Arc<NodeEvaluator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            registry,
            evaluator,
            event_sink: noop_sink(),
            config,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Fetches a bounded batch of due entries and advances each as far as
    /// it will go. Safe to call from any number of workers concurrently.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickStats {
        let start = std::time::Instant::now();
        let mut stats = TickStats::default();
        let due = self.ledger.due_entries(now, self.config.batch_size).await;
        for entry_id in due {
            self.process_entry(entry_id, now, &mut stats).await;
        }
        metrics::histogram!("engine.tick_latency_us").record(start.elapsed().as_micros() as f64);
        stats
    }

    async fn process_entry(&self, entry_id: EntryId, now: DateTime<Utc>, stats: &mut TickStats) {
        let Some(snapshot) = self.ledger.get(entry_id).await else {
            return;
        };
        if snapshot.status != ExecutionStatus::Pending
            && snapshot.status != ExecutionStatus::WaitingDelay
        {
            // Another worker claimed or finished it since the due query.
            return;
        }

        let claim = StateUpdate::status_only(&snapshot, ExecutionStatus::Running);
        match self
            .ledger
            .transition(entry_id, snapshot.status, claim, now)
            .await
        {
            Ok(()) => {
                stats.claimed += 1;
                metrics::counter!("engine.entries_claimed").increment(1);
            }
            Err(ConflictError::StaleStatus { .. }) => {
                stats.conflicts += 1;
                metrics::counter!("engine.claim_conflicts").increment(1);
                return;
            }
            Err(ConflictError::Missing { entry_id }) => {
                warn!(entry_id = %entry_id, "Due entry vanished before claim");
                return;
            }
        }

        let mut steps = 0u32;
        loop {
            // Re-read before every side effect; a cancellation CAS may
            // have landed since the last transition.
            let Some(entry) = self.ledger.get(entry_id).await else {
                return;
            };
            if entry.status != ExecutionStatus::Running {
                debug!(entry_id = %entry_id, status = ?entry.status, "Entry left running state; stopping");
                return;
            }

            let Some((graph, store_id)) = self
                .registry
                .execution_view(entry.flow_id, entry.flow_version)
            else {
                self.fail_entry(&entry, "flow version is no longer registered".to_string(), now)
                    .await;
                stats.failed += 1;
                return;
            };

            let keep_stepping = match self.evaluator.evaluate(&graph, &entry, &store_id, now).await
            {
                Ok(transition) => self.apply_transition(&entry, transition, now, stats).await,
                Err(err) => {
                    self.handle_eval_error(&entry, err, now, stats).await;
                    false
                }
            };
            if !keep_stepping {
                return;
            }

            steps += 1;
            if steps >= self.config.max_steps_per_tick {
                // A long linear run or a cycle yields the worker; parking
                // with an immediate wake puts the entry back in the due set.
                let Some(entry) = self.ledger.get(entry_id).await else {
                    return;
                };
                if entry.status != ExecutionStatus::Running {
                    return;
                }
                let mut update = StateUpdate::status_only(&entry, ExecutionStatus::WaitingDelay);
                update.wake_at = Some(now);
                if self
                    .ledger
                    .transition(entry_id, ExecutionStatus::Running, update, now)
                    .await
                    .is_ok()
                {
                    stats.slept += 1;
                }
                return;
            }
        }
    }

    /// Applies an evaluator transition. Returns true when the entry stays
    /// `Running` and the advance loop should evaluate the next node.
    async fn apply_transition(
        &self,
        entry: &ExecutionEntry,
        transition: Transition,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> bool {
        match transition {
            Transition::Advance { next } => {
                let update = StateUpdate {
                    status: ExecutionStatus::Running,
                    current_node_id: next,
                    wake_at: None,
                    attempt_count: 0,
                    last_error: None,
                    record: Some(step_record(entry, now, StepOutcome::Advanced { to: next })),
                };
                self.commit(entry, update, EventType::StepCompleted, now).await
            }

            Transition::Branch { label, next } => {
                let update = StateUpdate {
                    status: ExecutionStatus::Running,
                    current_node_id: next,
                    wake_at: None,
                    attempt_count: 0,
                    last_error: None,
                    record: Some(step_record(entry, now, StepOutcome::Branch { label })),
                };
                self.commit(entry, update, EventType::StepCompleted, now).await
            }

            Transition::Sleep { next, wake_at } => {
                // The entry parks on the delay's successor so the wake
                // tick evaluates the next node directly.
                let update = StateUpdate {
                    status: ExecutionStatus::WaitingDelay,
                    current_node_id: next,
                    wake_at: Some(wake_at),
                    attempt_count: 0,
                    last_error: None,
                    record: Some(step_record(
                        entry,
                        now,
                        StepOutcome::DelayScheduled { wake_at },
                    )),
                };
                if self.commit(entry, update, EventType::DelayScheduled, now).await {
                    stats.slept += 1;
                }
                false
            }

            Transition::Acted { action, next: Some(next) } => {
                let update = StateUpdate {
                    status: ExecutionStatus::Running,
                    current_node_id: next,
                    wake_at: None,
                    attempt_count: 0,
                    last_error: None,
                    record: Some(step_record(
                        entry,
                        now,
                        StepOutcome::ActionCompleted { action },
                    )),
                };
                self.commit(entry, update, EventType::ActionDispatched, now).await
            }

            Transition::Acted { action, next: None } => {
                let update = StateUpdate {
                    status: ExecutionStatus::Completed,
                    current_node_id: entry.current_node_id,
                    wake_at: None,
                    attempt_count: 0,
                    last_error: None,
                    record: Some(step_record(
                        entry,
                        now,
                        StepOutcome::ActionCompleted { action },
                    )),
                };
                if self
                    .commit(entry, update, EventType::ExecutionCompleted, now)
                    .await
                {
                    stats.completed += 1;
                    metrics::counter!("engine.executions_completed").increment(1);
                }
                false
            }

            Transition::Complete { reason } => {
                let update = StateUpdate {
                    status: ExecutionStatus::Completed,
                    current_node_id: entry.current_node_id,
                    wake_at: None,
                    attempt_count: 0,
                    last_error: None,
                    record: Some(step_record(entry, now, StepOutcome::Completed { reason })),
                };
                if self
                    .commit(entry, update, EventType::ExecutionCompleted, now)
                    .await
                {
                    stats.completed += 1;
                    metrics::counter!("engine.executions_completed").increment(1);
                }
                false
            }
        }
    }

    async fn handle_eval_error(
        &self,
        entry: &ExecutionEntry,
        err: EvalError,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) {
        let attempt = entry.attempt_count + 1;
        let error_text = err.to_string();

        if err.is_retryable() && attempt < self.config.retry_ceiling {
            let delay = backoff_delay(
                attempt,
                self.config.backoff_base_secs,
                self.config.backoff_cap_secs,
            );
            let wake_at = now
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let update = StateUpdate {
                status: ExecutionStatus::WaitingDelay,
                current_node_id: entry.current_node_id,
                wake_at: Some(wake_at),
                attempt_count: attempt,
                last_error: Some(error_text.clone()),
                record: Some(HistoryRecord {
                    node_id: entry.current_node_id,
                    entered_at: entry.node_entered_at,
                    exited_at: None,
                    outcome: StepOutcome::Failed {
                        error: error_text.clone(),
                    },
                }),
            };
            if self.commit(entry, update, EventType::ActionFailed, now).await {
                stats.retried += 1;
                metrics::counter!("engine.attempts_retried").increment(1);
                warn!(
                    entry_id = %entry.id,
                    attempt,
                    wake_at = %wake_at,
                    error = %error_text,
                    "Step failed; retrying with backoff"
                );
            }
        } else {
            self.fail_entry(entry, error_text, now).await;
            stats.failed += 1;
        }
    }

    async fn fail_entry(&self, entry: &ExecutionEntry, error: String, now: DateTime<Utc>) {
        let update = StateUpdate {
            status: ExecutionStatus::Failed,
            current_node_id: entry.current_node_id,
            wake_at: None,
            attempt_count: entry.attempt_count + 1,
            last_error: Some(error.clone()),
            record: Some(HistoryRecord {
                node_id: entry.current_node_id,
                entered_at: entry.node_entered_at,
                exited_at: Some(now),
                outcome: StepOutcome::Failed {
                    error: error.clone(),
                },
            }),
        };
        if self
            .commit(entry, update, EventType::ExecutionFailed, now)
            .await
        {
            metrics::counter!("engine.executions_failed").increment(1);
            warn!(entry_id = %entry.id, error = %error, "Execution failed");
        }
    }

    /// CAS from `Running`. A stale status here means cancellation won the
    /// race; the evaluated step's effects stand but the entry is done.
    async fn commit(
        &self,
        entry: &ExecutionEntry,
        update: StateUpdate,
        event_type: EventType,
        now: DateTime<Utc>,
    ) -> bool {
        match self
            .ledger
            .transition(entry.id, ExecutionStatus::Running, update, now)
            .await
        {
            Ok(()) => {
                self.event_sink.emit(make_event(
                    event_type,
                    entry.flow_id,
                    Some(entry.id),
                    Some(entry.subscriber_id.clone()),
                ));
                true
            }
            Err(ConflictError::StaleStatus { actual, .. }) => {
                debug!(entry_id = %entry.id, ?actual, "Transition superseded");
                false
            }
            Err(ConflictError::Missing { .. }) => {
                warn!(entry_id = %entry.id, "Entry vanished mid-step");
                false
            }
        }
    }

    /// Spawns the configured number of polling workers sharing this
    /// scheduler.
    pub fn spawn_workers(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let scheduler = Arc::clone(&self);
            let mut shutdown = shutdown_rx.clone();
            workers.push(tokio::spawn(async move {
                let mut poll = tokio::time::interval(std::time::Duration::from_millis(
                    scheduler.config.poll_interval_ms,
                ));
                poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                info!(worker_id, "Scheduler worker started");
                loop {
                    tokio::select! {
                        _ = poll.tick() => {
                            let stats = scheduler.tick(Utc::now()).await;
                            if stats.claimed > 0 {
                                debug!(
                                    worker_id,
                                    claimed = stats.claimed,
                                    completed = stats.completed,
                                    failed = stats.failed,
                                    "Tick drained entries"
                                );
                            }
                        }
                        _ = shutdown.changed() => {
                            info!(worker_id, "Scheduler worker stopping");
                            break;
                        }
                    }
                }
            }));
        }
        SchedulerHandle {
            shutdown: shutdown_tx,
            workers,
        }
    }
}

/// Running worker pool. `shutdown` stops the workers and waits for them.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

fn step_record(entry: &ExecutionEntry, now: DateTime<Utc>, outcome: StepOutcome) -> HistoryRecord {
    HistoryRecord {
        node_id: entry.current_node_id,
        entered_at: entry.node_entered_at,
        exited_at: Some(now),
        outcome,
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped. Config values
/// beyond chrono's range clamp to the longest representable delay.
fn backoff_delay(attempt: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let secs = base_secs.saturating_mul(1u64 << exponent).min(cap_secs);
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::NodeEvaluator;
    use crate::executor::{ActionExecutor, CaptureExecutor, ExecutorRegistry, FlakyExecutor};
    use crate::ledger::NewEntry;
    use crate::memory::MemoryLedger;
    use crate::send_time::MemoryProfileStore;
    use flowline_core::types::{FlowId, StoreId, SubscriberId};
    use flowline_graph::{validate, ActionKind, Edge, FlowGraph, Node, NodeKind, ValidGraph};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_backoff_progression() {
        assert_eq!(backoff_delay(1, 60, 21_600), Duration::seconds(60));
        assert_eq!(backoff_delay(2, 60, 21_600), Duration::seconds(120));
        assert_eq!(backoff_delay(3, 60, 21_600), Duration::seconds(240));
        assert_eq!(backoff_delay(10, 60, 21_600), Duration::seconds(21_600));
        // Large attempt numbers saturate instead of overflowing.
        assert_eq!(backoff_delay(200, 60, 21_600), Duration::seconds(21_600));
        // Config values beyond chrono's range clamp instead of wrapping.
        assert_eq!(backoff_delay(1, u64::MAX, u64::MAX), Duration::MAX);
    }

    fn wire(
        graph: ValidGraph,
        executor: Arc<dyn ActionExecutor>,
        config: EngineConfig,
    ) -> (Arc<MemoryLedger>, Arc<FlowRegistry>, StepScheduler, FlowId) {
        let flow_id = graph.id();
        let ledger = Arc::new(MemoryLedger::new());
        let registry = Arc::new(FlowRegistry::new());
        registry.publish(graph, StoreId::from("store-1"));

        let mut executors = ExecutorRegistry::new();
        executors.register_all(executor);
        let evaluator = Arc::new(NodeEvaluator::new(
            Arc::new(executors),
            Arc::new(MemoryProfileStore::new()),
        ));
        let scheduler = StepScheduler::new(ledger.clone(), registry.clone(), evaluator, config);
        (ledger, registry, scheduler, flow_id)
    }

    fn cyclic_action_graph() -> ValidGraph {
        // Trigger -> A -> B -> A: two actions feeding each other.
        let trigger = Node::new(NodeKind::Trigger {
            event_type: "order/created".into(),
        });
        let a = Node::new(NodeKind::Action {
            action: ActionKind::AddTag,
            params: json!({"tag": "ping"}),
        });
        let b = Node::new(NodeKind::Action {
            action: ActionKind::RemoveTag,
            params: json!({"tag": "ping"}),
        });
        let edges = vec![
            Edge::new(trigger.id, a.id),
            Edge::new(a.id, b.id),
            Edge::new(b.id, a.id),
        ];
        let graph = FlowGraph {
            id: Uuid::new_v4(),
            name: "Cycle".into(),
            description: String::new(),
            nodes: vec![trigger, a, b],
            edges,
            created_at: Utc::now(),
        };
        validate(graph).unwrap()
    }

    #[tokio::test]
    async fn test_step_budget_parks_cyclic_flows() {
        let config = EngineConfig {
            max_steps_per_tick: 5,
            ..EngineConfig::default()
        };
        let capture = Arc::new(CaptureExecutor::new());
        let (ledger, registry, scheduler, flow_id) =
            wire(cyclic_action_graph(), capture.clone(), config);

        let now = Utc::now();
        let entry_node = {
            let (_, graph) = registry.latest_active(flow_id).unwrap();
            graph.entry()
        };
        let entry_id = ledger
            .create(
                NewEntry {
                    flow_id,
                    flow_version: 1,
                    subscriber_id: SubscriberId::from("sub-1"),
                    entry_node_id: entry_node,
                    context: json!({}),
                },
                now,
            )
            .await
            .unwrap();

        let stats = scheduler.tick(now).await;
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.slept, 1);
        assert_eq!(stats.completed, 0);

        let entry = ledger.get(entry_id).await.unwrap();
        assert_eq!(entry.status, ExecutionStatus::WaitingDelay);
        assert_eq!(entry.wake_at, Some(now));
        // Five steps ran before the budget parked the entry.
        assert_eq!(entry.history.len(), 5);
    }

    fn email_graph() -> ValidGraph {
        let trigger = Node::new(NodeKind::Trigger {
            event_type: "order/created".into(),
        });
        let action = Node::new(NodeKind::Action {
            action: ActionKind::SendEmail,
            params: json!({"template": "welcome"}),
        });
        let exit = Node::new(NodeKind::Exit {
            reason: "done".into(),
        });
        let edges = vec![
            Edge::new(trigger.id, action.id),
            Edge::new(action.id, exit.id),
        ];
        let graph = FlowGraph {
            id: Uuid::new_v4(),
            name: "One Shot".into(),
            description: String::new(),
            nodes: vec![trigger, action, exit],
            edges,
            created_at: Utc::now(),
        };
        validate(graph).unwrap()
    }

    #[tokio::test]
    async fn test_oversized_backoff_parks_without_wrapping() {
        let config = EngineConfig {
            backoff_base_secs: u64::MAX,
            backoff_cap_secs: u64::MAX,
            ..EngineConfig::default()
        };
        let (ledger, registry, scheduler, flow_id) = wire(
            email_graph(),
            Arc::new(FlakyExecutor::failing(u64::MAX)),
            config,
        );

        let now = Utc::now();
        let entry_node = {
            let (_, graph) = registry.latest_active(flow_id).unwrap();
            graph.entry()
        };
        let entry_id = ledger
            .create(
                NewEntry {
                    flow_id,
                    flow_version: 1,
                    subscriber_id: SubscriberId::from("sub-1"),
                    entry_node_id: entry_node,
                    context: json!({}),
                },
                now,
            )
            .await
            .unwrap();

        let stats = scheduler.tick(now).await;
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.retried, 1);

        let entry = ledger.get(entry_id).await.unwrap();
        assert_eq!(entry.status, ExecutionStatus::WaitingDelay);
        assert_eq!(entry.attempt_count, 1);
        let wake_at = entry.wake_at.unwrap();
        assert!(wake_at > now);
        assert_eq!(wake_at, DateTime::<Utc>::MAX_UTC);

        // Never due again within any practical horizon.
        assert!(ledger
            .due_entries(now + Duration::days(36_500), 10)
            .await
            .is_empty());
    }
}
