//! Execution ledger: the durable record of each subscriber's run through
//! a flow version. All mutation goes through [`LedgerStore::transition`],
//! a compare-and-swap on status; that CAS is the engine's sole concurrency
//! primitive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use flowline_core::types::{EntryId, FlowId, NodeId, SubscriberId};
use flowline_graph::ActionKind;

/// Lifecycle of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet claimed by a worker.
    Pending,
    /// Claimed by exactly one worker for evaluation.
    Running,
    /// Parked until `wake_at`; not a blocked thread, just a row.
    WaitingDelay,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// What happened at one node visit, recorded in the entry's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StepOutcome {
    Advanced { to: NodeId },
    Branch { label: String },
    DelayScheduled { wake_at: DateTime<Utc> },
    ActionCompleted { action: ActionKind },
    Completed { reason: Option<String> },
    Failed { error: String },
    Cancelled,
}

/// Append-only history record. `exited_at` stays `None` for failed
/// attempts that will be retried at the same node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub node_id: NodeId,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub outcome: StepOutcome,
}

/// One subscriber's execution state for one flow version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub id: EntryId,
    pub flow_id: FlowId,
    pub flow_version: u32,
    pub subscriber_id: SubscriberId,
    pub status: ExecutionStatus,
    pub current_node_id: NodeId,
    pub wake_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Subscriber attributes plus the triggering event payload; read by
    /// condition predicates.
    pub context: serde_json::Value,
    pub history: Vec<HistoryRecord>,
    pub entered_at: DateTime<Utc>,
    /// When `current_node_id` last changed; becomes `entered_at` on the
    /// next history record for that node.
    pub node_entered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a ledger entry.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub flow_id: FlowId,
    pub flow_version: u32,
    pub subscriber_id: SubscriberId,
    pub entry_node_id: NodeId,
    pub context: serde_json::Value,
}

/// Full target state applied by a successful CAS transition. Every field
/// is explicit so a transition never merges with concurrent writes.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub status: ExecutionStatus,
    pub current_node_id: NodeId,
    pub wake_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub record: Option<HistoryRecord>,
}

impl StateUpdate {
    /// Update that changes only the status, carrying the entry's position
    /// and counters forward unchanged.
    pub fn status_only(entry: &ExecutionEntry, status: ExecutionStatus) -> Self {
        Self {
            status,
            current_node_id: entry.current_node_id,
            wake_at: entry.wake_at,
            attempt_count: entry.attempt_count,
            last_error: entry.last_error.clone(),
            record: None,
        }
    }

    pub fn with_record(mut self, record: HistoryRecord) -> Self {
        self.record = Some(record);
        self
    }
}

/// A lost CAS race. The scheduler treats `StaleStatus` as "someone else
/// got there first" and moves on without logging a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("entry status changed underneath the transition: expected {expected:?}, found {actual:?}")]
    StaleStatus {
        expected: ExecutionStatus,
        actual: ExecutionStatus,
    },
    #[error("ledger entry {entry_id} not found")]
    Missing { entry_id: EntryId },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("subscriber {subscriber_id} already has an active execution of flow {flow_id}")]
    DuplicateActiveExecution {
        flow_id: FlowId,
        subscriber_id: SubscriberId,
    },
    #[error("ledger entry {entry_id} not found")]
    NotFound { entry_id: EntryId },
}

/// Persistence seam for execution state. The in-memory store backs tests
/// and single-node deployments; a SQL-backed store implements the same
/// contract with a conditional `UPDATE ... WHERE status = $expected`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates an entry in `Pending` at the flow's entry node. Fails with
    /// [`LedgerError::DuplicateActiveExecution`] when a non-terminal entry
    /// already exists for the same (flow, subscriber), any version.
    async fn create(&self, new: NewEntry, now: DateTime<Utc>) -> Result<EntryId, LedgerError>;

    async fn get(&self, entry_id: EntryId) -> Option<ExecutionEntry>;

    /// Compare-and-swap: applies `update` only if the stored status still
    /// equals `expected`. Exactly one of any set of concurrent racers with
    /// the same precondition succeeds.
    async fn transition(
        &self,
        entry_id: EntryId,
        expected: ExecutionStatus,
        update: StateUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), ConflictError>;

    /// Entries ready for evaluation at `now`: all `Pending` entries plus
    /// `WaitingDelay` entries whose wake time has passed. Ordered by
    /// wake time ascending with `None` first, then entry id, so repeated
    /// calls drain in a reproducible order.
    async fn due_entries(&self, now: DateTime<Utc>, limit: usize) -> Vec<EntryId>;

    /// Appends a history record without touching status. History is never
    /// rewritten, only extended.
    async fn append_history(
        &self,
        entry_id: EntryId,
        record: HistoryRecord,
    ) -> Result<(), LedgerError>;

    /// The non-terminal entry for (flow, subscriber) across all versions,
    /// if one exists.
    async fn find_active(
        &self,
        flow_id: FlowId,
        subscriber_id: &SubscriberId,
    ) -> Option<ExecutionEntry>;

    /// Ids of every non-terminal entry of a flow, any version.
    async fn active_for_flow(&self, flow_id: FlowId) -> Vec<EntryId>;

    /// Every entry of a flow, for stats and operator inspection.
    async fn entries_for_flow(&self, flow_id: FlowId) -> Vec<ExecutionEntry>;
}
