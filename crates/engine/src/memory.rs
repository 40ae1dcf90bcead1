//! In-memory [`LedgerStore`]. Backs tests and single-node deployments;
//! rows live in a sharded map and the active-execution index sits behind
//! its own mutex so the duplicate guard stays exact.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use flowline_core::types::{EntryId, FlowId, SubscriberId};

use crate::ledger::{
    ConflictError, ExecutionEntry, ExecutionStatus, HistoryRecord, LedgerError, LedgerStore,
    NewEntry, StateUpdate,
};

type ActiveKey = (FlowId, SubscriberId);

/// Lock order: the active index mutex is never taken while holding a row
/// shard, and rows are never touched after taking it except for reads.
#[derive(Default)]
pub struct MemoryLedger {
    rows: DashMap<EntryId, ExecutionEntry>,
    active: Mutex<HashMap<ActiveKey, EntryId>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn create(&self, new: NewEntry, now: DateTime<Utc>) -> Result<EntryId, LedgerError> {
        let key = (new.flow_id, new.subscriber_id.clone());
        let mut active = self.active.lock();

        // The index may lag a terminal transition by a moment; the row is
        // the source of truth, so re-check before rejecting.
        if let Some(&existing) = active.get(&key) {
            let still_active = self
                .rows
                .get(&existing)
                .map(|row| !row.status.is_terminal())
                .unwrap_or(false);
            if still_active {
                return Err(LedgerError::DuplicateActiveExecution {
                    flow_id: new.flow_id,
                    subscriber_id: new.subscriber_id,
                });
            }
        }

        let id = Uuid::new_v4();
        let entry = ExecutionEntry {
            id,
            flow_id: new.flow_id,
            flow_version: new.flow_version,
            subscriber_id: new.subscriber_id,
            status: ExecutionStatus::Pending,
            current_node_id: new.entry_node_id,
            wake_at: None,
            attempt_count: 0,
            last_error: None,
            context: new.context,
            history: Vec::new(),
            entered_at: now,
            node_entered_at: now,
            updated_at: now,
        };
        self.rows.insert(id, entry);
        active.insert(key, id);
        Ok(id)
    }

    async fn get(&self, entry_id: EntryId) -> Option<ExecutionEntry> {
        self.rows.get(&entry_id).map(|row| row.clone())
    }

    async fn transition(
        &self,
        entry_id: EntryId,
        expected: ExecutionStatus,
        update: StateUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), ConflictError> {
        let StateUpdate {
            status,
            current_node_id,
            wake_at,
            attempt_count,
            last_error,
            record,
        } = update;

        let cleanup = {
            let mut row = self
                .rows
                .get_mut(&entry_id)
                .ok_or(ConflictError::Missing { entry_id })?;
            if row.status != expected {
                return Err(ConflictError::StaleStatus {
                    expected,
                    actual: row.status,
                });
            }
            if row.current_node_id != current_node_id {
                row.node_entered_at = now;
            }
            row.status = status;
            row.current_node_id = current_node_id;
            row.wake_at = wake_at;
            row.attempt_count = attempt_count;
            row.last_error = last_error;
            if let Some(record) = record {
                row.history.push(record);
            }
            row.updated_at = now;
            status
                .is_terminal()
                .then(|| (row.flow_id, row.subscriber_id.clone()))
        };

        if let Some(key) = cleanup {
            let mut active = self.active.lock();
            if active.get(&key) == Some(&entry_id) {
                active.remove(&key);
            }
        }
        Ok(())
    }

    async fn due_entries(&self, now: DateTime<Utc>, limit: usize) -> Vec<EntryId> {
        let mut due: Vec<(DateTime<Utc>, EntryId)> = Vec::new();
        for row in self.rows.iter() {
            let sort_key = match (row.status, row.wake_at) {
                // Pending entries have no wake time and drain first.
                (ExecutionStatus::Pending, _) => Some(DateTime::<Utc>::MIN_UTC),
                (ExecutionStatus::WaitingDelay, Some(wake)) if wake <= now => Some(wake),
                (ExecutionStatus::WaitingDelay, None) => Some(DateTime::<Utc>::MIN_UTC),
                _ => None,
            };
            if let Some(key) = sort_key {
                due.push((key, row.id));
            }
        }
        due.sort();
        due.truncate(limit);
        due.into_iter().map(|(_, id)| id).collect()
    }

    async fn append_history(
        &self,
        entry_id: EntryId,
        record: HistoryRecord,
    ) -> Result<(), LedgerError> {
        let mut row = self
            .rows
            .get_mut(&entry_id)
            .ok_or(LedgerError::NotFound { entry_id })?;
        row.history.push(record);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn find_active(
        &self,
        flow_id: FlowId,
        subscriber_id: &SubscriberId,
    ) -> Option<ExecutionEntry> {
        let id = {
            let active = self.active.lock();
            active.get(&(flow_id, subscriber_id.clone())).copied()
        }?;
        self.rows
            .get(&id)
            .filter(|row| !row.status.is_terminal())
            .map(|row| row.clone())
    }

    async fn active_for_flow(&self, flow_id: FlowId) -> Vec<EntryId> {
        let active = self.active.lock();
        active
            .iter()
            .filter(|((flow, _), _)| *flow == flow_id)
            .map(|(_, &id)| id)
            .collect()
    }

    async fn entries_for_flow(&self, flow_id: FlowId) -> Vec<ExecutionEntry> {
        self.rows
            .iter()
            .filter(|row| row.flow_id == flow_id)
            .map(|row| row.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StepOutcome;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;

    fn new_entry(flow_id: FlowId, subscriber: &str) -> NewEntry {
        NewEntry {
            flow_id,
            flow_version: 1,
            subscriber_id: SubscriberId::from(subscriber),
            entry_node_id: Uuid::new_v4(),
            context: json!({}),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_active() {
        let ledger = MemoryLedger::new();
        let flow_id = Uuid::new_v4();
        let now = Utc::now();

        ledger.create(new_entry(flow_id, "sub-1"), now).await.unwrap();
        let err = ledger
            .create(new_entry(flow_id, "sub-1"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateActiveExecution { .. }));

        // A different subscriber is unaffected.
        ledger.create(new_entry(flow_id, "sub-2"), now).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_entry_frees_the_slot() {
        let ledger = MemoryLedger::new();
        let flow_id = Uuid::new_v4();
        let now = Utc::now();

        let id = ledger.create(new_entry(flow_id, "sub-1"), now).await.unwrap();
        let entry = ledger.get(id).await.unwrap();
        ledger
            .transition(
                id,
                ExecutionStatus::Pending,
                StateUpdate::status_only(&entry, ExecutionStatus::Completed),
                now,
            )
            .await
            .unwrap();

        // Same subscriber may re-enter once the first run is terminal.
        ledger.create(new_entry(flow_id, "sub-1"), now).await.unwrap();
    }

    #[tokio::test]
    async fn test_cas_stale_status() {
        let ledger = MemoryLedger::new();
        let flow_id = Uuid::new_v4();
        let now = Utc::now();

        let id = ledger.create(new_entry(flow_id, "sub-1"), now).await.unwrap();
        let entry = ledger.get(id).await.unwrap();

        ledger
            .transition(
                id,
                ExecutionStatus::Pending,
                StateUpdate::status_only(&entry, ExecutionStatus::Running),
                now,
            )
            .await
            .unwrap();

        let err = ledger
            .transition(
                id,
                ExecutionStatus::Pending,
                StateUpdate::status_only(&entry, ExecutionStatus::Running),
                now,
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ConflictError::StaleStatus {
                expected: ExecutionStatus::Pending,
                actual: ExecutionStatus::Running,
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_one_winner() {
        let ledger = Arc::new(MemoryLedger::new());
        let flow_id = Uuid::new_v4();
        let now = Utc::now();

        let id = ledger.create(new_entry(flow_id, "sub-1"), now).await.unwrap();
        let entry = ledger.get(id).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            let update = StateUpdate::status_only(&entry, ExecutionStatus::Running);
            handles.push(tokio::spawn(async move {
                ledger
                    .transition(id, ExecutionStatus::Pending, update, now)
                    .await
                    .is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_due_entries_ordering() {
        let ledger = MemoryLedger::new();
        let flow_id = Uuid::new_v4();
        let now = Utc::now();

        let early = ledger.create(new_entry(flow_id, "sub-a"), now).await.unwrap();
        let late = ledger.create(new_entry(flow_id, "sub-b"), now).await.unwrap();
        let pending = ledger.create(new_entry(flow_id, "sub-c"), now).await.unwrap();

        for (id, wake) in [(early, now - Duration::hours(2)), (late, now - Duration::hours(1))] {
            let entry = ledger.get(id).await.unwrap();
            let mut update = StateUpdate::status_only(&entry, ExecutionStatus::WaitingDelay);
            update.wake_at = Some(wake);
            ledger
                .transition(id, ExecutionStatus::Pending, update, now)
                .await
                .unwrap();
        }

        let due = ledger.due_entries(now, 10).await;
        assert_eq!(due, vec![pending, early, late]);

        // A future wake time keeps the entry out of the due set.
        let entry = ledger.get(pending).await.unwrap();
        let mut update = StateUpdate::status_only(&entry, ExecutionStatus::WaitingDelay);
        update.wake_at = Some(now + Duration::hours(1));
        ledger
            .transition(pending, ExecutionStatus::Pending, update, now)
            .await
            .unwrap();
        let due = ledger.due_entries(now, 10).await;
        assert_eq!(due, vec![early, late]);
    }

    #[tokio::test]
    async fn test_history_is_append_only() {
        let ledger = MemoryLedger::new();
        let flow_id = Uuid::new_v4();
        let now = Utc::now();
        let id = ledger.create(new_entry(flow_id, "sub-1"), now).await.unwrap();

        let node = Uuid::new_v4();
        for i in 0..3 {
            ledger
                .append_history(
                    id,
                    HistoryRecord {
                        node_id: node,
                        entered_at: now + Duration::seconds(i),
                        exited_at: Some(now + Duration::seconds(i + 1)),
                        outcome: StepOutcome::Advanced { to: node },
                    },
                )
                .await
                .unwrap();
        }

        let entry = ledger.get(id).await.unwrap();
        assert_eq!(entry.history.len(), 3);
        assert!(entry
            .history
            .windows(2)
            .all(|pair| pair[0].entered_at <= pair[1].entered_at));
    }
}
