//! Action dispatch seam. Delivery providers implement [`ActionExecutor`];
//! the registry selects one by the node's stable action kind key. Executors
//! own retry de-duplication via the idempotency key the engine supplies.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use flowline_core::types::{StoreId, SubscriberId};
use flowline_graph::ActionKind;

/// One action invocation. `idempotency_key` is stable across retries of
/// the same node attempt, letting providers de-duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: ActionKind,
    pub params: serde_json::Value,
    pub idempotency_key: String,
    pub subscriber_id: SubscriberId,
    pub store_id: StoreId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Provider-side reference for the dispatched action, when one exists.
    pub provider_ref: Option<String>,
    /// True when the provider recognized the idempotency key and skipped
    /// a duplicate dispatch.
    pub deduplicated: bool,
}

impl ActionOutcome {
    pub fn dispatched(provider_ref: impl Into<String>) -> Self {
        Self {
            provider_ref: Some(provider_ref.into()),
            deduplicated: false,
        }
    }

    pub fn duplicate() -> Self {
        Self {
            provider_ref: None,
            deduplicated: true,
        }
    }
}

/// Transient by default; the scheduler retries with backoff up to the
/// configured ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("provider rejected {action}: {reason}")]
    Rejected { action: ActionKind, reason: String },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError>;
}

/// Maps action kinds to executors. A kind without a registered executor
/// fails evaluation without retry; wiring gaps are configuration bugs,
/// not transient faults.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ActionKind, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ActionKind, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(kind, executor);
    }

    /// Registers one executor for every action kind.
    pub fn register_all(&mut self, executor: Arc<dyn ActionExecutor>) {
        for kind in ActionKind::ALL {
            self.executors.insert(kind, Arc::clone(&executor));
        }
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.get(&kind).cloned()
    }
}

/// Acknowledges every request without dispatching. Wire this for channels
/// a store has switched off.
pub struct NoopExecutor;

#[async_trait]
impl ActionExecutor for NoopExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        metrics::counter!("executor.dropped", "action" => request.action.as_str()).increment(1);
        Ok(ActionOutcome {
            provider_ref: None,
            deduplicated: false,
        })
    }
}

/// Logs each dispatch and fabricates a provider reference. Default wiring
/// for the demo binary.
pub struct LogExecutor;

#[async_trait]
impl ActionExecutor for LogExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        let provider_ref = format!("log-{}", Uuid::new_v4());
        info!(
            action = %request.action,
            subscriber_id = %request.subscriber_id,
            idempotency_key = %request.idempotency_key,
            provider_ref = %provider_ref,
            "Dispatching action"
        );
        metrics::counter!("executor.dispatched", "action" => request.action.as_str()).increment(1);
        Ok(ActionOutcome::dispatched(provider_ref))
    }
}

/// Records every request and de-duplicates on the idempotency key.
/// Test double for delivery providers.
#[derive(Default)]
pub struct CaptureExecutor {
    requests: Mutex<Vec<ActionRequest>>,
    seen_keys: Mutex<HashSet<String>>,
}

impl CaptureExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn count_kind(&self, kind: ActionKind) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.action == kind)
            .count()
    }
}

#[async_trait]
impl ActionExecutor for CaptureExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        let fresh = self.seen_keys.lock().insert(request.idempotency_key.clone());
        if !fresh {
            return Ok(ActionOutcome::duplicate());
        }
        self.requests.lock().push(request.clone());
        Ok(ActionOutcome::dispatched(format!(
            "capture-{}",
            request.idempotency_key
        )))
    }
}

/// Fails the first `failures` invocations, then succeeds. Backs retry and
/// backoff tests; construct with `u64::MAX` for a provider that never
/// recovers.
pub struct FlakyExecutor {
    failures: AtomicU64,
    calls: AtomicU64,
}

impl FlakyExecutor {
    pub fn failing(failures: u64) -> Self {
        Self {
            failures: AtomicU64::new(failures),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for FlakyExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u64::MAX {
                self.failures.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(ActionError::Unavailable(format!(
                "simulated outage for {}",
                request.action
            )));
        }
        Ok(ActionOutcome::dispatched(format!(
            "flaky-{}",
            request.idempotency_key
        )))
    }
}
