//! Flow execution engine.
//!
//! Advances each subscriber's position through a published flow graph:
//! the [`ledger`] holds durable per-subscriber state behind a CAS-guarded
//! API, the [`scheduler`] drains due entries with a worker pool, and the
//! [`evaluator`] decides each node's transition, consulting [`send_time`]
//! for optimal-send delays and [`executor`] implementations for actions.

pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod ledger;
pub mod memory;
pub mod registry;
pub mod scheduler;
pub mod send_time;

pub use engine::{FlowEngine, FlowStats};
pub use evaluator::{EvalError, NodeEvaluator, Transition};
pub use executor::{
    ActionError, ActionExecutor, ActionOutcome, ActionRequest, CaptureExecutor, ExecutorRegistry,
    FlakyExecutor, LogExecutor, NoopExecutor,
};
pub use ledger::{
    ConflictError, ExecutionEntry, ExecutionStatus, HistoryRecord, LedgerError, LedgerStore,
    NewEntry, StateUpdate, StepOutcome,
};
pub use memory::MemoryLedger;
pub use registry::{FlowRegistry, FlowStatus, FlowSummary};
pub use scheduler::{SchedulerHandle, StepScheduler, TickStats};
pub use send_time::{next_optimal_time, EngagementProfile, MemoryProfileStore, ProfileProvider};
