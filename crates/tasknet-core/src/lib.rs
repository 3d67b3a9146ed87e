// Petri-Net Workflow Execution Engine
//
// This crate persists and advances long-running, hierarchical workflows
// built from conditions (token-holding places), tasks (transitions with
// and/xor/or joins and and/xor splits), and work items (execution units of
// atomic tasks). Composite tasks run child workflows; dynamic composite
// tasks defer the choice between several child workflow types.
//
// Key design decisions:
// - Store-agnostic via traits (Store, StoreTx); in-memory impl ships here,
//   PostgreSQL lives in tasknet-storage
// - Every mutation is one serialized transaction; the firing engine
//   propagates marking changes to fixpoint on a FIFO step queue inside it
// - Task generations distinguish loop re-entries; work items, child
//   workflows, and scheduled jobs are pinned to the generation that owns them
// - Audit spans record every transition; time-travel reconstruction folds
//   them per workflow, optionally from a snapshot
// - Version managers hold ordered definitions plus adjacent migrations;
//   migration cancels the old root and fast-forwards a new one by replaying
//   completed task decisions
// - The registry is passed explicitly to the engine - no process-wide state

pub mod audit;
pub mod builder;
pub mod context;
pub mod definition;
pub mod engine;
pub mod entities;
pub mod error;
pub mod store;
pub mod versions;

mod firing;
mod migration;
mod net;

// Re-exports for convenience
pub use audit::{WorkflowStateView, TaskView, WorkItemView};
pub use builder::{TaskBuilder, WorkflowBuilder};
pub use context::{ActivityScope, Clock, ManualClock, RouteContext, SystemClock};
pub use definition::{
    default_policy, AnyPayload, ChildRef, DefaultActivities, InstanceStats, JoinKind, NoopHandler,
    PolicyContext, PolicyDecision, SplitKind, SplitRouter, TaskActivities, TaskKind, Validator,
    WorkItemAction, WorkItemHandler, WorkflowDefinition,
};
pub use engine::{
    ChildWorkflowTarget, JobOutcome, JobRunStatus, WorkItemTarget, WorkflowEngine,
};
pub use entities::{
    AuditSpanRow, ConditionKind, ConditionRow, ExecutionMode, JobSpec, JobState, OperationType,
    ParentRef, ResourceType, ScheduledJobRow, SnapshotRow, TaskRow, TaskState, TaskStateLogRow,
    WorkItemRow, WorkItemState, WorkflowRow, WorkflowState, WorkflowStateLogRow,
};
pub use error::{DefinitionError, EngineError, Result};
pub use store::{memory::MemoryStore, Store, StoreError, StoreTx};
pub use versions::{
    FastForwardCompleted, FastForwardOutcome, Migration, MigrationAction, MigrationHook,
    MigrationScope, Registry, TaskMigrator, VersionManager,
};
