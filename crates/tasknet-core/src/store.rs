// Store contract
//
// The engine is persistence-agnostic: every mutation runs inside one
// serialized transaction obtained from `Store::begin()`. Implementations must
// provide snapshot isolation and serializable commit. Dropping a `StoreTx`
// without committing rolls the transaction back; nothing leaks, including
// scheduled jobs registered during the transaction.
//
// The in-memory implementation in `store::memory` backs tests and examples;
// the PostgreSQL implementation lives in the `tasknet-storage` crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{
    AuditSpanRow, ConditionRow, ParentRef, ScheduledJobRow, SnapshotRow, TaskRow, TaskState,
    TaskStateLogRow, WorkItemRow, WorkItemState, WorkflowRow, WorkflowStateLogRow,
};

pub mod memory;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend failure (connection, SQL, I/O)
    #[error("database error: {0}")]
    Database(String),

    /// Serializable commit conflict; the host may retry the transaction
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// Row (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Transactional store factory
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Open a serialized transaction
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// One open transaction over the six entity families.
///
/// All reads observe the transaction's snapshot plus its own writes. The
/// required secondary indexes are expressed as query methods; implementations
/// back them with real indexes.
#[async_trait]
pub trait StoreTx: Send {
    // =========================================================================
    // Workflows
    // =========================================================================

    async fn insert_workflow(&mut self, row: WorkflowRow) -> Result<(), StoreError>;

    async fn workflow(&mut self, id: Uuid) -> Result<Option<WorkflowRow>, StoreError>;

    async fn update_workflow(&mut self, row: &WorkflowRow) -> Result<(), StoreError>;

    /// Children of one exact task generation
    async fn workflows_by_parent(
        &mut self,
        parent: &ParentRef,
    ) -> Result<Vec<WorkflowRow>, StoreError>;

    /// All child workflows of a workflow, across tasks and generations
    async fn workflows_by_parent_workflow(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowRow>, StoreError>;

    // =========================================================================
    // Tasks
    // =========================================================================

    async fn insert_task(&mut self, row: TaskRow) -> Result<(), StoreError>;

    async fn update_task(&mut self, row: &TaskRow) -> Result<(), StoreError>;

    async fn tasks_by_workflow(&mut self, workflow_id: Uuid) -> Result<Vec<TaskRow>, StoreError>;

    async fn tasks_by_workflow_state(
        &mut self,
        workflow_id: Uuid,
        state: TaskState,
    ) -> Result<Vec<TaskRow>, StoreError>;

    /// Highest-generation row for `(workflow_id, name)`
    async fn latest_task(
        &mut self,
        workflow_id: Uuid,
        name: &str,
    ) -> Result<Option<TaskRow>, StoreError>;

    /// Exact generation lookup
    async fn task_at(
        &mut self,
        workflow_id: Uuid,
        name: &str,
        generation: u32,
    ) -> Result<Option<TaskRow>, StoreError>;

    // =========================================================================
    // Conditions
    // =========================================================================

    async fn insert_condition(&mut self, row: ConditionRow) -> Result<(), StoreError>;

    async fn update_condition(&mut self, row: &ConditionRow) -> Result<(), StoreError>;

    async fn condition(
        &mut self,
        workflow_id: Uuid,
        name: &str,
    ) -> Result<Option<ConditionRow>, StoreError>;

    async fn conditions_by_workflow(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Vec<ConditionRow>, StoreError>;

    // =========================================================================
    // Work items
    // =========================================================================

    async fn insert_work_item(&mut self, row: WorkItemRow) -> Result<(), StoreError>;

    async fn update_work_item(&mut self, row: &WorkItemRow) -> Result<(), StoreError>;

    async fn work_item(&mut self, id: Uuid) -> Result<Option<WorkItemRow>, StoreError>;

    /// Work items of one task generation, optionally filtered by state
    async fn work_items_by_parent(
        &mut self,
        parent: &ParentRef,
        state: Option<WorkItemState>,
    ) -> Result<Vec<WorkItemRow>, StoreError>;

    // =========================================================================
    // Scheduled jobs
    // =========================================================================

    async fn insert_job(&mut self, row: ScheduledJobRow) -> Result<(), StoreError>;

    async fn update_job(&mut self, row: &ScheduledJobRow) -> Result<(), StoreError>;

    async fn job(&mut self, id: Uuid) -> Result<Option<ScheduledJobRow>, StoreError>;

    /// Jobs registered under one task generation
    async fn jobs_by_parent(
        &mut self,
        parent: &ParentRef,
    ) -> Result<Vec<ScheduledJobRow>, StoreError>;

    /// Pending jobs with `run_at <= now`, ordered by `run_at`
    async fn due_jobs(&mut self, now: DateTime<Utc>) -> Result<Vec<ScheduledJobRow>, StoreError>;

    // =========================================================================
    // Audit spans and snapshots
    // =========================================================================

    async fn insert_span(&mut self, row: AuditSpanRow) -> Result<(), StoreError>;

    /// Highest span sequence written so far, or -1 on an empty log. The
    /// engine seeds its sequence counter from this at startup.
    async fn max_span_sequence(&mut self) -> Result<i64, StoreError>;

    /// All spans of a trace, ordered by `(started_at, span_id)`
    async fn spans_by_trace(&mut self, trace_id: Uuid) -> Result<Vec<AuditSpanRow>, StoreError>;

    /// Spans of one workflow within a trace up to and including `until`,
    /// ordered by `(started_at, span_id)`
    async fn spans_by_trace_workflow(
        &mut self,
        trace_id: Uuid,
        workflow_id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditSpanRow>, StoreError>;

    async fn insert_snapshot(&mut self, row: SnapshotRow) -> Result<(), StoreError>;

    /// Latest snapshot of the workflow taken at or before `at`
    async fn latest_snapshot(
        &mut self,
        workflow_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SnapshotRow>, StoreError>;

    // =========================================================================
    // Append-only state logs
    // =========================================================================

    async fn append_task_state_log(&mut self, row: TaskStateLogRow) -> Result<(), StoreError>;

    async fn append_workflow_state_log(
        &mut self,
        row: WorkflowStateLogRow,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commit the transaction. Dropping without commit rolls back.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
