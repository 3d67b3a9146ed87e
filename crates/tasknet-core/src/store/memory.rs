// In-memory store for examples and testing
//
// Transactions take an owned mutex guard for their whole lifetime, which
// serializes them exactly like the engine's concurrency model prescribes,
// and work on a cloned copy of the tables. Commit writes the copy back;
// dropping the transaction discards it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreError, StoreTx};
use crate::entities::{
    AuditSpanRow, ConditionRow, JobState, ParentRef, ScheduledJobRow, SnapshotRow, TaskRow,
    TaskState, TaskStateLogRow, WorkItemRow, WorkItemState, WorkflowRow, WorkflowStateLogRow,
};

/// All tables of the in-memory store
#[derive(Debug, Clone, Default)]
struct Tables {
    workflows: HashMap<Uuid, WorkflowRow>,
    tasks: HashMap<Uuid, TaskRow>,
    conditions: HashMap<Uuid, ConditionRow>,
    work_items: HashMap<Uuid, WorkItemRow>,
    jobs: HashMap<Uuid, ScheduledJobRow>,
    spans: Vec<AuditSpanRow>,
    snapshots: Vec<SnapshotRow>,
    task_state_logs: Vec<TaskStateLogRow>,
    workflow_state_logs: Vec<WorkflowStateLogRow>,
}

/// In-memory implementation of the store contract
///
/// Primarily for tests and examples; provides the same transactional
/// semantics as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of audit spans written (for test assertions)
    pub async fn span_count(&self) -> usize {
        self.tables.lock().await.spans.len()
    }

    /// Number of workflow rows (for test assertions)
    pub async fn workflow_count(&self) -> usize {
        self.tables.lock().await.workflows.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }
}

/// One open transaction: a working copy plus the lock that serializes it
struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
}

fn sort_spans(mut rows: Vec<AuditSpanRow>) -> Vec<AuditSpanRow> {
    rows.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
    rows
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_workflow(&mut self, row: WorkflowRow) -> Result<(), StoreError> {
        self.work.workflows.insert(row.id, row);
        Ok(())
    }

    async fn workflow(&mut self, id: Uuid) -> Result<Option<WorkflowRow>, StoreError> {
        Ok(self.work.workflows.get(&id).cloned())
    }

    async fn update_workflow(&mut self, row: &WorkflowRow) -> Result<(), StoreError> {
        self.work.workflows.insert(row.id, row.clone());
        Ok(())
    }

    async fn workflows_by_parent(
        &mut self,
        parent: &ParentRef,
    ) -> Result<Vec<WorkflowRow>, StoreError> {
        let mut rows: Vec<_> = self
            .work
            .workflows
            .values()
            .filter(|w| w.parent.as_ref() == Some(parent))
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.id);
        Ok(rows)
    }

    async fn workflows_by_parent_workflow(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowRow>, StoreError> {
        let mut rows: Vec<_> = self
            .work
            .workflows
            .values()
            .filter(|w| {
                w.parent
                    .as_ref()
                    .is_some_and(|p| p.workflow_id == workflow_id)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.id);
        Ok(rows)
    }

    async fn insert_task(&mut self, row: TaskRow) -> Result<(), StoreError> {
        self.work.tasks.insert(row.id, row);
        Ok(())
    }

    async fn update_task(&mut self, row: &TaskRow) -> Result<(), StoreError> {
        self.work.tasks.insert(row.id, row.clone());
        Ok(())
    }

    async fn tasks_by_workflow(&mut self, workflow_id: Uuid) -> Result<Vec<TaskRow>, StoreError> {
        let mut rows: Vec<_> = self
            .work
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.generation.cmp(&b.generation)));
        Ok(rows)
    }

    async fn tasks_by_workflow_state(
        &mut self,
        workflow_id: Uuid,
        state: TaskState,
    ) -> Result<Vec<TaskRow>, StoreError> {
        let mut rows: Vec<_> = self
            .work
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id && t.state == state)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.generation.cmp(&b.generation)));
        Ok(rows)
    }

    async fn latest_task(
        &mut self,
        workflow_id: Uuid,
        name: &str,
    ) -> Result<Option<TaskRow>, StoreError> {
        Ok(self
            .work
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id && t.name == name)
            .max_by_key(|t| t.generation)
            .cloned())
    }

    async fn task_at(
        &mut self,
        workflow_id: Uuid,
        name: &str,
        generation: u32,
    ) -> Result<Option<TaskRow>, StoreError> {
        Ok(self
            .work
            .tasks
            .values()
            .find(|t| t.workflow_id == workflow_id && t.name == name && t.generation == generation)
            .cloned())
    }

    async fn insert_condition(&mut self, row: ConditionRow) -> Result<(), StoreError> {
        self.work.conditions.insert(row.id, row);
        Ok(())
    }

    async fn update_condition(&mut self, row: &ConditionRow) -> Result<(), StoreError> {
        self.work.conditions.insert(row.id, row.clone());
        Ok(())
    }

    async fn condition(
        &mut self,
        workflow_id: Uuid,
        name: &str,
    ) -> Result<Option<ConditionRow>, StoreError> {
        Ok(self
            .work
            .conditions
            .values()
            .find(|c| c.workflow_id == workflow_id && c.name == name)
            .cloned())
    }

    async fn conditions_by_workflow(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Vec<ConditionRow>, StoreError> {
        let mut rows: Vec<_> = self
            .work
            .conditions
            .values()
            .filter(|c| c.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn insert_work_item(&mut self, row: WorkItemRow) -> Result<(), StoreError> {
        self.work.work_items.insert(row.id, row);
        Ok(())
    }

    async fn update_work_item(&mut self, row: &WorkItemRow) -> Result<(), StoreError> {
        self.work.work_items.insert(row.id, row.clone());
        Ok(())
    }

    async fn work_item(&mut self, id: Uuid) -> Result<Option<WorkItemRow>, StoreError> {
        Ok(self.work.work_items.get(&id).cloned())
    }

    async fn work_items_by_parent(
        &mut self,
        parent: &ParentRef,
        state: Option<WorkItemState>,
    ) -> Result<Vec<WorkItemRow>, StoreError> {
        let mut rows: Vec<_> = self
            .work
            .work_items
            .values()
            .filter(|w| &w.parent == parent && state.is_none_or(|s| w.state == s))
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.id);
        Ok(rows)
    }

    async fn insert_job(&mut self, row: ScheduledJobRow) -> Result<(), StoreError> {
        self.work.jobs.insert(row.id, row);
        Ok(())
    }

    async fn update_job(&mut self, row: &ScheduledJobRow) -> Result<(), StoreError> {
        self.work.jobs.insert(row.id, row.clone());
        Ok(())
    }

    async fn job(&mut self, id: Uuid) -> Result<Option<ScheduledJobRow>, StoreError> {
        Ok(self.work.jobs.get(&id).cloned())
    }

    async fn jobs_by_parent(
        &mut self,
        parent: &ParentRef,
    ) -> Result<Vec<ScheduledJobRow>, StoreError> {
        let mut rows: Vec<_> = self
            .work
            .jobs
            .values()
            .filter(|j| &j.parent == parent)
            .cloned()
            .collect();
        rows.sort_by_key(|j| j.id);
        Ok(rows)
    }

    async fn due_jobs(&mut self, now: DateTime<Utc>) -> Result<Vec<ScheduledJobRow>, StoreError> {
        let mut rows: Vec<_> = self
            .work
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending && j.run_at <= now)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn insert_span(&mut self, row: AuditSpanRow) -> Result<(), StoreError> {
        self.work.spans.push(row);
        Ok(())
    }

    async fn max_span_sequence(&mut self) -> Result<i64, StoreError> {
        Ok(self.work.spans.iter().map(|s| s.sequence).max().unwrap_or(-1))
    }

    async fn spans_by_trace(&mut self, trace_id: Uuid) -> Result<Vec<AuditSpanRow>, StoreError> {
        let rows: Vec<_> = self
            .work
            .spans
            .iter()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect();
        Ok(sort_spans(rows))
    }

    async fn spans_by_trace_workflow(
        &mut self,
        trace_id: Uuid,
        workflow_id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditSpanRow>, StoreError> {
        let rows: Vec<_> = self
            .work
            .spans
            .iter()
            .filter(|s| {
                s.trace_id == trace_id
                    && s.workflow_id == workflow_id
                    && until.is_none_or(|t| s.started_at <= t)
            })
            .cloned()
            .collect();
        Ok(sort_spans(rows))
    }

    async fn insert_snapshot(&mut self, row: SnapshotRow) -> Result<(), StoreError> {
        self.work.snapshots.push(row);
        Ok(())
    }

    async fn latest_snapshot(
        &mut self,
        workflow_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SnapshotRow>, StoreError> {
        Ok(self
            .work
            .snapshots
            .iter()
            .filter(|s| s.workflow_id == workflow_id && s.taken_at <= at)
            .max_by_key(|s| s.taken_at)
            .cloned())
    }

    async fn append_task_state_log(&mut self, row: TaskStateLogRow) -> Result<(), StoreError> {
        self.work.task_state_logs.push(row);
        Ok(())
    }

    async fn append_workflow_state_log(
        &mut self,
        row: WorkflowStateLogRow,
    ) -> Result<(), StoreError> {
        self.work.workflow_state_logs.push(row);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = *self;
        *this.guard = this.work;
        Ok(())
    }
}
