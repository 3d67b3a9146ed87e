// Audit subsystem
//
// Every state transition writes one immutable span. Spans form the
// append-only log from which workflow state at any historical timestamp is
// reconstructed: fold all spans of the workflow (never the whole trace — a
// parent and its children share a trace id but must not mix) in
// (started_at, span_id) order. Snapshots bound replay cost; reconstruction
// starts from the latest snapshot at or before the cut-off and folds
// forward.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::{
    AuditSpanRow, SnapshotRow, TaskState, WorkItemState, WorkflowState,
};
use crate::error::{EngineError, Result};
use crate::store::StoreTx;

// ============================================================================
// Operation vocabulary
// ============================================================================

/// Transition names written to `AuditSpanRow.operation`
pub mod ops {
    pub const WORKFLOW_INITIALIZE: &str = "Workflow.initialize";
    pub const WORKFLOW_START: &str = "Workflow.start";
    pub const WORKFLOW_COMPLETE: &str = "Workflow.complete";
    pub const WORKFLOW_FAIL: &str = "Workflow.fail";
    pub const WORKFLOW_CANCEL: &str = "Workflow.cancel";

    pub const TASK_REGISTER: &str = "Task.register";
    pub const TASK_ENABLE: &str = "Task.enable";
    pub const TASK_START: &str = "Task.start";
    pub const TASK_COMPLETE: &str = "Task.complete";
    pub const TASK_FAIL: &str = "Task.fail";
    pub const TASK_CANCEL: &str = "Task.cancel";

    pub const WORK_ITEM_INITIALIZE: &str = "WorkItem.initialize";
    pub const WORK_ITEM_START: &str = "WorkItem.start";
    pub const WORK_ITEM_COMPLETE: &str = "WorkItem.complete";
    pub const WORK_ITEM_FAIL: &str = "WorkItem.fail";
    pub const WORK_ITEM_CANCEL: &str = "WorkItem.cancel";
    pub const WORK_ITEM_RESET: &str = "WorkItem.reset";

    pub const CONDITION_INCREMENT: &str = "Condition.incrementMarking";
    pub const CONDITION_DECREMENT: &str = "Condition.decrementMarking";

    pub const ACTIVITY_ON_ENABLED: &str = "Activity.onEnabled";
    pub const ACTIVITY_ON_STARTED: &str = "Activity.onStarted";
    pub const ACTIVITY_ON_COMPLETED: &str = "Activity.onCompleted";
    pub const ACTIVITY_ON_FAILED: &str = "Activity.onFailed";
    pub const ACTIVITY_ON_CANCELED: &str = "Activity.onCanceled";
}

/// Attribute keys carried in `AuditSpanRow.attributes`
pub mod attr {
    pub const JOIN_TYPE: &str = "joinType";
    pub const JOIN_SATISFIED: &str = "joinSatisfied";
    pub const INPUT_CONDITIONS: &str = "inputConditions";
    pub const SPLIT_TYPE: &str = "splitType";
    pub const OUTPUT_CONDITIONS: &str = "outputConditions";
    pub const ROUTE: &str = "route";
    pub const OLD_MARKING: &str = "oldMarking";
    pub const NEW_MARKING: &str = "newMarking";
    pub const DELTA: &str = "delta";
    pub const GENERATION: &str = "generation";
    pub const TASK_NAME: &str = "taskName";
    pub const REASON: &str = "reason";
    pub const VERSION_NAME: &str = "versionName";
    pub const MIGRATION_FROM_WORKFLOW_ID: &str = "migrationFromWorkflowId";
    pub const EXECUTION_MODE: &str = "executionMode";
}

// ============================================================================
// Reconstructed state
// ============================================================================

/// Task as seen by reconstruction: the latest generation wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub generation: u32,
    pub state: TaskState,
}

/// Work item as seen by reconstruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemView {
    pub task_name: String,
    pub generation: u32,
    pub state: WorkItemState,
}

/// Workflow state at a point in time, as reconstructed from spans or read
/// from live rows (for snapshots)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStateView {
    pub workflow_id: Option<Uuid>,
    pub state: Option<WorkflowState>,
    /// Condition name -> marking
    pub conditions: BTreeMap<String, u32>,
    /// Task name -> latest generation and state
    pub tasks: BTreeMap<String, TaskView>,
    pub work_items: BTreeMap<Uuid, WorkItemView>,
}

impl WorkflowStateView {
    /// Apply one span to the view. Spans with operations the fold does not
    /// model (API roots, activity spans) are ignored.
    pub fn apply(&mut self, span: &AuditSpanRow) {
        match span.operation.as_str() {
            ops::WORKFLOW_INITIALIZE => {
                self.workflow_id = Some(span.workflow_id);
                self.state = Some(WorkflowState::Initialized);
            }
            ops::WORKFLOW_START => self.state = Some(WorkflowState::Started),
            ops::WORKFLOW_COMPLETE => self.state = Some(WorkflowState::Completed),
            ops::WORKFLOW_FAIL => self.state = Some(WorkflowState::Failed),
            ops::WORKFLOW_CANCEL => self.state = Some(WorkflowState::Canceled),

            ops::TASK_REGISTER => {
                self.tasks.insert(
                    span.resource_name.clone(),
                    TaskView {
                        generation: span.task_generation.unwrap_or(1),
                        state: TaskState::Disabled,
                    },
                );
            }
            ops::TASK_ENABLE => self.set_task(span, TaskState::Enabled),
            ops::TASK_START => self.set_task(span, TaskState::Started),
            ops::TASK_COMPLETE => self.set_task(span, TaskState::Completed),
            ops::TASK_FAIL => self.set_task(span, TaskState::Failed),
            ops::TASK_CANCEL => self.set_task(span, TaskState::Canceled),

            ops::WORK_ITEM_INITIALIZE => {
                let task_name = span.attributes[attr::TASK_NAME]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                self.work_items.insert(
                    span.resource_id,
                    WorkItemView {
                        task_name,
                        generation: span.task_generation.unwrap_or(1),
                        state: WorkItemState::Initialized,
                    },
                );
            }
            ops::WORK_ITEM_START => self.set_work_item(span, WorkItemState::Started),
            ops::WORK_ITEM_COMPLETE => self.set_work_item(span, WorkItemState::Completed),
            ops::WORK_ITEM_FAIL => self.set_work_item(span, WorkItemState::Failed),
            ops::WORK_ITEM_CANCEL => self.set_work_item(span, WorkItemState::Canceled),
            ops::WORK_ITEM_RESET => self.set_work_item(span, WorkItemState::Initialized),

            ops::CONDITION_INCREMENT | ops::CONDITION_DECREMENT => {
                if let Some(marking) = span.attributes[attr::NEW_MARKING].as_u64() {
                    self.conditions
                        .insert(span.resource_name.clone(), marking as u32);
                }
            }

            _ => {}
        }
    }

    fn set_task(&mut self, span: &AuditSpanRow, state: TaskState) {
        let entry = self
            .tasks
            .entry(span.resource_name.clone())
            .or_insert(TaskView {
                generation: span.task_generation.unwrap_or(1),
                state,
            });
        entry.state = state;
        if let Some(generation) = span.task_generation {
            entry.generation = generation;
        }
    }

    fn set_work_item(&mut self, span: &AuditSpanRow, state: WorkItemState) {
        if let Some(item) = self.work_items.get_mut(&span.resource_id) {
            item.state = state;
        }
    }
}

// ============================================================================
// Reconstruction
// ============================================================================

/// Reconstruct the state of one workflow at `at` by folding its spans.
///
/// Filtering by `workflow_id` is mandatory: the trace also carries spans of
/// parent and child workflows, which must not leak into the view.
pub async fn reconstruct_at(
    tx: &mut dyn StoreTx,
    trace_id: Uuid,
    workflow_id: Uuid,
    at: DateTime<Utc>,
) -> Result<WorkflowStateView> {
    let snapshot = tx.latest_snapshot(workflow_id, at).await?;
    let (mut view, watermark) = match snapshot {
        Some(row) => {
            let view: WorkflowStateView =
                serde_json::from_value(row.state).map_err(crate::store::StoreError::from)?;
            (view, Some(row.sequence))
        }
        None => (WorkflowStateView::default(), None),
    };

    let spans = tx
        .spans_by_trace_workflow(trace_id, workflow_id, Some(at))
        .await?;
    for span in &spans {
        if watermark.is_some_and(|seq| span.sequence <= seq) {
            continue;
        }
        view.apply(span);
    }
    Ok(view)
}

/// Build the view from live rows, used when writing a snapshot
pub(crate) async fn live_view(
    tx: &mut dyn StoreTx,
    workflow_id: Uuid,
) -> Result<WorkflowStateView> {
    let workflow = tx
        .workflow(workflow_id)
        .await?
        .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

    let mut view = WorkflowStateView {
        workflow_id: Some(workflow.id),
        state: Some(workflow.state),
        ..Default::default()
    };

    for condition in tx.conditions_by_workflow(workflow_id).await? {
        view.conditions.insert(condition.name, condition.marking);
    }

    for task in tx.tasks_by_workflow(workflow_id).await? {
        // rows arrive ordered by (name, generation); the latest generation
        // overwrites earlier ones
        view.tasks.insert(
            task.name.clone(),
            TaskView {
                generation: task.generation,
                state: task.state,
            },
        );
        let items = tx.work_items_by_parent(&task.parent_ref(), None).await?;
        for item in items {
            view.work_items.insert(
                item.id,
                WorkItemView {
                    task_name: task.name.clone(),
                    generation: task.generation,
                    state: item.state,
                },
            );
        }
    }

    Ok(view)
}

/// Persist a snapshot of the live state. `sequence` is the span-sequence
/// watermark: every span written so far is covered by the snapshot.
pub(crate) async fn write_snapshot(
    tx: &mut dyn StoreTx,
    trace_id: Uuid,
    workflow_id: Uuid,
    taken_at: DateTime<Utc>,
    sequence: i64,
) -> Result<Uuid> {
    let view = live_view(tx, workflow_id).await?;
    let id = Uuid::now_v7();
    tx.insert_snapshot(SnapshotRow {
        id,
        trace_id,
        workflow_id,
        taken_at,
        sequence,
        state: serde_json::to_value(&view).map_err(crate::store::StoreError::from)?,
    })
    .await?;
    Ok(id)
}

/// Attribute payload for a marking change
pub(crate) fn marking_attrs(old_marking: u32, new_marking: u32, delta: i64) -> Value {
    serde_json::json!({
        attr::OLD_MARKING: old_marking,
        attr::NEW_MARKING: new_marking,
        attr::DELTA: delta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{OperationType, ResourceType};
    use serde_json::json;

    fn span(
        workflow_id: Uuid,
        operation: &str,
        resource_name: &str,
        generation: Option<u32>,
        attributes: Value,
    ) -> AuditSpanRow {
        let now = Utc::now();
        AuditSpanRow {
            trace_id: workflow_id,
            span_id: Uuid::now_v7(),
            sequence: 0,
            parent_span_id: None,
            operation_type: OperationType::Mutation,
            operation: operation.to_string(),
            resource_type: ResourceType::Workflow,
            resource_id: Uuid::now_v7(),
            resource_name: resource_name.to_string(),
            workflow_id,
            task_generation: generation,
            started_at: now,
            ended_at: now,
            attributes,
        }
    }

    #[test]
    fn test_fold_tracks_states_and_markings() {
        let workflow_id = Uuid::now_v7();
        let mut view = WorkflowStateView::default();

        view.apply(&span(workflow_id, ops::WORKFLOW_INITIALIZE, "order", None, json!({})));
        view.apply(&span(
            workflow_id,
            ops::CONDITION_INCREMENT,
            "start",
            None,
            marking_attrs(0, 1, 1),
        ));
        view.apply(&span(workflow_id, ops::TASK_REGISTER, "pay", Some(1), json!({})));
        view.apply(&span(workflow_id, ops::TASK_ENABLE, "pay", Some(1), json!({})));
        view.apply(&span(
            workflow_id,
            ops::CONDITION_DECREMENT,
            "start",
            None,
            marking_attrs(1, 0, -1),
        ));

        assert_eq!(view.state, Some(WorkflowState::Initialized));
        assert_eq!(view.conditions["start"], 0);
        assert_eq!(view.tasks["pay"].state, TaskState::Enabled);
        assert_eq!(view.tasks["pay"].generation, 1);
    }

    #[test]
    fn test_fold_latest_generation_wins() {
        let workflow_id = Uuid::now_v7();
        let mut view = WorkflowStateView::default();

        view.apply(&span(workflow_id, ops::TASK_REGISTER, "c", Some(1), json!({})));
        view.apply(&span(workflow_id, ops::TASK_ENABLE, "c", Some(1), json!({})));
        view.apply(&span(workflow_id, ops::TASK_COMPLETE, "c", Some(1), json!({})));
        view.apply(&span(workflow_id, ops::TASK_REGISTER, "c", Some(2), json!({})));
        view.apply(&span(workflow_id, ops::TASK_ENABLE, "c", Some(2), json!({})));

        assert_eq!(view.tasks["c"].generation, 2);
        assert_eq!(view.tasks["c"].state, TaskState::Enabled);
    }

    #[test]
    fn test_fold_ignores_unknown_operations() {
        let workflow_id = Uuid::now_v7();
        let mut view = WorkflowStateView::default();
        view.apply(&span(workflow_id, "Engine.completeWorkItem", "x", None, json!({})));
        view.apply(&span(workflow_id, ops::ACTIVITY_ON_ENABLED, "pay", Some(1), json!({})));
        assert_eq!(view, WorkflowStateView::default());
    }
}
