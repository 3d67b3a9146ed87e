// Work item lifecycle
//
// Work items are bound to exactly one task generation; finalized items are
// immutable. Each transition writes one span under whatever span the caller
// currently has open.

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::audit::{attr, ops};
use crate::context::{ExecutionContext, SpanInfo};
use crate::entities::{ParentRef, ResourceType, WorkItemRow, WorkItemState};
use crate::error::Result;

/// Create a work item in `initialized` state under a task generation
pub(crate) async fn initialize(
    ctx: &mut ExecutionContext,
    trace_id: Uuid,
    parent: ParentRef,
    payload: Option<Value>,
) -> Result<WorkItemRow> {
    let row = WorkItemRow {
        id: Uuid::now_v7(),
        parent,
        state: WorkItemState::Initialized,
        payload,
        created_at: ctx.now(),
        finalized_at: None,
    };
    ctx.tx().insert_work_item(row.clone()).await?;
    debug!(
        work_item_id = %row.id,
        workflow_id = %row.parent.workflow_id,
        task = %row.parent.task_name,
        generation = row.parent.task_generation,
        "work item initialized"
    );

    ctx.write_span(
        SpanInfo {
            operation: ops::WORK_ITEM_INITIALIZE,
            resource_type: ResourceType::WorkItem,
            resource_id: row.id,
            resource_name: &row.parent.task_name,
            workflow_id: row.parent.workflow_id,
            trace_id,
            task_generation: Some(row.parent.task_generation),
        },
        json!({ attr::TASK_NAME: row.parent.task_name }),
    )
    .await?;

    Ok(row)
}

/// Apply a transition to a work item, writing its span. State guards live at
/// the call sites (the facade rejects transitions from finalized states).
pub(crate) async fn transition(
    ctx: &mut ExecutionContext,
    trace_id: Uuid,
    row: &mut WorkItemRow,
    state: WorkItemState,
    attributes: Value,
) -> Result<()> {
    row.state = state;
    if state.is_final() {
        row.finalized_at = Some(ctx.now());
    }
    ctx.tx().update_work_item(row).await?;
    debug!(
        work_item_id = %row.id,
        task = %row.parent.task_name,
        state = %state,
        "work item state applied"
    );

    let operation = match state {
        WorkItemState::Initialized => ops::WORK_ITEM_RESET,
        WorkItemState::Started => ops::WORK_ITEM_START,
        WorkItemState::Completed => ops::WORK_ITEM_COMPLETE,
        WorkItemState::Failed => ops::WORK_ITEM_FAIL,
        WorkItemState::Canceled => ops::WORK_ITEM_CANCEL,
    };

    ctx.write_span(
        SpanInfo {
            operation,
            resource_type: ResourceType::WorkItem,
            resource_id: row.id,
            resource_name: &row.parent.task_name,
            workflow_id: row.parent.workflow_id,
            trace_id,
            task_generation: Some(row.parent.task_generation),
        },
        attributes,
    )
    .await?;

    Ok(())
}
