// Task generation rows and state application
//
// A task's identity within a workflow is (name, generation). Generation 1 is
// registered at workflow initialize; re-entry registers generation + 1. At
// most one row per (workflow, name) is ever non-finalized. State application
// here writes the row and the append-only state log; the firing engine owns
// the transition spans so it can group nested marking changes under them.

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{attr, ops};
use crate::context::{ExecutionContext, SpanInfo};
use crate::entities::{ResourceType, TaskRow, TaskState, TaskStateLogRow};
use crate::error::Result;

/// Insert a fresh generation row in `disabled` state
pub(crate) async fn register_generation(
    ctx: &mut ExecutionContext,
    workflow_id: Uuid,
    trace_id: Uuid,
    name: &str,
    generation: u32,
) -> Result<TaskRow> {
    let row = TaskRow {
        id: Uuid::now_v7(),
        workflow_id,
        name: name.to_string(),
        generation,
        state: TaskState::Disabled,
        created_at: ctx.now(),
    };
    ctx.tx().insert_task(row.clone()).await?;
    debug!(%workflow_id, task = name, generation, "registered task generation");
    ctx.tx()
        .append_task_state_log(TaskStateLogRow {
            workflow_id,
            task_name: name.to_string(),
            generation,
            state: TaskState::Disabled,
            created_at: row.created_at,
        })
        .await?;

    ctx.write_span(
        SpanInfo {
            operation: ops::TASK_REGISTER,
            resource_type: ResourceType::Task,
            resource_id: row.id,
            resource_name: name,
            workflow_id,
            trace_id,
            task_generation: Some(generation),
        },
        json!({ attr::GENERATION: generation }),
    )
    .await?;

    Ok(row)
}

/// Apply a state to the row and append the state log. Callers write the
/// transition span themselves.
pub(crate) async fn apply_state(
    ctx: &mut ExecutionContext,
    row: &mut TaskRow,
    state: TaskState,
) -> Result<()> {
    row.state = state;
    ctx.tx().update_task(row).await?;
    debug!(
        workflow_id = %row.workflow_id,
        task = %row.name,
        generation = row.generation,
        state = %state,
        "task state applied"
    );
    let created_at = ctx.now();
    ctx.tx()
        .append_task_state_log(TaskStateLogRow {
            workflow_id: row.workflow_id,
            task_name: row.name.clone(),
            generation: row.generation,
            state,
            created_at,
        })
        .await?;
    Ok(())
}
