// Workflow row lifecycle
//
// Initialization materializes the whole net: the workflow row, one condition
// row per place (marking 0), one generation-1 task row per task (disabled),
// then exactly one token on the start condition. All of it is grouped under
// the Workflow.initialize span. State application mirrors net::task: row +
// state log here, transition spans at the call site.

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{attr, ops};
use crate::context::{ExecutionContext, SpanInfo};
use crate::definition::WorkflowDefinition;
use crate::entities::{
    ConditionRow, OperationType, ResourceType, WorkflowRow, WorkflowState, WorkflowStateLogRow,
};
use crate::error::{EngineError, Result};
use crate::net::{condition, task};

/// Materialize a workflow instance from its definition. Returns the task
/// names downstream of the start condition, which the caller feeds to the
/// firing engine.
pub(crate) async fn create(
    ctx: &mut ExecutionContext,
    def: &WorkflowDefinition,
    row: WorkflowRow,
    trace_id: Uuid,
) -> Result<Vec<String>> {
    ctx.tx().insert_workflow(row.clone()).await?;
    ctx.tx()
        .append_workflow_state_log(WorkflowStateLogRow {
            workflow_id: row.id,
            state: WorkflowState::Initialized,
            created_at: row.created_at,
        })
        .await?;

    let mut attrs = json!({
        attr::VERSION_NAME: row.version_name,
        attr::EXECUTION_MODE: row.execution_mode.to_string(),
    });
    if let Some(from) = row.migration_from_workflow_id {
        attrs[attr::MIGRATION_FROM_WORKFLOW_ID] = json!(from.to_string());
    }
    if let Some(parent) = &row.parent {
        attrs[attr::TASK_NAME] = json!(parent.task_name);
    }

    let span = ctx.open_span(
        SpanInfo {
            operation: ops::WORKFLOW_INITIALIZE,
            resource_type: ResourceType::Workflow,
            resource_id: row.id,
            resource_name: &def.name,
            workflow_id: row.id,
            trace_id,
            task_generation: None,
        },
        OperationType::Mutation,
    );

    for cond in def.conditions.values() {
        let created_at = ctx.now();
        ctx.tx()
            .insert_condition(ConditionRow {
                id: Uuid::now_v7(),
                workflow_id: row.id,
                name: cond.name.clone(),
                kind: cond.kind,
                marking: 0,
                created_at,
            })
            .await?;
    }

    for name in def.tasks.keys() {
        task::register_generation(ctx, row.id, trace_id, name, 1).await?;
    }

    // the start condition is incremented exactly once, here
    condition::increment(ctx, row.id, trace_id, &def.start, 1).await?;

    ctx.close_span(span, attrs).await?;
    debug!(
        workflow_id = %row.id,
        name = %def.name,
        version = %row.version_name,
        mode = %row.execution_mode,
        "workflow rows materialized"
    );

    Ok(def.downstream_tasks(&def.start).to_vec())
}

/// Apply a state to the workflow row and append the state log
pub(crate) async fn apply_state(
    ctx: &mut ExecutionContext,
    row: &mut WorkflowRow,
    state: WorkflowState,
) -> Result<()> {
    row.state = state;
    if state.is_final() {
        row.finalized_at = Some(ctx.now());
    }
    ctx.tx().update_workflow(row).await?;
    debug!(workflow_id = %row.id, state = %state, "workflow state applied");
    let created_at = ctx.now();
    ctx.tx()
        .append_workflow_state_log(WorkflowStateLogRow {
            workflow_id: row.id,
            state,
            created_at,
        })
        .await?;
    Ok(())
}

/// Span operation name for a workflow state
pub(crate) fn operation_for(state: WorkflowState) -> &'static str {
    match state {
        WorkflowState::Initialized => ops::WORKFLOW_INITIALIZE,
        WorkflowState::Started => ops::WORKFLOW_START,
        WorkflowState::Completed => ops::WORKFLOW_COMPLETE,
        WorkflowState::Failed => ops::WORKFLOW_FAIL,
        WorkflowState::Canceled => ops::WORKFLOW_CANCEL,
    }
}

/// Mark a workflow and its initialized ancestors `started`. Fired when the
/// first work item (or a descendant workflow) enters `started`.
pub(crate) async fn mark_started_chain(
    ctx: &mut ExecutionContext,
    workflow_id: Uuid,
) -> Result<()> {
    let mut current_id = Some(workflow_id);
    while let Some(id) = current_id {
        let mut row = ctx
            .tx()
            .workflow(id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(id))?;
        if row.state != WorkflowState::Initialized {
            break;
        }
        let trace_id = ctx.trace_of(&row).await?;
        apply_state(ctx, &mut row, WorkflowState::Started).await?;
        ctx.write_span(
            SpanInfo {
                operation: ops::WORKFLOW_START,
                resource_type: ResourceType::Workflow,
                resource_id: row.id,
                resource_name: &row.name,
                workflow_id: row.id,
                trace_id,
                task_generation: None,
            },
            json!({}),
        )
        .await?;
        current_id = row.parent.as_ref().map(|p| p.workflow_id);
    }
    Ok(())
}
