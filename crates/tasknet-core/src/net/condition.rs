// Condition marking arithmetic
//
// Every marking change writes one span carrying oldMarking/newMarking/delta.
// Markings never go below zero; an attempted underflow is a defect surfaced
// as MarkingUnderflow, which aborts the transaction.

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{marking_attrs, ops};
use crate::context::{ExecutionContext, SpanInfo};
use crate::entities::ResourceType;
use crate::error::{EngineError, Result};

/// Increment a condition's marking by `delta` tokens
pub(crate) async fn increment(
    ctx: &mut ExecutionContext,
    workflow_id: Uuid,
    trace_id: Uuid,
    name: &str,
    delta: u32,
) -> Result<u32> {
    change(ctx, workflow_id, trace_id, name, delta as i64, ops::CONDITION_INCREMENT).await
}

/// Decrement a condition's marking by `delta` tokens
pub(crate) async fn decrement(
    ctx: &mut ExecutionContext,
    workflow_id: Uuid,
    trace_id: Uuid,
    name: &str,
    delta: u32,
) -> Result<u32> {
    change(ctx, workflow_id, trace_id, name, -(delta as i64), ops::CONDITION_DECREMENT).await
}

async fn change(
    ctx: &mut ExecutionContext,
    workflow_id: Uuid,
    trace_id: Uuid,
    name: &str,
    delta: i64,
    operation: &str,
) -> Result<u32> {
    let mut row = ctx
        .tx()
        .condition(workflow_id, name)
        .await?
        .ok_or_else(|| EngineError::condition_not_found(workflow_id, name))?;

    let old_marking = row.marking;
    let new_marking = old_marking as i64 + delta;
    if new_marking < 0 {
        return Err(EngineError::MarkingUnderflow {
            workflow_id,
            condition: name.to_string(),
        });
    }
    row.marking = new_marking as u32;
    ctx.tx().update_condition(&row).await?;
    debug!(
        %workflow_id,
        condition = name,
        old_marking,
        new_marking = row.marking,
        "marking changed"
    );

    let attrs: Value = marking_attrs(old_marking, row.marking, delta);
    ctx.write_span(
        SpanInfo {
            operation,
            resource_type: ResourceType::Condition,
            resource_id: row.id,
            resource_name: name,
            workflow_id,
            trace_id,
            task_generation: None,
        },
        attrs,
    )
    .await?;

    Ok(row.marking)
}
