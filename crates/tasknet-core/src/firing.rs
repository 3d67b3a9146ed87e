// Firing engine
//
// Propagates the consequences of one trigger event (a work item finalized, a
// workflow initialized, a sub-workflow finalized) to fixpoint inside the
// open transaction. All propagation runs on one FIFO step queue: join
// evaluation after marking changes, task completion and splits, end-condition
// checks, failure cascades, and parent notification across the workflow
// hierarchy. Queue entries carry the workflow id, so a parent and its
// children share the queue and cross-workflow recursion never nests.
//
// Determinism: condition fan-out is stored ascending by task name and the
// queue is FIFO, so simultaneously satisfied tasks enable in ascending name
// order and spans are written in that order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::audit::{attr, ops};
use crate::context::{ActivityScope, ExecutionContext, RouteContext, SpanInfo};
use crate::definition::{
    ChildRef, InstanceStats, JoinKind, PolicyContext, PolicyDecision, SplitKind, TaskDef,
    WorkflowDefinition,
};
use crate::entities::{
    ExecutionMode, JobState, OperationType, ParentRef, ResourceType, ScheduledJobRow, TaskRow,
    TaskState, WorkItemRow, WorkItemState, WorkflowRow, WorkflowState,
};
use crate::error::{EngineError, Result};
use crate::net::{condition, task, workflow, workitem};
use crate::versions::MigrationAction;

/// Safety valve against runaway propagation (mirrors the event cap of the
/// executor this engine grew out of)
const MAX_STEPS: usize = 10_000;

/// One unit of propagation on the firing queue
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// A condition feeding this task changed; evaluate its join
    EvalJoin { workflow_id: Uuid, task: String },
    /// Finalize the task as completed and apply its split
    CompleteTask {
        workflow_id: Uuid,
        task: String,
        payload: Option<Value>,
        /// Route decided by a migrator during fast-forward replay
        route: Option<String>,
    },
    /// Finalize the task as failed and cascade
    FailTask { workflow_id: Uuid, task: String },
    /// Complete the workflow if its end condition is marked
    CheckEnd { workflow_id: Uuid },
    /// A child workflow finalized; run the parent task's policy
    ParentNotify { child_workflow_id: Uuid },
}

/// Which activity callback to run
#[derive(Debug, Clone, Copy)]
pub(crate) enum Hook {
    Enabled,
    Started,
    Completed,
    Failed,
    Canceled,
}

// ============================================================================
// Driver
// ============================================================================

/// Process steps to fixpoint
pub(crate) async fn drive(ctx: &mut ExecutionContext, initial: Vec<Step>) -> Result<()> {
    let mut queue: VecDeque<Step> = initial.into();
    let mut processed = 0usize;

    while let Some(step) = queue.pop_front() {
        processed += 1;
        if processed > MAX_STEPS {
            return Err(EngineError::Internal(format!(
                "firing did not reach fixpoint within {MAX_STEPS} steps"
            )));
        }
        debug!(?step, "firing step");

        let next = match step {
            Step::EvalJoin { workflow_id, task } => eval_join(ctx, workflow_id, &task).await?,
            Step::CompleteTask {
                workflow_id,
                task,
                payload,
                route,
            } => complete_task(ctx, workflow_id, &task, payload, route).await?,
            Step::FailTask { workflow_id, task } => fail_task(ctx, workflow_id, &task).await?,
            Step::CheckEnd { workflow_id } => check_end(ctx, workflow_id).await?,
            Step::ParentNotify { child_workflow_id } => {
                parent_notify(ctx, child_workflow_id).await?
            }
        };
        queue.extend(next);
    }
    Ok(())
}

// ============================================================================
// Lookups
// ============================================================================

pub(crate) async fn load_workflow(ctx: &mut ExecutionContext, id: Uuid) -> Result<WorkflowRow> {
    ctx.tx()
        .workflow(id)
        .await?
        .ok_or(EngineError::WorkflowNotFound(id))
}

pub(crate) fn definition_of(
    ctx: &ExecutionContext,
    row: &WorkflowRow,
) -> Result<Arc<WorkflowDefinition>> {
    ctx.registry().definition(&row.name, &row.version_name)
}

fn task_def<'d>(def: &'d WorkflowDefinition, workflow_id: Uuid, name: &str) -> Result<&'d TaskDef> {
    def.task(name)
        .ok_or_else(|| EngineError::task_not_found(workflow_id, name))
}

// ============================================================================
// Join evaluation
// ============================================================================

/// Evaluate whether a task's join is satisfied and enable it if so.
/// Idempotent: an already-active task or an unsatisfied join is a no-op.
async fn eval_join(
    ctx: &mut ExecutionContext,
    workflow_id: Uuid,
    task_name: &str,
) -> Result<Vec<Step>> {
    let wf = load_workflow(ctx, workflow_id).await?;
    if wf.state.is_final() {
        return Ok(vec![]);
    }
    let def = definition_of(ctx, &wf)?;
    let td = task_def(&def, workflow_id, task_name)?;

    let current = ctx.tx().latest_task(workflow_id, task_name).await?;
    if current.as_ref().is_some_and(|r| r.state.is_active()) {
        return Ok(vec![]);
    }

    // input markings
    let mut markings: Vec<(String, u32)> = Vec::with_capacity(td.inputs.len());
    for input in &td.inputs {
        let row = ctx
            .tx()
            .condition(workflow_id, input)
            .await?
            .ok_or_else(|| EngineError::condition_not_found(workflow_id, input))?;
        markings.push((input.clone(), row.marking));
    }

    let marked: Vec<String> = markings
        .iter()
        .filter(|(_, m)| *m >= 1)
        .map(|(name, _)| name.clone())
        .collect();

    let to_consume: Vec<String> = match td.join {
        JoinKind::And => {
            if marked.len() < markings.len() || markings.is_empty() {
                return Ok(vec![]);
            }
            marked
        }
        JoinKind::Xor => match marked.len() {
            0 => return Ok(vec![]),
            1 => marked,
            _ => return Err(EngineError::XorJoinAmbiguous(task_name.to_string())),
        },
        JoinKind::Or => {
            if marked.is_empty() {
                return Ok(vec![]);
            }
            let all_markings: BTreeMap<String, u32> = ctx
                .tx()
                .conditions_by_workflow(workflow_id)
                .await?
                .into_iter()
                .map(|c| (c.name, c.marking))
                .collect();
            let mut active_tasks: BTreeSet<String> = BTreeSet::new();
            for state in [TaskState::Enabled, TaskState::Started] {
                for row in ctx.tx().tasks_by_workflow_state(workflow_id, state).await? {
                    active_tasks.insert(row.name);
                }
            }
            if or_join_waits(&def, task_name, &all_markings, &active_tasks) {
                return Ok(vec![]);
            }
            marked
        }
    };

    if to_consume.is_empty() {
        // a task with no input arcs never enables through the net
        return Err(EngineError::AndJoinUnsatisfied(task_name.to_string()));
    }

    let trace_id = ctx.trace_of(&wf).await?;

    // generation row: reuse the pristine disabled row, or register the next
    // generation after a finalized one (loop re-entry)
    let mut row = match current {
        Some(r) if r.state == TaskState::Disabled => r,
        Some(r) if r.state.is_final() => {
            task::register_generation(ctx, workflow_id, trace_id, task_name, r.generation + 1)
                .await?
        }
        Some(_) => return Ok(vec![]),
        None => task::register_generation(ctx, workflow_id, trace_id, task_name, 1).await?,
    };

    let span = ctx.open_span(
        SpanInfo {
            operation: ops::TASK_ENABLE,
            resource_type: ResourceType::Task,
            resource_id: row.id,
            resource_name: task_name,
            workflow_id,
            trace_id,
            task_generation: Some(row.generation),
        },
        OperationType::Mutation,
    );
    for cond in &to_consume {
        condition::decrement(ctx, workflow_id, trace_id, cond, 1).await?;
    }
    task::apply_state(ctx, &mut row, TaskState::Enabled).await?;
    ctx.close_span(
        span,
        json!({
            attr::JOIN_TYPE: td.join.to_string(),
            attr::JOIN_SATISFIED: true,
            attr::INPUT_CONDITIONS: to_consume,
            attr::EXECUTION_MODE: wf.execution_mode.to_string(),
        }),
    )
    .await?;

    let mut steps = Vec::new();
    run_activity(ctx, &wf, trace_id, td, &row, Hook::Enabled, &mut steps).await?;

    if wf.execution_mode == ExecutionMode::FastForward {
        if let Some(more) = replay_task(ctx, &wf, &def, td, &row).await? {
            steps.extend(more);
            return Ok(steps);
        }
    }

    if td.kind.is_dummy() {
        // dummy tasks fire enable-to-complete in one step
        steps.push(Step::CompleteTask {
            workflow_id,
            task: task_name.to_string(),
            payload: None,
            route: None,
        });
    }

    Ok(steps)
}

/// Consult the task migrator during fast-forward replay. Returns `Some`
/// follow-up steps when the migrator decided; `None` falls through to normal
/// handling (dummy auto-completion or waiting enabled).
async fn replay_task(
    ctx: &mut ExecutionContext,
    wf: &WorkflowRow,
    def: &WorkflowDefinition,
    td: &TaskDef,
    row: &TaskRow,
) -> Result<Option<Vec<Step>>> {
    let key = format!("{}/{}", def.name, td.name);
    let (old_workflow_id, migrator) = match &ctx.migration {
        Some(replay) => (
            replay.old_workflow_id,
            match replay.migrators.get(&key) {
                Some(m) => m.clone(),
                None => return Ok(None),
            },
        ),
        None => return Ok(None),
    };

    let old_task = ctx.tx().latest_task(old_workflow_id, &td.name).await?;
    let (old_work_items, old_workflows) = match &old_task {
        Some(old) => {
            let parent = old.parent_ref();
            (
                ctx.tx().work_items_by_parent(&parent, None).await?,
                ctx.tx().workflows_by_parent(&parent).await?,
            )
        }
        None => (vec![], vec![]),
    };

    let scope = crate::versions::MigrationScope {
        new_workflow_id: wf.id,
        task_name: td.name.clone(),
        old_task,
        old_work_items,
        old_workflows,
    };

    let action = migrator
        .migrate(&scope)
        .await
        .map_err(|_| EngineError::MigrationHalted(key))?;

    match action {
        MigrationAction::Continue => Ok(Some(vec![])),
        MigrationAction::FastForward(outcome) => {
            if td.kind.is_composite() && outcome.adopt_children {
                // finalized children of the old generation move under the new one
                for mut child in scope.old_workflows.clone() {
                    if child.state.is_final() {
                        child.parent = Some(row.parent_ref());
                        ctx.tx().update_workflow(&child).await?;
                    }
                }
            }
            Ok(Some(vec![Step::CompleteTask {
                workflow_id: wf.id,
                task: td.name.clone(),
                payload: scope.completed_payload().cloned(),
                route: outcome.route,
            }]))
        }
    }
}

/// OR-join reachability: the join must keep waiting while any of its unmarked
/// input conditions could still receive a token from the currently active
/// marking (marked conditions plus enabled/started tasks). Pure function on
/// the definition graph; the traversal never mutates the sets it iterates.
pub(crate) fn or_join_waits(
    def: &WorkflowDefinition,
    task_name: &str,
    markings: &BTreeMap<String, u32>,
    active_tasks: &BTreeSet<String>,
) -> bool {
    let Some(td) = def.task(task_name) else {
        return true;
    };

    enum Node<'a> {
        Cond(&'a str),
        Task(&'a str),
    }

    let mut queue: VecDeque<Node<'_>> = VecDeque::new();
    let mut visited_conds: BTreeSet<&str> = BTreeSet::new();
    let mut visited_tasks: BTreeSet<&str> = BTreeSet::new();
    // conditions that could still receive a token (outputs of reachable tasks)
    let mut receivable: BTreeSet<&str> = BTreeSet::new();

    for (name, marking) in markings {
        if *marking > 0 && visited_conds.insert(name.as_str()) {
            queue.push_back(Node::Cond(name.as_str()));
        }
    }
    for name in active_tasks {
        if name != task_name && visited_tasks.insert(name.as_str()) {
            queue.push_back(Node::Task(name.as_str()));
        }
    }

    while let Some(node) = queue.pop_front() {
        match node {
            Node::Cond(cond) => {
                for downstream in def.downstream_tasks(cond) {
                    if downstream != task_name && visited_tasks.insert(downstream.as_str()) {
                        queue.push_back(Node::Task(downstream.as_str()));
                    }
                }
            }
            Node::Task(name) => {
                if let Some(task) = def.task(name) {
                    for output in &task.outputs {
                        receivable.insert(output.as_str());
                        if visited_conds.insert(output.as_str()) {
                            queue.push_back(Node::Cond(output.as_str()));
                        }
                    }
                }
            }
        }
    }

    td.inputs.iter().any(|input| {
        markings.get(input).copied().unwrap_or(0) == 0 && receivable.contains(input.as_str())
    })
}

// ============================================================================
// Completion and splits
// ============================================================================

async fn complete_task(
    ctx: &mut ExecutionContext,
    workflow_id: Uuid,
    task_name: &str,
    payload: Option<Value>,
    route_override: Option<String>,
) -> Result<Vec<Step>> {
    let wf = load_workflow(ctx, workflow_id).await?;
    if wf.state.is_final() {
        return Ok(vec![]);
    }
    let def = definition_of(ctx, &wf)?;
    let td = task_def(&def, workflow_id, task_name)?;

    let Some(mut row) = ctx.tx().latest_task(workflow_id, task_name).await? else {
        return Ok(vec![]);
    };
    if !row.state.is_active() {
        return Ok(vec![]);
    }
    let trace_id = ctx.trace_of(&wf).await?;

    // split resolution happens before the transition span opens; routing is
    // user code
    let (outputs_to_mark, route_taken) = match td.split {
        SplitKind::And => (td.outputs.clone(), None),
        SplitKind::Xor => {
            if td.outputs.len() <= 1 {
                (td.outputs.clone(), None)
            } else {
                let choice = match route_override {
                    Some(route) => Some(route),
                    None => {
                        let router = td
                            .router
                            .clone()
                            .ok_or_else(|| EngineError::RouteEmpty(task_name.to_string()))?;
                        router
                            .route(&RouteContext {
                                workflow_id,
                                task_name: task_name.to_string(),
                                generation: row.generation,
                                payload: payload.clone(),
                            })
                            .await?
                    }
                };
                let choice =
                    choice.ok_or_else(|| EngineError::RouteEmpty(task_name.to_string()))?;
                if !td.outputs.contains(&choice) {
                    return Err(EngineError::condition_not_found(workflow_id, choice));
                }
                (vec![choice.clone()], Some(choice))
            }
        }
    };

    let span = ctx.open_span(
        SpanInfo {
            operation: ops::TASK_COMPLETE,
            resource_type: ResourceType::Task,
            resource_id: row.id,
            resource_name: task_name,
            workflow_id,
            trace_id,
            task_generation: Some(row.generation),
        },
        OperationType::Mutation,
    );

    // instances forced to finalize alongside the task are canceled
    cancel_open_work_items(ctx, trace_id, &row.parent_ref()).await?;
    cancel_pending_jobs(ctx, &row.parent_ref()).await?;

    task::apply_state(ctx, &mut row, TaskState::Completed).await?;
    for cond in &outputs_to_mark {
        condition::increment(ctx, workflow_id, trace_id, cond, 1).await?;
    }

    let mut attrs = json!({
        attr::SPLIT_TYPE: td.split.to_string(),
        attr::OUTPUT_CONDITIONS: outputs_to_mark,
    });
    if let Some(route) = &route_taken {
        attrs[attr::ROUTE] = json!(route);
    }
    ctx.close_span(span, attrs).await?;

    let mut steps = Vec::new();
    run_activity(ctx, &wf, trace_id, td, &row, Hook::Completed, &mut steps).await?;

    // simultaneously satisfied tasks enable in ascending task-name order
    let mut downstream: BTreeSet<&String> = BTreeSet::new();
    for cond in &outputs_to_mark {
        downstream.extend(def.downstream_tasks(cond));
    }
    for name in downstream {
        steps.push(Step::EvalJoin {
            workflow_id,
            task: name.clone(),
        });
    }
    // tokens that arrived on this task's inputs while it was active are
    // only visible now; re-entry through the loop registers a new generation
    steps.push(Step::EvalJoin {
        workflow_id,
        task: task_name.to_string(),
    });
    // an OR join elsewhere may become ready once this task left the active set
    for (name, other) in &def.tasks {
        if other.join == JoinKind::Or && name != task_name {
            steps.push(Step::EvalJoin {
                workflow_id,
                task: name.clone(),
            });
        }
    }
    steps.push(Step::CheckEnd { workflow_id });

    Ok(steps)
}

async fn check_end(ctx: &mut ExecutionContext, workflow_id: Uuid) -> Result<Vec<Step>> {
    let mut wf = load_workflow(ctx, workflow_id).await?;
    if wf.state.is_final() {
        return Ok(vec![]);
    }
    let def = definition_of(ctx, &wf)?;
    let end = ctx
        .tx()
        .condition(workflow_id, &def.end)
        .await?
        .ok_or_else(|| EngineError::condition_not_found(workflow_id, &def.end))?;
    if end.marking == 0 {
        return Ok(vec![]);
    }

    let trace_id = ctx.trace_of(&wf).await?;
    workflow::apply_state(ctx, &mut wf, WorkflowState::Completed).await?;
    ctx.write_span(
        SpanInfo {
            operation: ops::WORKFLOW_COMPLETE,
            resource_type: ResourceType::Workflow,
            resource_id: wf.id,
            resource_name: &wf.name,
            workflow_id,
            trace_id,
            task_generation: None,
        },
        json!({}),
    )
    .await?;

    if wf.parent.is_some() {
        Ok(vec![Step::ParentNotify {
            child_workflow_id: workflow_id,
        }])
    } else {
        Ok(vec![])
    }
}

// ============================================================================
// Failure and cancellation
// ============================================================================

async fn fail_task(
    ctx: &mut ExecutionContext,
    workflow_id: Uuid,
    task_name: &str,
) -> Result<Vec<Step>> {
    let wf = load_workflow(ctx, workflow_id).await?;
    if wf.state.is_final() {
        return Ok(vec![]);
    }
    let def = definition_of(ctx, &wf)?;
    let td = task_def(&def, workflow_id, task_name)?;

    let Some(mut row) = ctx.tx().latest_task(workflow_id, task_name).await? else {
        return Ok(vec![]);
    };
    if !row.state.is_active() {
        return Ok(vec![]);
    }
    let trace_id = ctx.trace_of(&wf).await?;

    let span = ctx.open_span(
        SpanInfo {
            operation: ops::TASK_FAIL,
            resource_type: ResourceType::Task,
            resource_id: row.id,
            resource_name: task_name,
            workflow_id,
            trace_id,
            task_generation: Some(row.generation),
        },
        OperationType::Mutation,
    );
    cancel_open_work_items(ctx, trace_id, &row.parent_ref()).await?;
    cancel_pending_jobs(ctx, &row.parent_ref()).await?;
    task::apply_state(ctx, &mut row, TaskState::Failed).await?;
    ctx.close_span(span, json!({})).await?;

    let mut steps = Vec::new();
    run_activity(ctx, &wf, trace_id, td, &row, Hook::Failed, &mut steps).await?;

    // default failure policy: the workflow fails, canceling everything else
    steps.extend(
        finalize_workflow_cascade(ctx, workflow_id, WorkflowState::Failed, "task_failed", true)
            .await?,
    );
    Ok(steps)
}

/// Finalize a workflow as failed or canceled, cascading depth-first: every
/// non-finalized descendant workflow is canceled (children before parents),
/// then the workflow's own tasks, then the workflow row itself.
pub(crate) async fn finalize_workflow_cascade(
    ctx: &mut ExecutionContext,
    workflow_id: Uuid,
    final_state: WorkflowState,
    reason: &str,
    invoke_callbacks: bool,
) -> Result<Vec<Step>> {
    let mut wf = load_workflow(ctx, workflow_id).await?;
    if wf.state.is_final() {
        return Ok(vec![]);
    }

    // collect the descendant tree, parents first
    let mut order: Vec<Uuid> = Vec::new();
    let mut queue: VecDeque<Uuid> = VecDeque::from([workflow_id]);
    while let Some(id) = queue.pop_front() {
        for child in ctx.tx().workflows_by_parent_workflow(id).await? {
            if !child.state.is_final() {
                order.push(child.id);
                queue.push_back(child.id);
            }
        }
    }

    // cancel children before parents
    for id in order.into_iter().rev() {
        let mut row = load_workflow(ctx, id).await?;
        if row.state.is_final() {
            continue;
        }
        let trace_id = ctx.trace_of(&row).await?;
        let span = ctx.open_span(
            SpanInfo {
                operation: ops::WORKFLOW_CANCEL,
                resource_type: ResourceType::Workflow,
                resource_id: row.id,
                resource_name: &row.name,
                workflow_id: row.id,
                trace_id,
                task_generation: None,
            },
            OperationType::Mutation,
        );
        cancel_active_tasks(ctx, &row, trace_id, invoke_callbacks).await?;
        workflow::apply_state(ctx, &mut row, WorkflowState::Canceled).await?;
        ctx.close_span(span, json!({ attr::REASON: reason })).await?;
    }

    let trace_id = ctx.trace_of(&wf).await?;
    let span = ctx.open_span(
        SpanInfo {
            operation: workflow::operation_for(final_state),
            resource_type: ResourceType::Workflow,
            resource_id: wf.id,
            resource_name: &wf.name,
            workflow_id,
            trace_id,
            task_generation: None,
        },
        OperationType::Mutation,
    );
    cancel_active_tasks(ctx, &wf, trace_id, invoke_callbacks).await?;
    workflow::apply_state(ctx, &mut wf, final_state).await?;
    ctx.close_span(span, json!({ attr::REASON: reason })).await?;

    if wf.parent.is_some() {
        Ok(vec![Step::ParentNotify {
            child_workflow_id: workflow_id,
        }])
    } else {
        Ok(vec![])
    }
}

/// Cancel every enabled/started task of a workflow. Descendant workflows are
/// the cascade walk's responsibility, not this function's.
async fn cancel_active_tasks(
    ctx: &mut ExecutionContext,
    wf: &WorkflowRow,
    trace_id: Uuid,
    invoke_callbacks: bool,
) -> Result<()> {
    let def = definition_of(ctx, wf)?;
    let mut rows: Vec<TaskRow> = Vec::new();
    for state in [TaskState::Enabled, TaskState::Started] {
        rows.extend(ctx.tx().tasks_by_workflow_state(wf.id, state).await?);
    }
    rows.sort_by(|a, b| a.name.cmp(&b.name));

    for mut row in rows {
        let span = ctx.open_span(
            SpanInfo {
                operation: ops::TASK_CANCEL,
                resource_type: ResourceType::Task,
                resource_id: row.id,
                resource_name: &row.name,
                workflow_id: wf.id,
                trace_id,
                task_generation: Some(row.generation),
            },
            OperationType::Mutation,
        );
        cancel_open_work_items(ctx, trace_id, &row.parent_ref()).await?;
        cancel_pending_jobs(ctx, &row.parent_ref()).await?;
        task::apply_state(ctx, &mut row, TaskState::Canceled).await?;
        ctx.close_span(span, json!({})).await?;

        if invoke_callbacks {
            if let Some(td) = def.task(&row.name) {
                let mut steps = Vec::new();
                run_activity(ctx, wf, trace_id, td, &row, Hook::Canceled, &mut steps).await?;
                // intents registered by a canceled generation are dead on
                // arrival; the generation guard rejects them at run time
            }
        }
    }
    Ok(())
}

async fn cancel_open_work_items(
    ctx: &mut ExecutionContext,
    trace_id: Uuid,
    parent: &ParentRef,
) -> Result<()> {
    for mut item in ctx.tx().work_items_by_parent(parent, None).await? {
        if !item.state.is_final() {
            workitem::transition(
                ctx,
                trace_id,
                &mut item,
                WorkItemState::Canceled,
                json!({ attr::REASON: "task_finalized" }),
            )
            .await?;
        }
    }
    Ok(())
}

/// Scheduled jobs registered by a task generation die with it
async fn cancel_pending_jobs(ctx: &mut ExecutionContext, parent: &ParentRef) -> Result<()> {
    for mut job in ctx.tx().jobs_by_parent(parent).await? {
        if job.state == JobState::Pending {
            job.state = JobState::Canceled;
            ctx.tx().update_job(&job).await?;
        }
    }
    Ok(())
}

// ============================================================================
// Instance finalization policies
// ============================================================================

fn work_item_stats(items: &[WorkItemRow]) -> InstanceStats {
    let mut stats = InstanceStats {
        total: items.len(),
        ..Default::default()
    };
    for item in items {
        match item.state {
            WorkItemState::Completed => stats.completed += 1,
            WorkItemState::Failed => stats.failed += 1,
            WorkItemState::Canceled => stats.canceled += 1,
            WorkItemState::Initialized | WorkItemState::Started => stats.active += 1,
        }
    }
    stats
}

fn workflow_stats(rows: &[WorkflowRow]) -> InstanceStats {
    let mut stats = InstanceStats {
        total: rows.len(),
        ..Default::default()
    };
    for row in rows {
        match row.state {
            WorkflowState::Completed => stats.completed += 1,
            WorkflowState::Failed => stats.failed += 1,
            WorkflowState::Canceled => stats.canceled += 1,
            WorkflowState::Initialized | WorkflowState::Started => stats.active += 1,
        }
    }
    stats
}

/// A work item of `parent` finalized; ask the task's policy what follows.
/// Stale generations (superseded or finalized tasks) are ignored.
pub(crate) async fn work_item_finalized(
    ctx: &mut ExecutionContext,
    parent: &ParentRef,
    payload: Option<Value>,
) -> Result<Vec<Step>> {
    let wf = load_workflow(ctx, parent.workflow_id).await?;
    if wf.state.is_final() {
        return Ok(vec![]);
    }
    let def = definition_of(ctx, &wf)?;
    let td = task_def(&def, parent.workflow_id, &parent.task_name)?;

    let Some(latest) = ctx
        .tx()
        .latest_task(parent.workflow_id, &parent.task_name)
        .await?
    else {
        return Ok(vec![]);
    };
    if latest.generation != parent.task_generation || !latest.state.is_active() {
        return Ok(vec![]);
    }

    let items = ctx.tx().work_items_by_parent(parent, None).await?;
    let stats = work_item_stats(&items);
    let policy_ctx = PolicyContext {
        task_name: parent.task_name.clone(),
        generation: parent.task_generation,
        stats,
        work_items: items,
        workflows: vec![],
    };

    match td.activities.policy(&policy_ctx).await? {
        PolicyDecision::Continue => Ok(vec![]),
        PolicyDecision::Complete => Ok(vec![Step::CompleteTask {
            workflow_id: parent.workflow_id,
            task: parent.task_name.clone(),
            payload,
            route: None,
        }]),
        PolicyDecision::Fail => Ok(vec![Step::FailTask {
            workflow_id: parent.workflow_id,
            task: parent.task_name.clone(),
        }]),
    }
}

/// A child workflow finalized; run the parent composite task's policy
async fn parent_notify(ctx: &mut ExecutionContext, child_workflow_id: Uuid) -> Result<Vec<Step>> {
    let child = load_workflow(ctx, child_workflow_id).await?;
    let Some(parent) = child.parent.clone() else {
        return Ok(vec![]);
    };

    let parent_wf = load_workflow(ctx, parent.workflow_id).await?;
    if parent_wf.state.is_final() {
        return Ok(vec![]);
    }
    let def = definition_of(ctx, &parent_wf)?;
    let td = task_def(&def, parent.workflow_id, &parent.task_name)?;

    let Some(latest) = ctx
        .tx()
        .latest_task(parent.workflow_id, &parent.task_name)
        .await?
    else {
        return Ok(vec![]);
    };
    if latest.generation != parent.task_generation || !latest.state.is_active() {
        return Ok(vec![]);
    }

    let siblings = ctx.tx().workflows_by_parent(&parent).await?;
    let stats = workflow_stats(&siblings);
    let policy_ctx = PolicyContext {
        task_name: parent.task_name.clone(),
        generation: parent.task_generation,
        stats,
        work_items: vec![],
        workflows: siblings.clone(),
    };

    match td.activities.policy(&policy_ctx).await? {
        PolicyDecision::Continue => Ok(vec![]),
        PolicyDecision::Complete => {
            let mut steps = Vec::new();
            // remaining children are forced to finalize
            for sibling in siblings {
                if !sibling.state.is_final() {
                    steps.extend(
                        finalize_workflow_cascade(
                            ctx,
                            sibling.id,
                            WorkflowState::Canceled,
                            "parent_task_completed",
                            true,
                        )
                        .await?,
                    );
                }
            }
            steps.push(Step::CompleteTask {
                workflow_id: parent.workflow_id,
                task: parent.task_name.clone(),
                payload: None,
                route: None,
            });
            Ok(steps)
        }
        PolicyDecision::Fail => Ok(vec![Step::FailTask {
            workflow_id: parent.workflow_id,
            task: parent.task_name.clone(),
        }]),
    }
}

// ============================================================================
// Activities and intents
// ============================================================================

/// Run one activity callback and apply the side effects it registered
pub(crate) async fn run_activity(
    ctx: &mut ExecutionContext,
    wf: &WorkflowRow,
    trace_id: Uuid,
    td: &TaskDef,
    row: &TaskRow,
    hook: Hook,
    steps: &mut Vec<Step>,
) -> Result<()> {
    let activities = td.activities.clone();
    let mut scope = ActivityScope::new(ctx, wf.id, &row.name, row.generation, wf.execution_mode);
    match hook {
        Hook::Enabled => activities.on_enabled(&mut scope).await?,
        Hook::Started => activities.on_started(&mut scope).await?,
        Hook::Completed => activities.on_completed(&mut scope).await?,
        Hook::Failed => activities.on_failed(&mut scope).await?,
        Hook::Canceled => activities.on_canceled(&mut scope).await?,
    }
    let intents = scope.into_intents();

    let operation = match hook {
        Hook::Enabled => ops::ACTIVITY_ON_ENABLED,
        Hook::Started => ops::ACTIVITY_ON_STARTED,
        Hook::Completed => ops::ACTIVITY_ON_COMPLETED,
        Hook::Failed => ops::ACTIVITY_ON_FAILED,
        Hook::Canceled => ops::ACTIVITY_ON_CANCELED,
    };
    ctx.write_span(
        SpanInfo {
            operation,
            resource_type: ResourceType::WorkflowActivity,
            resource_id: row.id,
            resource_name: &row.name,
            workflow_id: wf.id,
            trace_id,
            task_generation: Some(row.generation),
        },
        json!({ attr::EXECUTION_MODE: wf.execution_mode.to_string() }),
    )
    .await?;

    process_intents(ctx, wf, trace_id, td, row, intents, steps).await
}

/// Apply the side effects a callback registered on its scope
pub(crate) async fn process_intents(
    ctx: &mut ExecutionContext,
    wf: &WorkflowRow,
    trace_id: Uuid,
    td: &TaskDef,
    row: &TaskRow,
    intents: Vec<crate::context::Intent>,
    steps: &mut Vec<Step>,
) -> Result<()> {
    use crate::context::Intent;

    for intent in intents {
        match intent {
            Intent::WorkItem { payload } => {
                workitem::initialize(ctx, trace_id, row.parent_ref(), payload).await?;
            }
            Intent::ChildWorkflow {
                child_name,
                payload,
            } => {
                let child = td
                    .kind
                    .children()
                    .iter()
                    .find(|c| c.name == child_name)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownDefinition(child_name.clone()))?;
                steps.extend(initialize_child_workflow(ctx, wf, row, &child, payload).await?);
            }
            Intent::Job { run_at, spec } => {
                let created_at = ctx.now();
                ctx.tx()
                    .insert_job(ScheduledJobRow {
                        id: Uuid::now_v7(),
                        parent: row.parent_ref(),
                        run_at,
                        spec,
                        state: JobState::Pending,
                        created_at,
                    })
                    .await?;
            }
        }
    }
    Ok(())
}

/// Create a child workflow under a composite task generation
pub(crate) async fn initialize_child_workflow(
    ctx: &mut ExecutionContext,
    parent_wf: &WorkflowRow,
    task_row: &TaskRow,
    child: &ChildRef,
    payload: Option<Value>,
) -> Result<Vec<Step>> {
    let (version_name, def) = ctx.registry().resolve_child(child)?;
    let payload = match payload {
        Some(p) => Some(def.initialize_validator.validate(&p)?),
        None => None,
    };

    let row = WorkflowRow {
        id: Uuid::now_v7(),
        name: def.name.clone(),
        version_name,
        parent: Some(task_row.parent_ref()),
        state: WorkflowState::Initialized,
        execution_mode: parent_wf.execution_mode,
        migration_from_workflow_id: None,
        payload,
        created_at: ctx.now(),
        finalized_at: None,
    };

    let trace_id = ctx.trace_of(parent_wf).await?;
    let child_id = row.id;
    let downstream = workflow::create(ctx, &def, row, trace_id).await?;

    Ok(downstream
        .into_iter()
        .map(|task| Step::EvalJoin {
            workflow_id: child_id,
            task,
        })
        .collect())
}
