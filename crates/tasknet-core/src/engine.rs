// Public API facade
//
// Every mutation entry point runs as one serialized store transaction: open
// a context, write the root audit span (the API call), apply the local
// transition, let the firing engine propagate to fixpoint, close the span,
// commit. Errors abort the transaction; nothing is committed and no
// scheduled jobs leak.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::audit::{self, WorkflowStateView};
use crate::context::{ActivityScope, Clock, ExecutionContext, SpanInfo, SystemClock};
use crate::entities::{
    AuditSpanRow, ExecutionMode, JobSpec, JobState, OperationType, ResourceType, ScheduledJobRow,
    TaskRow, TaskState, WorkItemRow, WorkItemState, WorkflowRow, WorkflowState,
};
use crate::error::{EngineError, Result};
use crate::firing::{self, Hook, Step};
use crate::net::{task, workflow, workitem};
use crate::store::Store;
use crate::versions::Registry;

// ============================================================================
// Targets
// ============================================================================

/// Addresses the task generation a work item is initialized under. `path` is
/// the ordered list of names from the root definition down to the target and
/// is checked against the resolved task when present.
#[derive(Debug, Clone)]
pub struct WorkItemTarget {
    pub path: Vec<String>,
    pub parent_workflow_id: Uuid,
    pub parent_task_name: String,
}

/// Addresses the composite task generation a child workflow is initialized
/// under. `child_name` picks the candidate definition; it may be omitted when
/// the task has exactly one.
#[derive(Debug, Clone)]
pub struct ChildWorkflowTarget {
    pub path: Vec<String>,
    pub parent_workflow_id: Uuid,
    pub parent_task_name: String,
    pub child_name: Option<String>,
}

/// Result of draining one scheduled job
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub status: JobRunStatus,
}

/// How a drained job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRunStatus {
    Done,
    /// The job's task generation is no longer current; the job was canceled
    StaleGeneration,
    /// The job's transaction rolled back; the job was canceled with the code
    Failed(String),
}

// ============================================================================
// Engine
// ============================================================================

/// The workflow engine facade. Holds the store, the definition registry, and
/// the clock; all state lives in the store.
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    span_seq: Arc<AtomicI64>,
    span_seq_ready: AtomicBool,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn Store>, registry: Registry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            clock: Arc::new(SystemClock),
            span_seq: Arc::new(AtomicI64::new(0)),
            span_seq_ready: AtomicBool::new(false),
        }
    }

    /// Swap the time source (tests use a manually advanced clock)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) async fn begin(&self) -> Result<ExecutionContext> {
        let mut tx = self.store.begin().await?;
        // seed the sequence counter from the audit log once, so ordering
        // survives engine restarts
        if !self.span_seq_ready.load(Ordering::SeqCst) {
            let max = tx.max_span_sequence().await?;
            self.span_seq.fetch_max(max + 1, Ordering::SeqCst);
            self.span_seq_ready.store(true, Ordering::SeqCst);
        }
        Ok(ExecutionContext::new(
            tx,
            self.clock.clone(),
            self.registry.clone(),
            self.span_seq.clone(),
        ))
    }

    // =========================================================================
    // Root workflow lifecycle
    // =========================================================================

    /// Initialize a new root workflow instance. `version_name = None` runs
    /// the latest registered version.
    #[instrument(skip(self, payload))]
    pub async fn initialize_root_workflow(
        &self,
        workflow_name: &str,
        version_name: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Uuid> {
        let mut ctx = self.begin().await?;
        let workflow_id = Uuid::now_v7();

        let root = ctx.open_span(
            SpanInfo {
                operation: "initializeRootWorkflow",
                resource_type: ResourceType::Workflow,
                resource_id: workflow_id,
                resource_name: workflow_name,
                workflow_id,
                trace_id: workflow_id,
                task_generation: None,
            },
            OperationType::Mutation,
        );
        let (_row, steps) = Self::create_root_in(
            &mut ctx,
            workflow_id,
            workflow_name,
            version_name,
            payload,
            ExecutionMode::Normal,
            None,
        )
        .await?;
        firing::drive(&mut ctx, steps).await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;

        info!(%workflow_id, workflow_name, "initialized root workflow");
        Ok(workflow_id)
    }

    /// Create the root workflow rows inside an open context. Used by the
    /// public entry point and by the migration runner (fast-forward mode).
    pub(crate) async fn create_root_in(
        ctx: &mut ExecutionContext,
        workflow_id: Uuid,
        workflow_name: &str,
        version_name: Option<&str>,
        payload: Option<Value>,
        execution_mode: ExecutionMode,
        migration_from_workflow_id: Option<Uuid>,
    ) -> Result<(WorkflowRow, Vec<Step>)> {
        let (version_name, def) = {
            let manager = ctx.registry().manager(workflow_name)?;
            match version_name {
                Some(version) => (version.to_string(), manager.definition(version)?),
                None => {
                    let (version, def) = manager.latest()?;
                    (version.to_string(), def)
                }
            }
        };

        let payload = match payload {
            Some(p) => Some(def.initialize_validator.validate(&p)?),
            None => None,
        };

        let row = WorkflowRow {
            id: workflow_id,
            name: def.name.clone(),
            version_name,
            parent: None,
            state: WorkflowState::Initialized,
            execution_mode,
            migration_from_workflow_id,
            payload,
            created_at: ctx.now(),
            finalized_at: None,
        };

        let downstream = workflow::create(ctx, &def, row.clone(), workflow_id).await?;
        let steps = downstream
            .into_iter()
            .map(|task| Step::EvalJoin { workflow_id, task })
            .collect();
        Ok((row, steps))
    }

    /// Cancel a root workflow, cascading through every descendant workflow,
    /// task, work item, and scheduled job.
    #[instrument(skip(self, payload))]
    pub async fn cancel_root_workflow(
        &self,
        workflow_id: Uuid,
        payload: Option<Value>,
    ) -> Result<()> {
        let mut ctx = self.begin().await?;
        let wf = firing::load_workflow(&mut ctx, workflow_id).await?;
        if !wf.is_root() || wf.state.is_final() {
            return Err(EngineError::InvalidWorkflowState {
                workflow_id,
                state: wf.state.to_string(),
            });
        }

        let def = firing::definition_of(&ctx, &wf)?;
        if let Some(p) = payload {
            def.cancel_validator.validate(&p)?;
        }

        let root = ctx.open_span(
            SpanInfo {
                operation: "cancelRootWorkflow",
                resource_type: ResourceType::Workflow,
                resource_id: workflow_id,
                resource_name: &wf.name,
                workflow_id,
                trace_id: workflow_id,
                task_generation: None,
            },
            OperationType::Mutation,
        );
        let steps = firing::finalize_workflow_cascade(
            &mut ctx,
            workflow_id,
            WorkflowState::Canceled,
            "user_cancel",
            true,
        )
        .await?;
        firing::drive(&mut ctx, steps).await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;

        info!(%workflow_id, "canceled root workflow");
        Ok(())
    }

    // =========================================================================
    // Work item lifecycle
    // =========================================================================

    /// Initialize a work item under the current generation of the target
    /// task. Fails with `TaskNotFound` when the task is not live (the
    /// generation guard).
    #[instrument(skip(self, payload))]
    pub async fn initialize_work_item(
        &self,
        target: WorkItemTarget,
        payload: Option<Value>,
    ) -> Result<Uuid> {
        let mut ctx = self.begin().await?;
        let wf = firing::load_workflow(&mut ctx, target.parent_workflow_id).await?;
        Self::guard_workflow_open(&wf)?;

        if !target.path.is_empty()
            && target.path.last().map(String::as_str) != Some(target.parent_task_name.as_str())
        {
            return Err(EngineError::task_not_found(
                wf.id,
                target.path.join("/"),
            ));
        }

        let row = Self::live_task(&mut ctx, wf.id, &target.parent_task_name).await?;
        let trace_id = ctx.trace_of(&wf).await?;

        let root = ctx.open_span(
            SpanInfo {
                operation: "initializeWorkItem",
                resource_type: ResourceType::Task,
                resource_id: row.id,
                resource_name: &row.name,
                workflow_id: wf.id,
                trace_id,
                task_generation: Some(row.generation),
            },
            OperationType::Mutation,
        );
        let item = workitem::initialize(&mut ctx, trace_id, row.parent_ref(), payload).await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;

        info!(work_item_id = %item.id, task = %row.name, "initialized work item");
        Ok(item.id)
    }

    /// Initialize a child workflow under the current generation of a
    /// (dynamic) composite task.
    #[instrument(skip(self, payload))]
    pub async fn initialize_workflow(
        &self,
        target: ChildWorkflowTarget,
        payload: Option<Value>,
    ) -> Result<Uuid> {
        let mut ctx = self.begin().await?;
        let wf = firing::load_workflow(&mut ctx, target.parent_workflow_id).await?;
        Self::guard_workflow_open(&wf)?;
        let def = firing::definition_of(&ctx, &wf)?;
        let td = def
            .task(&target.parent_task_name)
            .ok_or_else(|| EngineError::task_not_found(wf.id, &target.parent_task_name))?;

        let candidates = td.kind.children();
        let child = match &target.child_name {
            Some(name) => candidates
                .iter()
                .find(|c| &c.name == name)
                .ok_or_else(|| EngineError::UnknownDefinition(name.clone()))?,
            None => match candidates {
                [only] => only,
                _ => {
                    return Err(EngineError::UnknownDefinition(format!(
                        "{}: child name required",
                        target.parent_task_name
                    )))
                }
            },
        }
        .clone();

        let row = Self::live_task(&mut ctx, wf.id, &target.parent_task_name).await?;
        let trace_id = ctx.trace_of(&wf).await?;

        let root = ctx.open_span(
            SpanInfo {
                operation: "initializeWorkflow",
                resource_type: ResourceType::Task,
                resource_id: row.id,
                resource_name: &row.name,
                workflow_id: wf.id,
                trace_id,
                task_generation: Some(row.generation),
            },
            OperationType::Mutation,
        );
        let steps = firing::initialize_child_workflow(&mut ctx, &wf, &row, &child, payload).await?;
        let child_id = match steps.first() {
            Some(Step::EvalJoin { workflow_id, .. }) => *workflow_id,
            _ => {
                // a child whose start condition feeds no task is structurally
                // impossible past the builder
                return Err(EngineError::Internal(
                    "child workflow produced no firing steps".to_string(),
                ));
            }
        };
        firing::drive(&mut ctx, steps).await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;

        info!(%child_id, task = %row.name, "initialized child workflow");
        Ok(child_id)
    }

    /// Start a work item with a validated payload. The owning task moves
    /// `enabled -> started` on the first start; the workflow (and its
    /// initialized ancestors) move to `started`.
    #[instrument(skip(self, payload))]
    pub async fn start_work_item(&self, work_item_id: Uuid, payload: Value) -> Result<()> {
        let mut ctx = self.begin().await?;
        let (mut item, wf, mut task_row) =
            Self::load_work_item_chain(&mut ctx, work_item_id).await?;
        if item.state != WorkItemState::Initialized {
            return Err(EngineError::InvalidWorkItemState {
                work_item_id,
                state: item.state.to_string(),
            });
        }
        if !task_row.state.is_active() {
            return Err(EngineError::InvalidTaskState {
                task: task_row.name.clone(),
                state: task_row.state.to_string(),
            });
        }

        let def = firing::definition_of(&ctx, &wf)?;
        let td = def
            .task(&task_row.name)
            .ok_or_else(|| EngineError::task_not_found(wf.id, &task_row.name))?;
        let validated = td.action.start_validator.validate(&payload)?;
        let trace_id = ctx.trace_of(&wf).await?;

        let root = ctx.open_span(
            SpanInfo {
                operation: "startWorkItem",
                resource_type: ResourceType::WorkItem,
                resource_id: work_item_id,
                resource_name: &task_row.name,
                workflow_id: wf.id,
                trace_id,
                task_generation: Some(task_row.generation),
            },
            OperationType::Mutation,
        );

        item.payload = Some(validated.clone());
        workitem::transition(&mut ctx, trace_id, &mut item, WorkItemState::Started, json!({}))
            .await?;

        let mut steps = Vec::new();
        {
            let handler = td.action.handler.clone();
            let mut scope = ActivityScope::new(
                &mut ctx,
                wf.id,
                &task_row.name,
                task_row.generation,
                wf.execution_mode,
            );
            handler.on_start(&mut scope, &validated).await?;
            let intents = scope.into_intents();
            firing::process_intents(&mut ctx, &wf, trace_id, td, &task_row, intents, &mut steps)
                .await?;
        }

        if task_row.state == TaskState::Enabled {
            task::apply_state(&mut ctx, &mut task_row, TaskState::Started).await?;
            ctx.write_span(
                SpanInfo {
                    operation: crate::audit::ops::TASK_START,
                    resource_type: ResourceType::Task,
                    resource_id: task_row.id,
                    resource_name: &task_row.name,
                    workflow_id: wf.id,
                    trace_id,
                    task_generation: Some(task_row.generation),
                },
                json!({}),
            )
            .await?;
            firing::run_activity(&mut ctx, &wf, trace_id, td, &task_row, Hook::Started, &mut steps)
                .await?;
        }

        workflow::mark_started_chain(&mut ctx, wf.id).await?;
        firing::drive(&mut ctx, steps).await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;

        info!(%work_item_id, task = %task_row.name, "started work item");
        Ok(())
    }

    /// Complete a started work item with a validated payload; triggers the
    /// task-completion check and, transitively, the firing engine.
    #[instrument(skip(self, payload))]
    pub async fn complete_work_item(&self, work_item_id: Uuid, payload: Value) -> Result<()> {
        let mut ctx = self.begin().await?;
        let (mut item, wf, task_row) = Self::load_work_item_chain(&mut ctx, work_item_id).await?;
        if item.state != WorkItemState::Started {
            return Err(EngineError::InvalidWorkItemState {
                work_item_id,
                state: item.state.to_string(),
            });
        }

        let def = firing::definition_of(&ctx, &wf)?;
        let td = def
            .task(&task_row.name)
            .ok_or_else(|| EngineError::task_not_found(wf.id, &task_row.name))?;
        let validated = td.action.complete_validator.validate(&payload)?;
        let trace_id = ctx.trace_of(&wf).await?;

        let root = ctx.open_span(
            SpanInfo {
                operation: "completeWorkItem",
                resource_type: ResourceType::WorkItem,
                resource_id: work_item_id,
                resource_name: &task_row.name,
                workflow_id: wf.id,
                trace_id,
                task_generation: Some(task_row.generation),
            },
            OperationType::Mutation,
        );

        item.payload = Some(validated.clone());
        workitem::transition(
            &mut ctx,
            trace_id,
            &mut item,
            WorkItemState::Completed,
            json!({}),
        )
        .await?;

        let mut steps = Vec::new();
        {
            let handler = td.action.handler.clone();
            let mut scope = ActivityScope::new(
                &mut ctx,
                wf.id,
                &task_row.name,
                task_row.generation,
                wf.execution_mode,
            );
            handler.on_complete(&mut scope, &validated).await?;
            let intents = scope.into_intents();
            firing::process_intents(&mut ctx, &wf, trace_id, td, &task_row, intents, &mut steps)
                .await?;
        }

        steps.extend(
            firing::work_item_finalized(&mut ctx, &item.parent, Some(validated)).await?,
        );
        firing::drive(&mut ctx, steps).await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;

        info!(%work_item_id, task = %task_row.name, "completed work item");
        Ok(())
    }

    /// Fail a work item; the default policy fails the task and cascades.
    #[instrument(skip(self, payload))]
    pub async fn fail_work_item(&self, work_item_id: Uuid, payload: Option<Value>) -> Result<()> {
        let mut ctx = self.begin().await?;
        let (mut item, wf, task_row) = Self::load_work_item_chain(&mut ctx, work_item_id).await?;
        if item.state.is_final() {
            return Err(EngineError::InvalidWorkItemState {
                work_item_id,
                state: item.state.to_string(),
            });
        }
        let trace_id = ctx.trace_of(&wf).await?;

        let root = ctx.open_span(
            SpanInfo {
                operation: "failWorkItem",
                resource_type: ResourceType::WorkItem,
                resource_id: work_item_id,
                resource_name: &task_row.name,
                workflow_id: wf.id,
                trace_id,
                task_generation: Some(task_row.generation),
            },
            OperationType::Mutation,
        );
        if payload.is_some() {
            item.payload = payload;
        }
        workitem::transition(&mut ctx, trace_id, &mut item, WorkItemState::Failed, json!({}))
            .await?;
        let steps = firing::work_item_finalized(&mut ctx, &item.parent, None).await?;
        firing::drive(&mut ctx, steps).await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;

        info!(%work_item_id, task = %task_row.name, "failed work item");
        Ok(())
    }

    /// Cancel a work item silently; the finalization check may still
    /// complete the task if a sibling completed.
    #[instrument(skip(self, _payload))]
    pub async fn cancel_work_item(&self, work_item_id: Uuid, _payload: Option<Value>) -> Result<()> {
        let mut ctx = self.begin().await?;
        let (mut item, wf, task_row) = Self::load_work_item_chain(&mut ctx, work_item_id).await?;
        if item.state.is_final() {
            return Err(EngineError::InvalidWorkItemState {
                work_item_id,
                state: item.state.to_string(),
            });
        }
        let trace_id = ctx.trace_of(&wf).await?;

        let root = ctx.open_span(
            SpanInfo {
                operation: "cancelWorkItem",
                resource_type: ResourceType::WorkItem,
                resource_id: work_item_id,
                resource_name: &task_row.name,
                workflow_id: wf.id,
                trace_id,
                task_generation: Some(task_row.generation),
            },
            OperationType::Mutation,
        );
        workitem::transition(
            &mut ctx,
            trace_id,
            &mut item,
            WorkItemState::Canceled,
            json!({}),
        )
        .await?;
        let steps = firing::work_item_finalized(&mut ctx, &item.parent, None).await?;
        firing::drive(&mut ctx, steps).await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;
        Ok(())
    }

    /// Reset a started work item back to `initialized` (retry flows). Only
    /// allowed while the owning task is still live.
    #[instrument(skip(self))]
    pub async fn reset_work_item(&self, work_item_id: Uuid) -> Result<()> {
        let mut ctx = self.begin().await?;
        let (mut item, wf, task_row) = Self::load_work_item_chain(&mut ctx, work_item_id).await?;
        if item.state != WorkItemState::Started {
            return Err(EngineError::InvalidWorkItemState {
                work_item_id,
                state: item.state.to_string(),
            });
        }
        if !task_row.state.is_active() {
            return Err(EngineError::InvalidTaskState {
                task: task_row.name.clone(),
                state: task_row.state.to_string(),
            });
        }
        let trace_id = ctx.trace_of(&wf).await?;

        let root = ctx.open_span(
            SpanInfo {
                operation: "resetWorkItem",
                resource_type: ResourceType::WorkItem,
                resource_id: work_item_id,
                resource_name: &task_row.name,
                workflow_id: wf.id,
                trace_id,
                task_generation: Some(task_row.generation),
            },
            OperationType::Mutation,
        );
        workitem::transition(
            &mut ctx,
            trace_id,
            &mut item,
            WorkItemState::Initialized,
            json!({}),
        )
        .await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Scheduled jobs
    // =========================================================================

    /// Drain scheduled jobs due at `now`. Each job runs in its own
    /// transaction; a job whose task generation is no longer current is
    /// canceled (the stale-generation guard), a job whose transaction fails
    /// is canceled with the error code.
    #[instrument(skip(self))]
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobOutcome>> {
        let due = {
            let mut tx = self.store.begin().await?;
            tx.due_jobs(now).await?
        };

        let mut outcomes = Vec::with_capacity(due.len());
        for job in due {
            let status = match self.run_job(&job).await {
                Ok(status) => status,
                Err(err) => {
                    let code = err.code().to_string();
                    self.mark_job_canceled(job.id).await?;
                    JobRunStatus::Failed(code)
                }
            };
            outcomes.push(JobOutcome {
                job_id: job.id,
                status,
            });
        }
        Ok(outcomes)
    }

    async fn run_job(&self, job: &ScheduledJobRow) -> Result<JobRunStatus> {
        let mut ctx = self.begin().await?;

        // re-read: the job may have been canceled since the listing
        let Some(mut current) = ctx.tx().job(job.id).await? else {
            return Ok(JobRunStatus::StaleGeneration);
        };
        if current.state != JobState::Pending {
            return Ok(JobRunStatus::StaleGeneration);
        }

        // generation guard: stale jobs must not pollute newer generations
        let latest = ctx
            .tx()
            .latest_task(current.parent.workflow_id, &current.parent.task_name)
            .await?;
        let task_row = match latest {
            Some(t) if t.generation == current.parent.task_generation && t.state.is_active() => t,
            _ => {
                current.state = JobState::Canceled;
                ctx.tx().update_job(&current).await?;
                ctx.commit().await?;
                return Ok(JobRunStatus::StaleGeneration);
            }
        };

        let wf = firing::load_workflow(&mut ctx, current.parent.workflow_id).await?;
        Self::guard_workflow_open(&wf)?;
        let def = firing::definition_of(&ctx, &wf)?;
        let td = def
            .task(&current.parent.task_name)
            .ok_or_else(|| EngineError::task_not_found(wf.id, &current.parent.task_name))?;
        let trace_id = ctx.trace_of(&wf).await?;

        let root = ctx.open_span(
            SpanInfo {
                operation: "runScheduledJob",
                resource_type: ResourceType::Task,
                resource_id: task_row.id,
                resource_name: &task_row.name,
                workflow_id: wf.id,
                trace_id,
                task_generation: Some(task_row.generation),
            },
            OperationType::Mutation,
        );

        let mut steps = Vec::new();
        match current.spec.clone() {
            JobSpec::InitializeWorkItem { payload } => {
                workitem::initialize(&mut ctx, trace_id, current.parent.clone(), payload).await?;
            }
            JobSpec::InitializeWorkflow {
                child_name,
                payload,
            } => {
                let child = td
                    .kind
                    .children()
                    .iter()
                    .find(|c| c.name == child_name)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownDefinition(child_name))?;
                steps.extend(
                    firing::initialize_child_workflow(&mut ctx, &wf, &task_row, &child, payload)
                        .await?,
                );
            }
        }

        current.state = JobState::Done;
        ctx.tx().update_job(&current).await?;
        firing::drive(&mut ctx, steps).await?;
        ctx.close_span(root, json!({})).await?;
        ctx.commit().await?;
        Ok(JobRunStatus::Done)
    }

    async fn mark_job_canceled(&self, job_id: Uuid) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if let Some(mut job) = tx.job(job_id).await? {
            if job.state == JobState::Pending {
                job.state = JobState::Canceled;
                tx.update_job(&job).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Write a reconstruction snapshot of the workflow's live state
    #[instrument(skip(self))]
    pub async fn write_state_snapshot(&self, workflow_id: Uuid) -> Result<Uuid> {
        let mut ctx = self.begin().await?;
        let wf = firing::load_workflow(&mut ctx, workflow_id).await?;
        let trace_id = ctx.trace_of(&wf).await?;
        let taken_at = ctx.now();
        let watermark = ctx.next_sequence();
        let snapshot_id =
            audit::write_snapshot(ctx.tx(), trace_id, workflow_id, taken_at, watermark).await?;
        ctx.commit().await?;
        Ok(snapshot_id)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn workflow_by_id(&self, workflow_id: Uuid) -> Result<Option<WorkflowRow>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.workflow(workflow_id).await?)
    }

    pub async fn workflow_tasks_by_state(
        &self,
        workflow_id: Uuid,
        state: TaskState,
    ) -> Result<Vec<TaskRow>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.tasks_by_workflow_state(workflow_id, state).await?)
    }

    /// Work items of the task's latest generation
    pub async fn workflow_task_work_items(
        &self,
        workflow_id: Uuid,
        task_name: &str,
    ) -> Result<Vec<WorkItemRow>> {
        let mut tx = self.store.begin().await?;
        let Some(task) = tx.latest_task(workflow_id, task_name).await? else {
            return Err(EngineError::task_not_found(workflow_id, task_name));
        };
        Ok(tx.work_items_by_parent(&task.parent_ref(), None).await?)
    }

    /// Child workflows of the composite task's latest generation
    pub async fn workflow_composite_task_workflows(
        &self,
        workflow_id: Uuid,
        task_name: &str,
    ) -> Result<Vec<WorkflowRow>> {
        let mut tx = self.store.begin().await?;
        let Some(task) = tx.latest_task(workflow_id, task_name).await? else {
            return Err(EngineError::task_not_found(workflow_id, task_name));
        };
        Ok(tx.workflows_by_parent(&task.parent_ref()).await?)
    }

    pub async fn trace_spans(&self, trace_id: Uuid) -> Result<Vec<AuditSpanRow>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.spans_by_trace(trace_id).await?)
    }

    /// Reconstruct one workflow's state at a historical timestamp by folding
    /// its audit spans (filtered by workflow id, never the whole trace)
    pub async fn workflow_state_at_time(
        &self,
        trace_id: Uuid,
        workflow_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<WorkflowStateView> {
        let mut tx = self.store.begin().await?;
        audit::reconstruct_at(tx.as_mut(), trace_id, workflow_id, at).await
    }

    // =========================================================================
    // Shared guards
    // =========================================================================

    fn guard_workflow_open(wf: &WorkflowRow) -> Result<()> {
        if wf.state.is_final() {
            return Err(EngineError::InvalidWorkflowState {
                workflow_id: wf.id,
                state: wf.state.to_string(),
            });
        }
        Ok(())
    }

    /// The task's current generation, which must be live
    async fn live_task(
        ctx: &mut ExecutionContext,
        workflow_id: Uuid,
        task_name: &str,
    ) -> Result<TaskRow> {
        let row = ctx
            .tx()
            .latest_task(workflow_id, task_name)
            .await?
            .ok_or_else(|| EngineError::task_not_found(workflow_id, task_name))?;
        if !row.state.is_active() {
            return Err(EngineError::task_not_found(workflow_id, task_name));
        }
        Ok(row)
    }

    /// Load a work item with its workflow and exact task generation row.
    /// The task row must match the item's generation; superseded generations
    /// surface as `TaskNotFound`.
    async fn load_work_item_chain(
        ctx: &mut ExecutionContext,
        work_item_id: Uuid,
    ) -> Result<(WorkItemRow, WorkflowRow, TaskRow)> {
        let item = ctx
            .tx()
            .work_item(work_item_id)
            .await?
            .ok_or(EngineError::WorkItemNotFound(work_item_id))?;
        let wf = firing::load_workflow(ctx, item.parent.workflow_id).await?;
        Self::guard_workflow_open(&wf)?;
        let task_row = ctx
            .tx()
            .task_at(
                item.parent.workflow_id,
                &item.parent.task_name,
                item.parent.task_generation,
            )
            .await?
            .ok_or_else(|| {
                EngineError::task_not_found(item.parent.workflow_id, &item.parent.task_name)
            })?;
        Ok((item, wf, task_row))
    }
}
