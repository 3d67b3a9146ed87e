// Execution context
//
// An ExecutionContext scopes exactly one store transaction: the open
// StoreTx, the audit span stack (root span = the triggering API call), an
// injectable clock, and — during a migration hop — the replay state the
// firing engine consults. User callbacks never see the context directly;
// they receive an ActivityScope bound to one task generation, which buffers
// side-effect intents and exposes the transaction for host tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::{
    AuditSpanRow, ExecutionMode, JobSpec, OperationType, ResourceType, WorkflowRow,
};
use crate::error::{EngineError, Result};
use crate::store::StoreTx;
use crate::versions::{Registry, TaskMigrator};

// ============================================================================
// Clock
// ============================================================================

/// Time source for row timestamps and span boundaries. Injectable so tests
/// can drive time-travel reconstruction deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("clock lock poisoned") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

// ============================================================================
// Migration replay state
// ============================================================================

/// Present on the context while a migration hop is replaying; the firing
/// engine consults the task migrators for every task it enables.
pub(crate) struct MigrationReplay {
    /// The canceled source workflow
    pub old_workflow_id: Uuid,
    /// Keyed by `<workflowName>/<taskName>`
    pub migrators: HashMap<String, Arc<dyn TaskMigrator>>,
}

// ============================================================================
// Execution context
// ============================================================================

/// Identity of a span while it is open (pushed on the context's span stack)
pub(crate) struct OpenSpan {
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub operation: String,
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub resource_name: String,
    pub workflow_id: Uuid,
    pub trace_id: Uuid,
    pub task_generation: Option<u32>,
}

/// Descriptor for writing one span
pub(crate) struct SpanInfo<'a> {
    pub operation: &'a str,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub resource_name: &'a str,
    pub workflow_id: Uuid,
    pub trace_id: Uuid,
    pub task_generation: Option<u32>,
}

/// Runtime object scoping one transaction
pub struct ExecutionContext {
    tx: Box<dyn StoreTx>,
    clock: Arc<dyn Clock>,
    registry: Arc<Registry>,
    /// Engine-wide span write counter; breaks timestamp ties in the fold
    span_seq: Arc<AtomicI64>,
    span_stack: Vec<Uuid>,
    trace_cache: HashMap<Uuid, Uuid>,
    pub(crate) migration: Option<MigrationReplay>,
}

impl ExecutionContext {
    pub(crate) fn new(
        tx: Box<dyn StoreTx>,
        clock: Arc<dyn Clock>,
        registry: Arc<Registry>,
        span_seq: Arc<AtomicI64>,
    ) -> Self {
        Self {
            tx,
            clock,
            registry,
            span_seq,
            span_stack: Vec::new(),
            trace_cache: HashMap::new(),
            migration: None,
        }
    }

    pub(crate) fn next_sequence(&self) -> i64 {
        self.span_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The open store transaction
    pub fn tx(&mut self) -> &mut dyn StoreTx {
        self.tx.as_mut()
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Commit the transaction, consuming the context
    pub(crate) async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Trace resolution
    // =========================================================================

    /// Trace id of a workflow: the id of its root ancestor. Parents are
    /// walked through the store once and cached for the transaction.
    pub(crate) async fn trace_of(&mut self, workflow: &WorkflowRow) -> Result<Uuid> {
        if let Some(trace_id) = self.trace_cache.get(&workflow.id) {
            return Ok(*trace_id);
        }

        let mut current = workflow.clone();
        let mut visited = vec![current.id];
        while let Some(parent) = &current.parent {
            current = self
                .tx
                .workflow(parent.workflow_id)
                .await?
                .ok_or(EngineError::WorkflowNotFound(parent.workflow_id))?;
            visited.push(current.id);
        }

        let trace_id = current.id;
        for id in visited {
            self.trace_cache.insert(id, trace_id);
        }
        Ok(trace_id)
    }

    // =========================================================================
    // Audit spans
    // =========================================================================

    /// Open a grouping span and push it on the stack; transitions recorded
    /// while it is open become its children.
    pub(crate) fn open_span(
        &mut self,
        info: SpanInfo<'_>,
        operation_type: OperationType,
    ) -> OpenSpan {
        let span_id = Uuid::now_v7();
        let parent_span_id = self.span_stack.last().copied();
        self.span_stack.push(span_id);
        OpenSpan {
            span_id,
            parent_span_id,
            started_at: self.now(),
            operation: info.operation.to_string(),
            operation_type,
            resource_type: info.resource_type,
            resource_id: info.resource_id,
            resource_name: info.resource_name.to_string(),
            workflow_id: info.workflow_id,
            trace_id: info.trace_id,
            task_generation: info.task_generation,
        }
    }

    /// Close an open span, writing its row. The sequence is assigned at
    /// close time, after every child span, so a grouping span folds last;
    /// children carry the effect, the group carries the decision metadata.
    pub(crate) async fn close_span(&mut self, span: OpenSpan, attributes: Value) -> Result<()> {
        self.span_stack.pop();
        let row = AuditSpanRow {
            trace_id: span.trace_id,
            span_id: span.span_id,
            sequence: self.next_sequence(),
            parent_span_id: span.parent_span_id,
            operation_type: span.operation_type,
            operation: span.operation,
            resource_type: span.resource_type,
            resource_id: span.resource_id,
            resource_name: span.resource_name,
            workflow_id: span.workflow_id,
            task_generation: span.task_generation,
            started_at: span.started_at,
            ended_at: self.now(),
            attributes,
        };
        self.tx.insert_span(row).await?;
        Ok(())
    }

    /// Write an instantaneous transition span under the current stack top
    pub(crate) async fn write_span(&mut self, info: SpanInfo<'_>, attributes: Value) -> Result<()> {
        let now = self.now();
        let row = AuditSpanRow {
            trace_id: info.trace_id,
            span_id: Uuid::now_v7(),
            sequence: self.next_sequence(),
            parent_span_id: self.span_stack.last().copied(),
            operation_type: OperationType::Mutation,
            operation: info.operation.to_string(),
            resource_type: info.resource_type,
            resource_id: info.resource_id,
            resource_name: info.resource_name.to_string(),
            workflow_id: info.workflow_id,
            task_generation: info.task_generation,
            started_at: now,
            ended_at: now,
            attributes,
        };
        self.tx.insert_span(row).await?;
        Ok(())
    }
}

// ============================================================================
// Activity scope
// ============================================================================

/// Side effects a callback registered; the engine applies them after the
/// callback returns, inside the same transaction
#[derive(Debug)]
pub(crate) enum Intent {
    WorkItem {
        payload: Option<Value>,
    },
    ChildWorkflow {
        child_name: String,
        payload: Option<Value>,
    },
    Job {
        run_at: DateTime<Utc>,
        spec: JobSpec,
    },
}

/// Handle passed to task activities and work-item handlers, bound to the
/// task generation that is transitioning
pub struct ActivityScope<'a> {
    ctx: &'a mut ExecutionContext,
    workflow_id: Uuid,
    task_name: String,
    generation: u32,
    mode: ExecutionMode,
    intents: Vec<Intent>,
}

impl<'a> ActivityScope<'a> {
    pub(crate) fn new(
        ctx: &'a mut ExecutionContext,
        workflow_id: Uuid,
        task_name: impl Into<String>,
        generation: u32,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            ctx,
            workflow_id,
            task_name: task_name.into(),
            generation,
            mode,
            intents: Vec::new(),
        }
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Activities must skip user side effects in fast-forward mode
    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.ctx.now()
    }

    /// The open transaction, for host tables written atomically with the
    /// workflow transition
    pub fn store(&mut self) -> &mut dyn StoreTx {
        self.ctx.tx()
    }

    /// Initialize a work item under this task generation
    pub fn initialize_work_item(&mut self, payload: Option<Value>) {
        self.intents.push(Intent::WorkItem { payload });
    }

    /// Initialize a child workflow under this task generation. The name must
    /// be one of the task's candidate child definitions.
    pub fn initialize_workflow(&mut self, child_name: impl Into<String>, payload: Option<Value>) {
        self.intents.push(Intent::ChildWorkflow {
            child_name: child_name.into(),
            payload,
        });
    }

    /// Register a deferred transaction tied to this task generation. The job
    /// is persisted at once, released by the scheduler after commit, and
    /// canceled if the generation is canceled first.
    pub fn schedule(&mut self, run_at: DateTime<Utc>, spec: JobSpec) {
        self.intents.push(Intent::Job { run_at, spec });
    }

    pub(crate) fn into_intents(self) -> Vec<Intent> {
        self.intents
    }
}

// ============================================================================
// Route context
// ============================================================================

/// What an XOR-split route callback sees: the completing task generation and
/// the payload of the work item (or child workflow result) that finished it
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub workflow_id: Uuid,
    pub task_name: String,
    pub generation: u32,
    pub payload: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::milliseconds(250));
        assert_eq!(clock.now(), start + Duration::milliseconds(250));
    }
}
