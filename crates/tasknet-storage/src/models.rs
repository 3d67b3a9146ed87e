// Database records (internal, converted to/from the core entities)

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use tasknet_core::{
    AuditSpanRow, ConditionRow, ParentRef, ScheduledJobRow, SnapshotRow, StoreError, TaskRow,
    WorkItemRow, WorkflowRow,
};

fn parent_from_columns(
    workflow_id: Option<Uuid>,
    task_name: Option<String>,
    task_generation: Option<i32>,
) -> Option<ParentRef> {
    match (workflow_id, task_name, task_generation) {
        (Some(workflow_id), Some(task_name), Some(generation)) => Some(ParentRef {
            workflow_id,
            task_name,
            task_generation: generation as u32,
        }),
        _ => None,
    }
}

/// Workflow row from the database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct WorkflowRecord {
    pub id: Uuid,
    pub name: String,
    pub version_name: String,
    pub parent_workflow_id: Option<Uuid>,
    pub parent_task_name: Option<String>,
    pub parent_task_generation: Option<i32>,
    pub state: String,
    pub execution_mode: String,
    pub migration_from_workflow_id: Option<Uuid>,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl From<WorkflowRecord> for WorkflowRow {
    fn from(r: WorkflowRecord) -> Self {
        let execution_mode = match r.execution_mode.as_str() {
            "fast_forward" => tasknet_core::ExecutionMode::FastForward,
            _ => tasknet_core::ExecutionMode::Normal,
        };
        WorkflowRow {
            id: r.id,
            name: r.name,
            version_name: r.version_name,
            parent: parent_from_columns(
                r.parent_workflow_id,
                r.parent_task_name,
                r.parent_task_generation,
            ),
            state: r.state.as_str().into(),
            execution_mode,
            migration_from_workflow_id: r.migration_from_workflow_id,
            payload: r.payload,
            created_at: r.created_at,
            finalized_at: r.finalized_at,
        }
    }
}

/// Task row from the database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct TaskRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub generation: i32,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

impl From<TaskRecord> for TaskRow {
    fn from(r: TaskRecord) -> Self {
        TaskRow {
            id: r.id,
            workflow_id: r.workflow_id,
            name: r.name,
            generation: r.generation as u32,
            state: r.state.as_str().into(),
            created_at: r.created_at,
        }
    }
}

/// Condition row from the database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ConditionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub kind: String,
    pub marking: i32,
    pub created_at: DateTime<Utc>,
}

impl From<ConditionRecord> for ConditionRow {
    fn from(r: ConditionRecord) -> Self {
        ConditionRow {
            id: r.id,
            workflow_id: r.workflow_id,
            name: r.name,
            kind: r.kind.as_str().into(),
            marking: r.marking.max(0) as u32,
            created_at: r.created_at,
        }
    }
}

/// Work item row from the database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct WorkItemRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub task_name: String,
    pub task_generation: i32,
    pub state: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl From<WorkItemRecord> for WorkItemRow {
    fn from(r: WorkItemRecord) -> Self {
        WorkItemRow {
            id: r.id,
            parent: ParentRef {
                workflow_id: r.workflow_id,
                task_name: r.task_name,
                task_generation: r.task_generation as u32,
            },
            state: r.state.as_str().into(),
            payload: r.payload,
            created_at: r.created_at,
            finalized_at: r.finalized_at,
        }
    }
}

/// Scheduled job row from the database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub task_name: String,
    pub task_generation: i32,
    pub run_at: DateTime<Utc>,
    pub spec: serde_json::Value,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for ScheduledJobRow {
    type Error = StoreError;

    fn try_from(r: JobRecord) -> Result<Self, StoreError> {
        Ok(ScheduledJobRow {
            id: r.id,
            parent: ParentRef {
                workflow_id: r.workflow_id,
                task_name: r.task_name,
                task_generation: r.task_generation as u32,
            },
            run_at: r.run_at,
            spec: serde_json::from_value(r.spec)?,
            state: r.state.as_str().into(),
            created_at: r.created_at,
        })
    }
}

/// Audit span row from the database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct SpanRecord {
    pub span_id: Uuid,
    pub sequence: i64,
    pub trace_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation_type: String,
    pub operation: String,
    pub resource_type: String,
    pub resource_id: Uuid,
    pub resource_name: String,
    pub workflow_id: Uuid,
    pub task_generation: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub attributes: serde_json::Value,
}

impl From<SpanRecord> for AuditSpanRow {
    fn from(r: SpanRecord) -> Self {
        let operation_type = match r.operation_type.as_str() {
            "query" => tasknet_core::OperationType::Query,
            _ => tasknet_core::OperationType::Mutation,
        };
        AuditSpanRow {
            trace_id: r.trace_id,
            span_id: r.span_id,
            sequence: r.sequence,
            parent_span_id: r.parent_span_id,
            operation_type,
            operation: r.operation,
            resource_type: r.resource_type.as_str().into(),
            resource_id: r.resource_id,
            resource_name: r.resource_name,
            workflow_id: r.workflow_id,
            task_generation: r.task_generation.map(|g| g as u32),
            started_at: r.started_at,
            ended_at: r.ended_at,
            attributes: r.attributes,
        }
    }
}

/// Snapshot row from the database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct SnapshotRecord {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub workflow_id: Uuid,
    pub taken_at: DateTime<Utc>,
    pub sequence: i64,
    pub state: serde_json::Value,
}

impl From<SnapshotRecord> for SnapshotRow {
    fn from(r: SnapshotRecord) -> Self {
        SnapshotRow {
            id: r.id,
            trace_id: r.trace_id,
            workflow_id: r.workflow_id,
            taken_at: r.taken_at,
            sequence: r.sequence,
            state: r.state,
        }
    }
}
