// Persisted entity families
//
// These types represent the rows the engine reads and writes through the
// store contract: Workflow, Task, Condition, WorkItem, ScheduledJob,
// AuditSpan, plus the append-only state logs and reconstruction snapshots.
// Rows are never hard-deleted; finalization is a state change so the audit
// trail stays intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// States
// ============================================================================

/// Execution mode of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Activities run with full side effects
    Normal,
    /// Migration replay: activities must skip user side effects
    FastForward,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::FastForward => write!(f, "fast_forward"),
        }
    }
}

/// Workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Initialized,
    Started,
    Completed,
    Failed,
    Canceled,
}

impl WorkflowState {
    /// Finalized states are terminal: no further transitions are allowed
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl From<&str> for WorkflowState {
    fn from(s: &str) -> Self {
        match s {
            "started" => Self::Started,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => Self::Initialized,
        }
    }
}

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Disabled,
    Enabled,
    Started,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    /// Finalized states are terminal for the generation
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Enabled or started: the generation is live and owns work
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Enabled | Self::Started)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Enabled => write!(f, "enabled"),
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl From<&str> for TaskState {
    fn from(s: &str) -> Self {
        match s {
            "enabled" => Self::Enabled,
            "started" => Self::Started,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => Self::Disabled,
        }
    }
}

/// Work item state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Initialized,
    Started,
    Completed,
    Failed,
    Canceled,
}

impl WorkItemState {
    /// Finalized work items are immutable
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl From<&str> for WorkItemState {
    fn from(s: &str) -> Self {
        match s {
            "started" => Self::Started,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => Self::Initialized,
        }
    }
}

/// Condition kind within the net
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Start,
    End,
    Intermediate,
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::End => write!(f, "end"),
            Self::Intermediate => write!(f, "intermediate"),
        }
    }
}

impl From<&str> for ConditionKind {
    fn from(s: &str) -> Self {
        match s {
            "start" => Self::Start,
            "end" => Self::End,
            _ => Self::Intermediate,
        }
    }
}

/// Scheduled job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Done,
    Canceled,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Done => write!(f, "done"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl From<&str> for JobState {
    fn from(s: &str) -> Self {
        match s {
            "done" => Self::Done,
            "canceled" => Self::Canceled,
            _ => Self::Pending,
        }
    }
}

// ============================================================================
// Parent reference
// ============================================================================

/// Pointer from a work item, child workflow, or scheduled job to the exact
/// task generation that owns it. Generations act as a version guard: work
/// addressed to a generation that is no longer current is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub workflow_id: Uuid,
    pub task_name: String,
    pub task_generation: u32,
}

impl ParentRef {
    pub fn new(workflow_id: Uuid, task_name: impl Into<String>, task_generation: u32) -> Self {
        Self {
            workflow_id,
            task_name: task_name.into(),
            task_generation,
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

/// One running workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub id: Uuid,
    /// Definition name
    pub name: String,
    /// Version of the definition this instance runs
    pub version_name: String,
    /// Present for child workflows of (dynamic) composite tasks
    pub parent: Option<ParentRef>,
    pub state: WorkflowState,
    pub execution_mode: ExecutionMode,
    /// Set on workflows created by a migration hop; chains audit traces
    pub migration_from_workflow_id: Option<Uuid>,
    /// Validated initialize payload
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl WorkflowRow {
    /// Root workflows have no parent and anchor an audit trace
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// One logical step of a workflow, scoped to a generation.
///
/// A new row is created per generation; at most one row per
/// `(workflow_id, name)` is ever in a non-finalized state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub generation: u32,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
}

impl TaskRow {
    pub fn parent_ref(&self) -> ParentRef {
        ParentRef::new(self.workflow_id, self.name.clone(), self.generation)
    }
}

/// A Petri-net place holding a non-negative token marking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub kind: ConditionKind,
    pub marking: u32,
    pub created_at: DateTime<Utc>,
}

/// One execution unit of an atomic task, bound to a task generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemRow {
    pub id: Uuid,
    pub parent: ParentRef,
    pub state: WorkItemState,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// A deferred engine operation registered by user code inside a transaction.
///
/// The job's lifetime is tied to its task generation: canceling the task
/// cancels the job, and a job that fires against a superseded generation
/// aborts with `TaskNotFound`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJobRow {
    pub id: Uuid,
    pub parent: ParentRef,
    pub run_at: DateTime<Utc>,
    pub spec: JobSpec,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

/// The operation a scheduled job performs when released
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSpec {
    /// Initialize a work item under the job's task generation
    InitializeWorkItem { payload: Option<Value> },

    /// Initialize a child workflow under the job's task generation
    InitializeWorkflow {
        child_name: String,
        payload: Option<Value>,
    },
}

// ============================================================================
// Audit
// ============================================================================

/// Resource family a span refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Workflow,
    Task,
    WorkItem,
    Condition,
    WorkflowActivity,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Task => write!(f, "task"),
            Self::WorkItem => write!(f, "work_item"),
            Self::Condition => write!(f, "condition"),
            Self::WorkflowActivity => write!(f, "workflow_activity"),
        }
    }
}

impl From<&str> for ResourceType {
    fn from(s: &str) -> Self {
        match s {
            "task" => Self::Task,
            "work_item" => Self::WorkItem,
            "condition" => Self::Condition,
            "workflow_activity" => Self::WorkflowActivity,
            _ => Self::Workflow,
        }
    }
}

/// Mutation spans are written by state transitions, query spans by reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Mutation,
    Query,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mutation => write!(f, "mutation"),
            Self::Query => write!(f, "query"),
        }
    }
}

/// Immutable audit record of one state transition.
///
/// Spans form a tree per transaction (`parent_span_id`); the root span is the
/// triggering API call. `trace_id` is the id of the root workflow, so a
/// parent and all of its descendants share one trace while `workflow_id`
/// pins each span to exactly one workflow for reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSpanRow {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    /// Engine-wide monotonic write order. Timestamps have millisecond
    /// resolution; the sequence breaks ties so reconstruction folds spans in
    /// the exact order they were written.
    pub sequence: i64,
    pub parent_span_id: Option<Uuid>,
    pub operation_type: OperationType,
    /// Transition name, e.g. `Task.enable` or `Condition.incrementMarking`
    pub operation: String,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub resource_name: String,
    pub workflow_id: Uuid,
    pub task_generation: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Decision metadata: join/split kinds, marking deltas, routes
    pub attributes: Value,
}

/// Periodic reconstruction snapshot; bounds time-travel replay cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub workflow_id: Uuid,
    pub taken_at: DateTime<Utc>,
    /// Span-sequence watermark: replay resumes with spans after this one
    pub sequence: i64,
    /// Serialized `WorkflowStateView`
    pub state: Value,
}

// ============================================================================
// Append-only state logs
// ============================================================================

/// Append-only task state log, keyed by (workflow, name, generation, state).
/// Backs the generation-aware queries without scanning audit spans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateLogRow {
    pub workflow_id: Uuid,
    pub task_name: String,
    pub generation: u32,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
}

/// Append-only workflow state log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStateLogRow {
    pub workflow_id: Uuid,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_roundtrip_through_display() {
        for state in [
            TaskState::Disabled,
            TaskState::Enabled,
            TaskState::Started,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
        ] {
            assert_eq!(TaskState::from(state.to_string().as_str()), state);
        }

        for state in [
            WorkflowState::Initialized,
            WorkflowState::Started,
            WorkflowState::Completed,
            WorkflowState::Failed,
            WorkflowState::Canceled,
        ] {
            assert_eq!(WorkflowState::from(state.to_string().as_str()), state);
        }
    }

    #[test]
    fn test_finalized_states_are_terminal() {
        assert!(WorkflowState::Completed.is_final());
        assert!(WorkflowState::Canceled.is_final());
        assert!(!WorkflowState::Started.is_final());

        assert!(TaskState::Failed.is_final());
        assert!(!TaskState::Enabled.is_final());
        assert!(TaskState::Enabled.is_active());
        assert!(!TaskState::Disabled.is_active());

        assert!(WorkItemState::Canceled.is_final());
        assert!(!WorkItemState::Initialized.is_final());
    }

    #[test]
    fn test_job_spec_serialization() {
        let spec = JobSpec::InitializeWorkItem {
            payload: Some(json!({"attempt": 2})),
        };

        let encoded = serde_json::to_string(&spec).unwrap();
        assert!(encoded.contains("\"type\":\"initialize_work_item\""));

        let parsed: JobSpec = serde_json::from_str(&encoded).unwrap();
        assert_eq!(spec, parsed);
    }
}
