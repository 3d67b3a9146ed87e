// Error types for the workflow engine
//
// Two layers: DefinitionError fails a build() call at definition time,
// EngineError covers everything raised while executing workflows. External
// callers get a stable `code()` plus the Display message; internal causes
// travel through audit attributes, not the error surface.

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Structural errors raised while building a workflow definition
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// A condition or task cannot be reached from the start condition
    #[error("unreachable node: {0}")]
    UnreachableNode(String),

    /// An arc references a condition or task that does not exist
    #[error("unknown arc target: {from} -> {to}")]
    UnknownArcTarget { from: String, to: String },

    /// An XOR split with multiple outputs has no route callback
    #[error("task {0} has an xor split with multiple outputs but no route callback")]
    MissingRouteCallback(String),

    /// Two conditions or two tasks share a name
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// The definition has no start condition
    #[error("definition {0} has no start condition")]
    MissingStartCondition(String),

    /// The definition has no end condition
    #[error("definition {0} has no end condition")]
    MissingEndCondition(String),

    /// The end condition cannot be reached from a task
    #[error("end condition is not reachable from task {0}")]
    EndNotReachable(String),
}

/// Errors raised while executing workflows
#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Not-found errors (row missing or generation stale)
    // =========================================================================
    /// Workflow row does not exist
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Task row does not exist, or the referenced generation is stale
    #[error("task not found: {task} (workflow {workflow_id})")]
    TaskNotFound { workflow_id: Uuid, task: String },

    /// Work item row does not exist
    #[error("work item not found: {0}")]
    WorkItemNotFound(Uuid),

    /// Condition row does not exist
    #[error("condition not found: {condition} (workflow {workflow_id})")]
    ConditionNotFound { workflow_id: Uuid, condition: String },

    // =========================================================================
    // Invalid-state errors
    // =========================================================================
    /// Workflow is in a state that does not allow the transition
    #[error("invalid workflow state: {workflow_id} is {state}")]
    InvalidWorkflowState { workflow_id: Uuid, state: String },

    /// Task is in a state that does not allow the transition
    #[error("invalid task state: {task} is {state}")]
    InvalidTaskState { task: String, state: String },

    /// Work item is in a state that does not allow the transition
    #[error("invalid work item state: {work_item_id} is {state}")]
    InvalidWorkItemState { work_item_id: Uuid, state: String },

    // =========================================================================
    // Payload errors
    // =========================================================================
    /// A payload validator rejected the input
    #[error("payload validation failed: {0}")]
    PayloadValidation(String),

    // =========================================================================
    // Policy errors (defensive invariants of the firing engine)
    // =========================================================================
    /// An XOR split route callback returned no choice
    #[error("route callback for task {0} returned no output condition")]
    RouteEmpty(String),

    /// More than one input condition of an XOR join holds a token
    #[error("xor join for task {0} is ambiguous: multiple inputs are marked")]
    XorJoinAmbiguous(String),

    /// An AND join was fired without all inputs marked
    #[error("and join for task {0} fired while unsatisfied")]
    AndJoinUnsatisfied(String),

    /// A condition marking would go below zero
    #[error("marking underflow on condition {condition} (workflow {workflow_id})")]
    MarkingUnderflow { workflow_id: Uuid, condition: String },

    // =========================================================================
    // Definition / version lookup errors
    // =========================================================================
    /// No version manager registered under the workflow name
    #[error("unknown workflow definition: {0}")]
    UnknownDefinition(String),

    /// The version manager has no version with this name
    #[error("unknown version {version} of workflow {name}")]
    UnknownVersion { name: String, version: String },

    // =========================================================================
    // Migration errors
    // =========================================================================
    /// No chain of adjacent migrations leads from the current to the target version
    #[error("no migration chain for {name}: {from} -> {to}")]
    MigrationChainNotFound {
        name: String,
        from: String,
        to: String,
    },

    /// A task migrator aborted the migration
    #[error("migration halted by task migrator for {0}")]
    MigrationHalted(String),

    // =========================================================================
    // Infrastructure
    // =========================================================================
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A user activity callback failed
    #[error("activity error: {0}")]
    Activity(#[from] anyhow::Error),

    /// Broken engine invariant
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable user-facing error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::WorkItemNotFound(_) => "WORK_ITEM_NOT_FOUND",
            Self::ConditionNotFound { .. } => "CONDITION_NOT_FOUND",
            Self::InvalidWorkflowState { .. } => "INVALID_WORKFLOW_STATE",
            Self::InvalidTaskState { .. } => "INVALID_TASK_STATE",
            Self::InvalidWorkItemState { .. } => "INVALID_WORK_ITEM_STATE",
            Self::PayloadValidation(_) => "PAYLOAD_VALIDATION",
            Self::RouteEmpty(_) => "POLICY_ROUTE_EMPTY",
            Self::XorJoinAmbiguous(_) => "XOR_JOIN_AMBIGUOUS",
            Self::AndJoinUnsatisfied(_) => "AND_JOIN_UNSATISFIED",
            Self::MarkingUnderflow { .. } => "MARKING_UNDERFLOW",
            Self::UnknownDefinition(_) => "UNKNOWN_DEFINITION",
            Self::UnknownVersion { .. } => "UNKNOWN_VERSION",
            Self::MigrationChainNotFound { .. } => "MIGRATION_CHAIN_NOT_FOUND",
            Self::MigrationHalted(_) => "MIGRATION_HALTED",
            Self::Store(_) => "STORE",
            Self::Activity(_) => "ACTIVITY",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Create a payload validation error
    pub fn payload(msg: impl Into<String>) -> Self {
        EngineError::PayloadValidation(msg.into())
    }

    /// Create a task-not-found error
    pub fn task_not_found(workflow_id: Uuid, task: impl Into<String>) -> Self {
        EngineError::TaskNotFound {
            workflow_id,
            task: task.into(),
        }
    }

    /// Create a condition-not-found error
    pub fn condition_not_found(workflow_id: Uuid, condition: impl Into<String>) -> Self {
        EngineError::ConditionNotFound {
            workflow_id,
            condition: condition.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = EngineError::WorkflowNotFound(Uuid::nil());
        assert_eq!(err.code(), "WORKFLOW_NOT_FOUND");

        let err = EngineError::XorJoinAmbiguous("approve".to_string());
        assert_eq!(err.code(), "XOR_JOIN_AMBIGUOUS");
        assert!(err.to_string().contains("approve"));
    }
}
