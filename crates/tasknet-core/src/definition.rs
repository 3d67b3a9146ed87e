// Workflow definitions
//
// A definition is the declarative schema of one workflow version: named
// conditions, tasks with join/split behavior, the flow arcs between them,
// and the user callbacks (activities, routers, policies, validators) the
// firing engine invokes. Definitions are immutable after build and shared
// behind Arc; composite tasks reference child definitions by name, resolved
// through the registry at runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ActivityScope, RouteContext};
use crate::entities::{ConditionKind, WorkItemRow, WorkflowRow};
use crate::error::Result;

// ============================================================================
// Join / split kinds
// ============================================================================

/// Rule for consuming input tokens when a task enables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// All input conditions must hold a token; one is consumed from each
    And,
    /// Exactly one input condition holds a token; that one is consumed
    Xor,
    /// Waits until no further input token can arrive, then consumes all
    Or,
}

impl std::fmt::Display for JoinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::And => write!(f, "and"),
            Self::Xor => write!(f, "xor"),
            Self::Or => write!(f, "or"),
        }
    }
}

/// Rule for producing output tokens when a task completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKind {
    /// A token is placed on every output condition
    And,
    /// The route callback picks exactly one output condition
    Xor,
}

impl std::fmt::Display for SplitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::And => write!(f, "and"),
            Self::Xor => write!(f, "xor"),
        }
    }
}

// ============================================================================
// Task kinds
// ============================================================================

/// Reference to a child workflow definition, resolved through the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub name: String,
    /// Pin a specific version; `None` resolves the latest registered one
    pub version: Option<String>,
}

impl ChildRef {
    /// Reference the latest registered version of a definition
    pub fn latest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// Reference a pinned version of a definition
    pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }
}

/// What a task executes when it runs
#[derive(Clone)]
pub enum TaskKind {
    /// Work happens through work items
    Atomic,
    /// Work happens through exactly one child workflow type
    Composite(ChildRef),
    /// Deferred choice between several candidate child workflow types
    DynamicComposite(Vec<ChildRef>),
    /// No work; enable and complete in one firing step (pure join/split node)
    Dummy,
}

impl TaskKind {
    /// Candidate child definitions, empty for atomic and dummy tasks
    pub fn children(&self) -> &[ChildRef] {
        match self {
            Self::Composite(child) => std::slice::from_ref(child),
            Self::DynamicComposite(children) => children,
            _ => &[],
        }
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, Self::Dummy)
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_) | Self::DynamicComposite(_))
    }
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Atomic => write!(f, "Atomic"),
            Self::Composite(c) => write!(f, "Composite({})", c.name),
            Self::DynamicComposite(cs) => {
                write!(f, "DynamicComposite(")?;
                for (i, c) in cs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", c.name)?;
                }
                write!(f, ")")
            }
            Self::Dummy => write!(f, "Dummy"),
        }
    }
}

// ============================================================================
// Validators
// ============================================================================

/// Opaque payload validation. The engine never interprets payloads; each
/// action declares a validator that either normalizes the input or rejects it.
pub trait Validator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<Value>;
}

/// Passthrough validator; accepts anything
pub struct AnyPayload;

impl Validator for AnyPayload {
    fn validate(&self, payload: &Value) -> Result<Value> {
        Ok(payload.clone())
    }
}

// ============================================================================
// Work-item action
// ============================================================================

/// Handlers run when a work item starts or completes, inside the same
/// transaction as the state transition
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    async fn on_start(&self, _scope: &mut ActivityScope<'_>, _payload: &Value) -> Result<()> {
        Ok(())
    }

    async fn on_complete(&self, _scope: &mut ActivityScope<'_>, _payload: &Value) -> Result<()> {
        Ok(())
    }
}

/// No-op handler
pub struct NoopHandler;

#[async_trait]
impl WorkItemHandler for NoopHandler {}

/// The action triple of an atomic task: payload schemas for start/complete
/// plus the handlers that run on those transitions
#[derive(Clone)]
pub struct WorkItemAction {
    pub start_validator: Arc<dyn Validator>,
    pub complete_validator: Arc<dyn Validator>,
    pub handler: Arc<dyn WorkItemHandler>,
}

impl Default for WorkItemAction {
    fn default() -> Self {
        Self {
            start_validator: Arc::new(AnyPayload),
            complete_validator: Arc::new(AnyPayload),
            handler: Arc::new(NoopHandler),
        }
    }
}

impl WorkItemAction {
    pub fn with_handler(handler: Arc<dyn WorkItemHandler>) -> Self {
        Self {
            handler,
            ..Default::default()
        }
    }
}

// ============================================================================
// Policies
// ============================================================================

/// Finalization decision for a task after one of its instances (work item or
/// child workflow) reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Keep waiting
    Continue,
    /// Finalize the task as completed; unfinalized instances are canceled
    Complete,
    /// Finalize the task as failed; the failure cascades
    Fail,
}

/// Counts over the instances of one task generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    /// Initialized or started
    pub active: usize,
}

/// Everything a policy callback sees. Exactly one of `work_items` /
/// `workflows` is populated, depending on the task kind.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub task_name: String,
    pub generation: u32,
    pub stats: InstanceStats,
    pub work_items: Vec<WorkItemRow>,
    pub workflows: Vec<WorkflowRow>,
}

/// The default finalization policy: fail on the first failed instance,
/// complete once nothing is active and at least one instance completed,
/// otherwise keep waiting. Canceled instances never satisfy completion on
/// their own.
pub fn default_policy(stats: &InstanceStats) -> PolicyDecision {
    if stats.failed > 0 {
        PolicyDecision::Fail
    } else if stats.active == 0 && stats.completed > 0 {
        PolicyDecision::Complete
    } else {
        PolicyDecision::Continue
    }
}

// ============================================================================
// Activities
// ============================================================================

/// Per-task lifecycle callbacks. All methods default to no-ops; implementors
/// override what they need. Callbacks receive an `ActivityScope` bound to the
/// task generation that is transitioning; side effects registered on the
/// scope (work items, child workflows, scheduled jobs) are applied by the
/// engine after the callback returns, inside the same transaction.
///
/// In fast-forward mode callbacks still run but must skip user side effects;
/// check `scope.execution_mode()`.
#[async_trait]
pub trait TaskActivities: Send + Sync {
    async fn on_enabled(&self, _scope: &mut ActivityScope<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_started(&self, _scope: &mut ActivityScope<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_completed(&self, _scope: &mut ActivityScope<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_failed(&self, _scope: &mut ActivityScope<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_canceled(&self, _scope: &mut ActivityScope<'_>) -> Result<()> {
        Ok(())
    }

    /// Finalization decision after any instance of the task finalizes
    async fn policy(&self, ctx: &PolicyContext) -> Result<PolicyDecision> {
        Ok(default_policy(&ctx.stats))
    }
}

/// All-default activities, used by dummy and pure join/split tasks
pub struct DefaultActivities;

#[async_trait]
impl TaskActivities for DefaultActivities {}

/// Route choice for XOR splits with multiple outputs. Returns the name of
/// the single output condition to receive a token; `None` raises
/// `RouteEmpty`.
#[async_trait]
pub trait SplitRouter: Send + Sync {
    async fn route(&self, ctx: &RouteContext) -> Result<Option<String>>;
}

// ============================================================================
// Definition
// ============================================================================

/// One task of a definition, fully resolved by the builder
#[derive(Clone)]
pub struct TaskDef {
    pub name: String,
    pub kind: TaskKind,
    pub join: JoinKind,
    pub split: SplitKind,
    pub activities: Arc<dyn TaskActivities>,
    pub router: Option<Arc<dyn SplitRouter>>,
    pub action: WorkItemAction,
    /// Input condition names, ascending
    pub inputs: Vec<String>,
    /// Output condition names, ascending
    pub outputs: Vec<String>,
}

/// One condition of a definition
#[derive(Debug, Clone)]
pub struct ConditionDef {
    pub name: String,
    pub kind: ConditionKind,
    /// Tasks feeding this condition, ascending
    pub inputs: Vec<String>,
    /// Tasks this condition feeds, ascending
    pub outputs: Vec<String>,
}

/// A validated workflow definition. Built by `WorkflowBuilder`; immutable.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    /// BTreeMap keeps iteration in ascending name order, which the firing
    /// engine relies on for deterministic enablement
    pub conditions: BTreeMap<String, ConditionDef>,
    pub tasks: BTreeMap<String, TaskDef>,
    pub start: String,
    pub end: String,
    pub initialize_validator: Arc<dyn Validator>,
    pub cancel_validator: Arc<dyn Validator>,
}

impl WorkflowDefinition {
    pub fn task(&self, name: &str) -> Option<&TaskDef> {
        self.tasks.get(name)
    }

    pub fn condition(&self, name: &str) -> Option<&ConditionDef> {
        self.conditions.get(name)
    }

    /// Tasks fed by a condition, ascending by name
    pub fn downstream_tasks(&self, condition: &str) -> &[String] {
        self.conditions
            .get(condition)
            .map(|c| c.outputs.as_slice())
            .unwrap_or(&[])
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("conditions", &self.conditions.keys().collect::<Vec<_>>())
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_decisions() {
        let waiting = InstanceStats {
            total: 2,
            active: 1,
            completed: 1,
            ..Default::default()
        };
        assert_eq!(default_policy(&waiting), PolicyDecision::Continue);

        let done = InstanceStats {
            total: 2,
            completed: 2,
            ..Default::default()
        };
        assert_eq!(default_policy(&done), PolicyDecision::Complete);

        let failed = InstanceStats {
            total: 2,
            completed: 1,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(default_policy(&failed), PolicyDecision::Fail);

        // all canceled: no completion evidence, keep waiting
        let canceled = InstanceStats {
            total: 2,
            canceled: 2,
            ..Default::default()
        };
        assert_eq!(default_policy(&canceled), PolicyDecision::Continue);
    }

    #[test]
    fn test_child_refs() {
        let kind = TaskKind::DynamicComposite(vec![
            ChildRef::latest("workflow_a"),
            ChildRef::pinned("workflow_b", "v2"),
        ]);
        assert_eq!(kind.children().len(), 2);
        assert!(kind.is_composite());
        assert!(!TaskKind::Atomic.is_composite());
    }
}
