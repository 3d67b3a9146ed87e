// Fluent builder for workflow definitions
//
// The builder collects conditions, tasks, and flow arcs as plain data, then
// validates the structure in one pass at build() time: unique names, arcs
// that connect a condition to a task (or back), reachability from start,
// end reachable from every task, and a route callback wherever an xor split
// has more than one output.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::definition::{
    AnyPayload, ChildRef, ConditionDef, DefaultActivities, JoinKind, SplitKind, SplitRouter,
    TaskActivities, TaskDef, TaskKind, Validator, WorkItemAction, WorkflowDefinition,
};
use crate::entities::ConditionKind;
use crate::error::DefinitionError;

/// Builder for one task of a definition
pub struct TaskBuilder {
    name: String,
    kind: TaskKind,
    join: JoinKind,
    split: SplitKind,
    activities: Arc<dyn TaskActivities>,
    router: Option<Arc<dyn SplitRouter>>,
    action: WorkItemAction,
}

impl TaskBuilder {
    /// An atomic task executed through work items
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Atomic,
            join: JoinKind::And,
            split: SplitKind::And,
            activities: Arc::new(DefaultActivities),
            router: None,
            action: WorkItemAction::default(),
        }
    }

    /// A composite task executed through one child workflow type
    pub fn composite(name: impl Into<String>, child: ChildRef) -> Self {
        let mut builder = Self::new(name);
        builder.kind = TaskKind::Composite(child);
        builder
    }

    /// A dynamic composite task: deferred choice between candidate children
    pub fn dynamic(name: impl Into<String>, children: Vec<ChildRef>) -> Self {
        let mut builder = Self::new(name);
        builder.kind = TaskKind::DynamicComposite(children);
        builder
    }

    /// A dummy task: no work, fires enable-to-complete in one step
    pub fn dummy(name: impl Into<String>) -> Self {
        let mut builder = Self::new(name);
        builder.kind = TaskKind::Dummy;
        builder
    }

    pub fn join(mut self, join: JoinKind) -> Self {
        self.join = join;
        self
    }

    pub fn split(mut self, split: SplitKind) -> Self {
        self.split = split;
        self
    }

    pub fn activities(mut self, activities: Arc<dyn TaskActivities>) -> Self {
        self.activities = activities;
        self
    }

    pub fn router(mut self, router: Arc<dyn SplitRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn action(mut self, action: WorkItemAction) -> Self {
        self.action = action;
        self
    }
}

/// Fluent builder producing a validated `WorkflowDefinition`
pub struct WorkflowBuilder {
    name: String,
    start: Option<String>,
    end: Option<String>,
    conditions: Vec<String>,
    tasks: Vec<TaskBuilder>,
    flows: Vec<(String, String)>,
    initialize_validator: Arc<dyn Validator>,
    cancel_validator: Arc<dyn Validator>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: None,
            end: None,
            conditions: Vec::new(),
            tasks: Vec::new(),
            flows: Vec::new(),
            initialize_validator: Arc::new(AnyPayload),
            cancel_validator: Arc::new(AnyPayload),
        }
    }

    /// Declare the start condition
    pub fn start(mut self, name: impl Into<String>) -> Self {
        self.start = Some(name.into());
        self
    }

    /// Declare the end condition
    pub fn end(mut self, name: impl Into<String>) -> Self {
        self.end = Some(name.into());
        self
    }

    /// Declare an intermediate condition
    pub fn condition(mut self, name: impl Into<String>) -> Self {
        self.conditions.push(name.into());
        self
    }

    /// Declare a task
    pub fn task(mut self, task: TaskBuilder) -> Self {
        self.tasks.push(task);
        self
    }

    /// Declare a flow arc. One side must be a condition, the other a task;
    /// direction is inferred at build time.
    pub fn flow(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.flows.push((from.into(), to.into()));
        self
    }

    /// Validator applied to the payload of `initialize_root_workflow`
    pub fn initialize_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.initialize_validator = validator;
        self
    }

    /// Validator applied to the payload of `cancel_root_workflow`
    pub fn cancel_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.cancel_validator = validator;
        self
    }

    /// Validate the structure and produce the definition
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        let start = self
            .start
            .ok_or_else(|| DefinitionError::MissingStartCondition(self.name.clone()))?;
        let end = self
            .end
            .ok_or_else(|| DefinitionError::MissingEndCondition(self.name.clone()))?;

        // Collect condition names, uniqueness across conditions and tasks
        let mut condition_names: BTreeSet<String> = BTreeSet::new();
        for name in [start.clone(), end.clone()]
            .into_iter()
            .chain(self.conditions.iter().cloned())
        {
            if !condition_names.insert(name.clone()) {
                return Err(DefinitionError::DuplicateName(name));
            }
        }

        let mut task_names: BTreeSet<String> = BTreeSet::new();
        for task in &self.tasks {
            if condition_names.contains(&task.name) || !task_names.insert(task.name.clone()) {
                return Err(DefinitionError::DuplicateName(task.name.clone()));
            }
        }

        // Classify arcs: condition -> task or task -> condition
        let mut cond_outputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut cond_inputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut task_inputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut task_outputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (from, to) in &self.flows {
            if condition_names.contains(from) && task_names.contains(to) {
                cond_outputs.entry(from.clone()).or_default().insert(to.clone());
                task_inputs.entry(to.clone()).or_default().insert(from.clone());
            } else if task_names.contains(from) && condition_names.contains(to) {
                task_outputs.entry(from.clone()).or_default().insert(to.clone());
                cond_inputs.entry(to.clone()).or_default().insert(from.clone());
            } else {
                return Err(DefinitionError::UnknownArcTarget {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }

        // XOR splits with multiple outputs require a route callback
        for task in &self.tasks {
            let fanout = task_outputs.get(&task.name).map(BTreeSet::len).unwrap_or(0);
            if task.split == SplitKind::Xor && fanout > 1 && task.router.is_none() {
                return Err(DefinitionError::MissingRouteCallback(task.name.clone()));
            }
        }

        // Forward reachability from start
        let mut reachable: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        reachable.insert(start.as_str());
        queue.push_back(start.as_str());
        while let Some(node) = queue.pop_front() {
            let next = cond_outputs
                .get(node)
                .into_iter()
                .chain(task_outputs.get(node))
                .flatten();
            for target in next {
                if reachable.insert(target.as_str()) {
                    queue.push_back(target.as_str());
                }
            }
        }

        for name in condition_names.iter().chain(task_names.iter()) {
            if !reachable.contains(name.as_str()) {
                return Err(DefinitionError::UnreachableNode(name.clone()));
            }
        }

        // Backward reachability from end: every task must be able to reach it
        let mut coreachable: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        coreachable.insert(end.as_str());
        queue.push_back(end.as_str());
        while let Some(node) = queue.pop_front() {
            let prev = cond_inputs
                .get(node)
                .into_iter()
                .chain(task_inputs.get(node))
                .flatten();
            for source in prev {
                if coreachable.insert(source.as_str()) {
                    queue.push_back(source.as_str());
                }
            }
        }

        for name in &task_names {
            if !coreachable.contains(name.as_str()) {
                return Err(DefinitionError::EndNotReachable(name.clone()));
            }
        }

        // Assemble the definition
        let mut conditions = BTreeMap::new();
        for name in &condition_names {
            let kind = if *name == start {
                ConditionKind::Start
            } else if *name == end {
                ConditionKind::End
            } else {
                ConditionKind::Intermediate
            };
            conditions.insert(
                name.clone(),
                ConditionDef {
                    name: name.clone(),
                    kind,
                    inputs: cond_inputs
                        .remove(name)
                        .map(|s| s.into_iter().collect())
                        .unwrap_or_default(),
                    outputs: cond_outputs
                        .remove(name)
                        .map(|s| s.into_iter().collect())
                        .unwrap_or_default(),
                },
            );
        }

        let mut tasks = BTreeMap::new();
        for task in self.tasks {
            let name = task.name.clone();
            tasks.insert(
                name.clone(),
                TaskDef {
                    name: name.clone(),
                    kind: task.kind,
                    join: task.join,
                    split: task.split,
                    activities: task.activities,
                    router: task.router,
                    action: task.action,
                    inputs: task_inputs
                        .remove(&name)
                        .map(|s| s.into_iter().collect())
                        .unwrap_or_default(),
                    outputs: task_outputs
                        .remove(&name)
                        .map(|s| s.into_iter().collect())
                        .unwrap_or_default(),
                },
            );
        }

        Ok(WorkflowDefinition {
            name: self.name,
            conditions,
            tasks,
            start,
            end,
            initialize_validator: self.initialize_validator,
            cancel_validator: self.cancel_validator,
        })
    }
}
