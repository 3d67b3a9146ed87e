// Version management
//
// A VersionManager holds the ordered versions of one workflow name plus the
// directed migrations between adjacent versions. The Registry maps workflow
// names to managers and is passed explicitly to the engine — there is no
// process-wide registry. Composite tasks resolve their child definitions
// through the registry by name at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::definition::{ChildRef, WorkflowDefinition};
use crate::entities::{TaskRow, WorkItemRow, WorkflowRow};
use crate::error::{EngineError, Result};
use crate::store::StoreTx;

// ============================================================================
// Task migrators
// ============================================================================

/// What the engine does with a task during fast-forward replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationAction {
    /// Mark the task completed with the recorded outcome and re-apply the
    /// split, as if it had run
    FastForward(FastForwardOutcome),
    /// Stop fast-forwarding here; the task is left enabled for normal
    /// operation
    Continue,
}

/// Outcome used when a task is fast-forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastForwardOutcome {
    /// Output condition to receive the token for an xor split; `None` for
    /// and splits (every output receives one)
    pub route: Option<String>,
    /// Re-parent the old generation's finalized child workflows onto the new
    /// task generation (composite tasks only)
    pub adopt_children: bool,
}

impl Default for FastForwardOutcome {
    fn default() -> Self {
        Self {
            route: None,
            adopt_children: true,
        }
    }
}

impl FastForwardOutcome {
    /// Fast-forward an and-split task
    pub fn and_split() -> Self {
        Self::default()
    }

    /// Fast-forward an xor-split task, re-applying the recorded route
    pub fn routed(condition: impl Into<String>) -> Self {
        Self {
            route: Some(condition.into()),
            ..Default::default()
        }
    }
}

/// Everything a task migrator sees: the counterpart task of the old run with
/// its work items and child workflows
#[derive(Debug, Clone)]
pub struct MigrationScope {
    pub new_workflow_id: uuid::Uuid,
    pub task_name: String,
    /// Latest generation of the counterpart task in the old run, if any
    pub old_task: Option<TaskRow>,
    pub old_work_items: Vec<WorkItemRow>,
    pub old_workflows: Vec<WorkflowRow>,
}

impl MigrationScope {
    /// Whether the old run completed this task
    pub fn old_task_completed(&self) -> bool {
        self.old_task
            .as_ref()
            .is_some_and(|t| t.state == crate::entities::TaskState::Completed)
    }

    /// Payload of the completed work item, newest first wins
    pub fn completed_payload(&self) -> Option<&serde_json::Value> {
        self.old_work_items
            .iter()
            .rev()
            .filter(|w| w.state == crate::entities::WorkItemState::Completed)
            .find_map(|w| w.payload.as_ref())
    }
}

/// Called once per task of the new definition that has a counterpart in the
/// old one, in topological order
#[async_trait]
pub trait TaskMigrator: Send + Sync {
    async fn migrate(&self, scope: &MigrationScope) -> Result<MigrationAction>;
}

/// Migrator that fast-forwards completed tasks with the default outcome and
/// continues otherwise
pub struct FastForwardCompleted;

#[async_trait]
impl TaskMigrator for FastForwardCompleted {
    async fn migrate(&self, scope: &MigrationScope) -> Result<MigrationAction> {
        if scope.old_task_completed() {
            Ok(MigrationAction::FastForward(FastForwardOutcome::default()))
        } else {
            Ok(MigrationAction::Continue)
        }
    }
}

/// Hook run around a migration hop with both workflow rows and the open
/// transaction (for host tables)
#[async_trait]
pub trait MigrationHook: Send + Sync {
    async fn run(
        &self,
        tx: &mut dyn StoreTx,
        old: &WorkflowRow,
        new: &WorkflowRow,
    ) -> Result<()>;
}

// ============================================================================
// Migrations
// ============================================================================

/// Directed migration between two adjacent versions
pub struct Migration {
    pub from: String,
    pub to: String,
    pub initializer: Option<Arc<dyn MigrationHook>>,
    pub finalizer: Option<Arc<dyn MigrationHook>>,
    /// Keyed by `<workflowName>/<taskName>`
    pub task_migrators: HashMap<String, Arc<dyn TaskMigrator>>,
}

impl Migration {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            initializer: None,
            finalizer: None,
            task_migrators: HashMap::new(),
        }
    }

    pub fn initializer(mut self, hook: Arc<dyn MigrationHook>) -> Self {
        self.initializer = Some(hook);
        self
    }

    pub fn finalizer(mut self, hook: Arc<dyn MigrationHook>) -> Self {
        self.finalizer = Some(hook);
        self
    }

    /// Register a task migrator under `<workflowName>/<taskName>`
    pub fn task_migrator(
        mut self,
        task_key: impl Into<String>,
        migrator: Arc<dyn TaskMigrator>,
    ) -> Self {
        self.task_migrators.insert(task_key.into(), migrator);
        self
    }
}

// ============================================================================
// Version manager
// ============================================================================

/// Ordered versions of one workflow name plus the migrations between them
pub struct VersionManager {
    name: String,
    versions: Vec<(String, Arc<WorkflowDefinition>)>,
    migrations: Vec<Migration>,
}

impl VersionManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: Vec::new(),
            migrations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a version. Versions are ordered by registration.
    pub fn version(mut self, version_name: impl Into<String>, def: WorkflowDefinition) -> Self {
        self.versions.push((version_name.into(), Arc::new(def)));
        self
    }

    /// Register a migration between two adjacent versions
    pub fn migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Latest registered version
    pub fn latest(&self) -> Result<(&str, Arc<WorkflowDefinition>)> {
        self.versions
            .last()
            .map(|(name, def)| (name.as_str(), def.clone()))
            .ok_or_else(|| EngineError::UnknownDefinition(self.name.clone()))
    }

    /// Definition of a named version
    pub fn definition(&self, version_name: &str) -> Result<Arc<WorkflowDefinition>> {
        self.versions
            .iter()
            .find(|(name, _)| name == version_name)
            .map(|(_, def)| def.clone())
            .ok_or_else(|| EngineError::UnknownVersion {
                name: self.name.clone(),
                version: version_name.to_string(),
            })
    }

    fn version_index(&self, version_name: &str) -> Option<usize> {
        self.versions.iter().position(|(name, _)| name == version_name)
    }

    /// Chain of adjacent migrations leading from `from` to `to`
    pub fn migration_chain(&self, from: &str, to: &str) -> Result<Vec<&Migration>> {
        let not_found = || EngineError::MigrationChainNotFound {
            name: self.name.clone(),
            from: from.to_string(),
            to: to.to_string(),
        };

        let start = self.version_index(from).ok_or_else(not_found)?;
        let end = self.version_index(to).ok_or_else(not_found)?;
        if start >= end {
            return Err(not_found());
        }

        let mut chain = Vec::with_capacity(end - start);
        for hop in start..end {
            let (hop_from, _) = &self.versions[hop];
            let (hop_to, _) = &self.versions[hop + 1];
            let migration = self
                .migrations
                .iter()
                .find(|m| &m.from == hop_from && &m.to == hop_to)
                .ok_or_else(not_found)?;
            chain.push(migration);
        }
        Ok(chain)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Explicitly passed registry of version managers, one per workflow name
#[derive(Default)]
pub struct Registry {
    managers: HashMap<String, VersionManager>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a version manager under its workflow name
    pub fn register(&mut self, manager: VersionManager) {
        self.managers.insert(manager.name().to_string(), manager);
    }

    pub fn manager(&self, name: &str) -> Result<&VersionManager> {
        self.managers
            .get(name)
            .ok_or_else(|| EngineError::UnknownDefinition(name.to_string()))
    }

    /// Resolve a definition by name and version
    pub fn definition(&self, name: &str, version_name: &str) -> Result<Arc<WorkflowDefinition>> {
        self.manager(name)?.definition(version_name)
    }

    /// Resolve a child reference: pinned version or latest
    pub fn resolve_child(&self, child: &ChildRef) -> Result<(String, Arc<WorkflowDefinition>)> {
        let manager = self.manager(&child.name)?;
        match &child.version {
            Some(version) => Ok((version.clone(), manager.definition(version)?)),
            None => {
                let (version, def) = manager.latest()?;
                Ok((version.to_string(), def))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{TaskBuilder, WorkflowBuilder};

    fn def(name: &str) -> WorkflowDefinition {
        WorkflowBuilder::new(name)
            .start("start")
            .end("end")
            .task(TaskBuilder::new("a"))
            .flow("start", "a")
            .flow("a", "end")
            .build()
            .unwrap()
    }

    #[test]
    fn test_latest_and_named_lookup() {
        let manager = VersionManager::new("order")
            .version("v1", def("order"))
            .version("v2", def("order"));

        let (latest, _) = manager.latest().unwrap();
        assert_eq!(latest, "v2");
        assert!(manager.definition("v1").is_ok());
        assert!(matches!(
            manager.definition("v9"),
            Err(EngineError::UnknownVersion { .. })
        ));
    }

    #[test]
    fn test_migration_chain_walks_adjacent_hops() {
        let manager = VersionManager::new("order")
            .version("v1", def("order"))
            .version("v2", def("order"))
            .version("v3", def("order"))
            .migration(Migration::new("v1", "v2"))
            .migration(Migration::new("v2", "v3"));

        let chain = manager.migration_chain("v1", "v3").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].to, "v2");
        assert_eq!(chain[1].to, "v3");

        // backwards and missing hops are rejected
        assert!(manager.migration_chain("v3", "v1").is_err());
        let sparse = VersionManager::new("order")
            .version("v1", def("order"))
            .version("v2", def("order"));
        assert!(sparse.migration_chain("v1", "v2").is_err());
    }

    #[test]
    fn test_registry_resolves_children() {
        let mut registry = Registry::new();
        registry.register(
            VersionManager::new("diagnostics")
                .version("v1", def("diagnostics"))
                .version("v2", def("diagnostics")),
        );

        let (version, _) = registry.resolve_child(&ChildRef::latest("diagnostics")).unwrap();
        assert_eq!(version, "v2");

        let (version, _) = registry
            .resolve_child(&ChildRef::pinned("diagnostics", "v1"))
            .unwrap();
        assert_eq!(version, "v1");

        assert!(registry.resolve_child(&ChildRef::latest("missing")).is_err());
    }
}
