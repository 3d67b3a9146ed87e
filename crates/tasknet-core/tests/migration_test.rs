// Version migration: fast-forward replay of completed tasks, halting at
// tasks whose migrator chooses to continue, and trace chaining.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use common::{latest_task, run_task, SpawnOne};
use tasknet_core::{
    EngineError, ExecutionMode, MemoryStore, Migration, MigrationAction, MigrationScope, Registry,
    Result, TaskBuilder, TaskMigrator, TaskState, VersionManager, FastForwardCompleted,
    WorkItemTarget, WorkflowBuilder, WorkflowDefinition, WorkflowEngine, WorkflowState,
};

struct AlwaysContinue;

#[async_trait]
impl TaskMigrator for AlwaysContinue {
    async fn migrate(&self, _scope: &MigrationScope) -> Result<MigrationAction> {
        Ok(MigrationAction::Continue)
    }
}

fn order_v1() -> WorkflowDefinition {
    WorkflowBuilder::new("order")
        .start("start")
        .end("end")
        .condition("mid")
        .task(TaskBuilder::new("a").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("b").activities(Arc::new(SpawnOne)))
        .flow("start", "a")
        .flow("a", "mid")
        .flow("mid", "b")
        .flow("b", "end")
        .build()
        .unwrap()
}

fn order_v2() -> WorkflowDefinition {
    WorkflowBuilder::new("order")
        .start("start")
        .end("end")
        .condition("mid")
        .condition("mid2")
        .task(TaskBuilder::new("a").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("b").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("c").activities(Arc::new(SpawnOne)))
        .flow("start", "a")
        .flow("a", "mid")
        .flow("mid", "b")
        .flow("b", "mid2")
        .flow("mid2", "c")
        .flow("c", "end")
        .build()
        .unwrap()
}

fn migration_engine() -> (WorkflowEngine, Arc<MemoryStore>) {
    let manager = VersionManager::new("order")
        .version("v1", order_v1())
        .version("v2", order_v2())
        .migration(
            Migration::new("v1", "v2")
                .task_migrator("order/a", Arc::new(FastForwardCompleted))
                .task_migrator("order/b", Arc::new(AlwaysContinue))
                .task_migrator("order/c", Arc::new(AlwaysContinue)),
        );

    let mut registry = Registry::new();
    registry.register(manager);
    let store = Arc::new(MemoryStore::new());
    (WorkflowEngine::new(store.clone(), registry), store)
}

// ============================================================================
// Fast-forward the completed task, halt at the next, leave the rest disabled
// ============================================================================

#[tokio::test]
async fn test_migration_fast_forwards_completed_work() {
    let (engine, store) = migration_engine();
    let old = engine
        .initialize_root_workflow("order", Some("v1"), None)
        .await
        .unwrap();

    run_task(&engine, old, "a", json!({"approved": true})).await;

    let new = engine.migrate(old, "v2").await.unwrap();
    assert_ne!(new, old);

    // the source workflow was canceled with its live rows
    let old_row = engine.workflow_by_id(old).await.unwrap().unwrap();
    assert_eq!(old_row.state, WorkflowState::Canceled);
    assert_eq!(
        latest_task(&store, old, "b").await.unwrap().state,
        TaskState::Canceled
    );

    // the new workflow chains back to the old one and runs normally again
    let new_row = engine.workflow_by_id(new).await.unwrap().unwrap();
    assert_eq!(new_row.version_name, "v2");
    assert_eq!(new_row.migration_from_workflow_id, Some(old));
    assert_eq!(new_row.execution_mode, ExecutionMode::Normal);

    // fast-forward preservation: A replayed as completed with its split
    // applied, B halted the replay, C never became reachable
    assert_eq!(
        latest_task(&store, new, "a").await.unwrap().state,
        TaskState::Completed
    );
    assert_eq!(
        latest_task(&store, new, "b").await.unwrap().state,
        TaskState::Enabled
    );
    assert_eq!(
        latest_task(&store, new, "c").await.unwrap().state,
        TaskState::Disabled
    );

    // B's activity ran in fast-forward mode and skipped its side effects;
    // normal operation initializes work items through the facade
    let item = engine
        .initialize_work_item(
            WorkItemTarget {
                path: vec!["order".to_string(), "b".to_string()],
                parent_workflow_id: new,
                parent_task_name: "b".to_string(),
            },
            None,
        )
        .await
        .unwrap();
    engine.start_work_item(item, json!({})).await.unwrap();
    engine.complete_work_item(item, json!({})).await.unwrap();

    // C enabled normally, with its activity side effects
    assert_eq!(
        latest_task(&store, new, "c").await.unwrap().state,
        TaskState::Enabled
    );
    run_task(&engine, new, "c", json!({})).await;

    assert_eq!(
        engine.workflow_by_id(new).await.unwrap().unwrap().state,
        WorkflowState::Completed
    );
}

#[tokio::test]
async fn test_migration_requires_adjacent_chain() {
    let (engine, _store) = migration_engine();
    let wf = engine
        .initialize_root_workflow("order", Some("v1"), None)
        .await
        .unwrap();

    let err = engine.migrate(wf, "v9").await.unwrap_err();
    assert!(matches!(err, EngineError::MigrationChainNotFound { .. }));
    assert_eq!(err.code(), "MIGRATION_CHAIN_NOT_FOUND");

    // nothing committed: the workflow is untouched
    assert_eq!(
        engine.workflow_by_id(wf).await.unwrap().unwrap().state,
        WorkflowState::Initialized
    );
}

#[tokio::test]
async fn test_migrating_to_current_version_is_a_no_op() {
    let (engine, _store) = migration_engine();
    let wf = engine
        .initialize_root_workflow("order", Some("v2"), None)
        .await
        .unwrap();

    let result = engine.migrate(wf, "v2").await.unwrap();
    assert_eq!(result, wf);
}
