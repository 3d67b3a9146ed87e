// Work item state machine: multi-instance completion, reset-based retry,
// and immutability of finalized items.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use common::{latest_task, open_item, SpawnOne};
use tasknet_core::{
    ActivityScope, EngineError, ExecutionMode, MemoryStore, Registry, Result, TaskActivities,
    TaskBuilder, TaskState, Validator, VersionManager, WorkItemAction, WorkItemState,
    WorkflowBuilder, WorkflowDefinition, WorkflowEngine, WorkflowState,
};

/// Spawns two work items on enable (multi-instance task)
struct SpawnTwo;

#[async_trait]
impl TaskActivities for SpawnTwo {
    async fn on_enabled(&self, scope: &mut ActivityScope<'_>) -> Result<()> {
        if scope.execution_mode() == ExecutionMode::Normal {
            scope.initialize_work_item(Some(json!({"slot": 1})));
            scope.initialize_work_item(Some(json!({"slot": 2})));
        }
        Ok(())
    }
}

/// Requires an `amount` field in the payload
struct RequiresAmount;

impl Validator for RequiresAmount {
    fn validate(&self, payload: &serde_json::Value) -> Result<serde_json::Value> {
        if payload.get("amount").and_then(|a| a.as_u64()).is_none() {
            return Err(EngineError::payload("missing amount"));
        }
        Ok(payload.clone())
    }
}

fn engine_for(def: WorkflowDefinition) -> (WorkflowEngine, Arc<MemoryStore>) {
    let name = def.name.clone();
    let mut registry = Registry::new();
    registry.register(VersionManager::new(name).version("v1", def));
    let store = Arc::new(MemoryStore::new());
    (WorkflowEngine::new(store.clone(), registry), store)
}

fn two_item_def() -> WorkflowDefinition {
    WorkflowBuilder::new("batch")
        .start("start")
        .end("end")
        .task(TaskBuilder::new("work").activities(Arc::new(SpawnTwo)))
        .flow("start", "work")
        .flow("work", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_task_waits_for_all_work_items() {
    let (engine, store) = engine_for(two_item_def());
    let wf = engine
        .initialize_root_workflow("batch", None, None)
        .await
        .unwrap();

    let items = engine.workflow_task_work_items(wf, "work").await.unwrap();
    assert_eq!(items.len(), 2);

    // completing the first item leaves the task running
    engine.start_work_item(items[0].id, json!({})).await.unwrap();
    engine.complete_work_item(items[0].id, json!({})).await.unwrap();
    assert_eq!(
        latest_task(&store, wf, "work").await.unwrap().state,
        TaskState::Started
    );
    assert_eq!(
        engine.workflow_by_id(wf).await.unwrap().unwrap().state,
        WorkflowState::Started
    );

    // the multi-instance rule: one completed, none pending -> completed
    engine.cancel_work_item(items[1].id, None).await.unwrap();
    assert_eq!(
        latest_task(&store, wf, "work").await.unwrap().state,
        TaskState::Completed
    );
    assert_eq!(
        engine.workflow_by_id(wf).await.unwrap().unwrap().state,
        WorkflowState::Completed
    );
}

#[tokio::test]
async fn test_reset_returns_a_started_item_for_retry() {
    let (engine, _store) = engine_for(two_item_def());
    let wf = engine
        .initialize_root_workflow("batch", None, None)
        .await
        .unwrap();

    let item = open_item(&engine, wf, "work").await;
    engine.start_work_item(item, json!({"attempt": 1})).await.unwrap();
    engine.reset_work_item(item).await.unwrap();

    let items = engine.workflow_task_work_items(wf, "work").await.unwrap();
    let row = items.iter().find(|i| i.id == item).unwrap();
    assert_eq!(row.state, WorkItemState::Initialized);

    // a reset item can start again
    engine.start_work_item(item, json!({"attempt": 2})).await.unwrap();

    // but only started items can be reset
    let other = items.iter().find(|i| i.id != item).unwrap();
    let err = engine.reset_work_item(other.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidWorkItemState { .. }));
}

#[tokio::test]
async fn test_finalized_work_items_are_immutable() {
    let (engine, _store) = engine_for(two_item_def());
    let wf = engine
        .initialize_root_workflow("batch", None, None)
        .await
        .unwrap();

    let item = open_item(&engine, wf, "work").await;

    // completing before starting is rejected
    let err = engine.complete_work_item(item, json!({})).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_WORK_ITEM_STATE");

    engine.start_work_item(item, json!({})).await.unwrap();
    engine.complete_work_item(item, json!({})).await.unwrap();

    for result in [
        engine.start_work_item(item, json!({})).await,
        engine.complete_work_item(item, json!({})).await,
        engine.fail_work_item(item, None).await,
        engine.cancel_work_item(item, None).await,
    ] {
        let err = result.unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkItemState { .. }));
    }
}

#[tokio::test]
async fn test_start_payload_is_validated() {
    let def = WorkflowBuilder::new("strict")
        .start("start")
        .end("end")
        .task(
            TaskBuilder::new("pay")
                .activities(Arc::new(SpawnOne))
                .action(WorkItemAction {
                    start_validator: Arc::new(RequiresAmount),
                    ..Default::default()
                }),
        )
        .flow("start", "pay")
        .flow("pay", "end")
        .build()
        .unwrap();

    let (engine, _store) = engine_for(def);
    let wf = engine
        .initialize_root_workflow("strict", None, None)
        .await
        .unwrap();
    let item = open_item(&engine, wf, "pay").await;

    let err = engine
        .start_work_item(item, json!({"note": "no amount"}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PAYLOAD_VALIDATION");

    // the rejected transaction left the item untouched
    let items = engine.workflow_task_work_items(wf, "pay").await.unwrap();
    assert_eq!(items[0].state, WorkItemState::Initialized);

    engine
        .start_work_item(item, json!({"amount": 120}))
        .await
        .unwrap();
}