// Shared helpers for the integration suite
//
// All tests run against the in-memory store; time-travel tests inject a
// manually advanced clock.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use tasknet_core::{
    ActivityScope, ExecutionMode, MemoryStore, Result, Store, TaskActivities, TaskRow,
    WorkItemState, WorkflowEngine,
};

/// Activities that spawn one work item when the task enables. Skips the side
/// effect during fast-forward replay, as activities must.
pub struct SpawnOne;

#[async_trait]
impl TaskActivities for SpawnOne {
    async fn on_enabled(&self, scope: &mut ActivityScope<'_>) -> Result<()> {
        if scope.execution_mode() == ExecutionMode::Normal {
            scope.initialize_work_item(None);
        }
        Ok(())
    }
}

/// The open (initialized) work item of a task's current generation
pub async fn open_item(engine: &WorkflowEngine, workflow_id: Uuid, task: &str) -> Uuid {
    engine
        .workflow_task_work_items(workflow_id, task)
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.state == WorkItemState::Initialized)
        .unwrap_or_else(|| panic!("no open work item for task {task}"))
        .id
}

/// Start and complete the task's open work item with one payload
pub async fn run_task(engine: &WorkflowEngine, workflow_id: Uuid, task: &str, payload: Value) {
    let item = open_item(engine, workflow_id, task).await;
    engine.start_work_item(item, payload.clone()).await.unwrap();
    engine.complete_work_item(item, payload).await.unwrap();
}

/// Latest generation row of a task, straight from the store
pub async fn latest_task(store: &MemoryStore, workflow_id: Uuid, name: &str) -> Option<TaskRow> {
    let mut tx = store.begin().await.unwrap();
    tx.latest_task(workflow_id, name).await.unwrap()
}

/// All generation rows of a task, ascending
pub async fn task_generations(store: &MemoryStore, workflow_id: Uuid, name: &str) -> Vec<TaskRow> {
    let mut tx = store.begin().await.unwrap();
    tx.tasks_by_workflow(workflow_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.name == name)
        .collect()
}

/// Current marking of a condition
pub async fn marking(store: &MemoryStore, workflow_id: Uuid, condition: &str) -> u32 {
    let mut tx = store.begin().await.unwrap();
    tx.condition(workflow_id, condition)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("condition {condition} missing"))
        .marking
}
