// Composite and dynamic composite tasks: child workflow linkage, the
// cancellation cascade, and finalization policies across the hierarchy.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use common::{latest_task, open_item, run_task, SpawnOne};
use tasknet_core::{
    ActivityScope, ChildRef, ExecutionMode, MemoryStore, PolicyContext, PolicyDecision, Registry,
    Result, Store, TaskActivities, TaskBuilder, TaskState, VersionManager, WorkItemState,
    WorkflowBuilder, WorkflowDefinition, WorkflowEngine, WorkflowState,
};

/// Activities for a composite task: start the (single) child workflow
struct SpawnChild(&'static str);

#[async_trait]
impl TaskActivities for SpawnChild {
    async fn on_enabled(&self, scope: &mut ActivityScope<'_>) -> Result<()> {
        if scope.execution_mode() == ExecutionMode::Normal {
            scope.initialize_workflow(self.0, None);
        }
        Ok(())
    }
}

/// Activities for a dynamic composite task: start every candidate, complete
/// once all children finalized regardless of their outcome
struct SpawnAllFinalizeAll(Vec<&'static str>);

#[async_trait]
impl TaskActivities for SpawnAllFinalizeAll {
    async fn on_enabled(&self, scope: &mut ActivityScope<'_>) -> Result<()> {
        if scope.execution_mode() == ExecutionMode::Normal {
            for name in &self.0 {
                scope.initialize_workflow(*name, None);
            }
        }
        Ok(())
    }

    async fn policy(&self, ctx: &PolicyContext) -> Result<PolicyDecision> {
        if ctx.stats.active == 0 && ctx.stats.total > 0 {
            Ok(PolicyDecision::Complete)
        } else {
            Ok(PolicyDecision::Continue)
        }
    }
}

fn child_def(name: &str, task: &str) -> WorkflowDefinition {
    WorkflowBuilder::new(name)
        .start("start")
        .end("end")
        .task(TaskBuilder::new(task).activities(Arc::new(SpawnOne)))
        .flow("start", task)
        .flow(task, "end")
        .build()
        .unwrap()
}

fn diagnostics_child() -> WorkflowDefinition {
    WorkflowBuilder::new("diagnostics_wf")
        .start("start")
        .end("end")
        .condition("triaged")
        .task(TaskBuilder::new("triage").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("assign_doctor").activities(Arc::new(SpawnOne)))
        .flow("start", "triage")
        .flow("triage", "triaged")
        .flow("triaged", "assign_doctor")
        .flow("assign_doctor", "end")
        .build()
        .unwrap()
}

fn composite_parent() -> WorkflowDefinition {
    WorkflowBuilder::new("patient_visit")
        .start("start")
        .end("end")
        .task(
            TaskBuilder::composite("diagnostics", ChildRef::latest("diagnostics_wf"))
                .activities(Arc::new(SpawnChild("diagnostics_wf"))),
        )
        .flow("start", "diagnostics")
        .flow("diagnostics", "end")
        .build()
        .unwrap()
}

fn hierarchy_engine() -> (WorkflowEngine, Arc<MemoryStore>) {
    let mut registry = Registry::new();
    registry.register(VersionManager::new("diagnostics_wf").version("v1", diagnostics_child()));
    registry.register(VersionManager::new("patient_visit").version("v1", composite_parent()));
    let store = Arc::new(MemoryStore::new());
    (WorkflowEngine::new(store.clone(), registry), store)
}

// ============================================================================
// Canceling the parent cascades through the child
// ============================================================================

#[tokio::test]
async fn test_cancel_cascades_through_child_workflow() {
    let (engine, store) = hierarchy_engine();
    let parent = engine
        .initialize_root_workflow("patient_visit", None, None)
        .await
        .unwrap();

    let children = engine
        .workflow_composite_task_workflows(parent, "diagnostics")
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
    let child = children[0].clone();
    assert_eq!(child.state, WorkflowState::Initialized);
    assert_eq!(
        child.parent.as_ref().map(|p| p.task_name.as_str()),
        Some("diagnostics")
    );

    // the child's first task is live with an open work item
    assert_eq!(
        latest_task(&store, child.id, "triage").await.unwrap().state,
        TaskState::Enabled
    );

    engine.cancel_root_workflow(parent, None).await.unwrap();

    // cascade-cancel completeness: every reachable row is finalized
    let parent_row = engine.workflow_by_id(parent).await.unwrap().unwrap();
    let child_row = engine.workflow_by_id(child.id).await.unwrap().unwrap();
    assert_eq!(parent_row.state, WorkflowState::Canceled);
    assert_eq!(child_row.state, WorkflowState::Canceled);
    assert_eq!(
        latest_task(&store, child.id, "triage").await.unwrap().state,
        TaskState::Canceled
    );
    assert_eq!(
        latest_task(&store, parent, "diagnostics").await.unwrap().state,
        TaskState::Canceled
    );

    let items = {
        let mut tx = store.begin().await.unwrap();
        let triage = tx.latest_task(child.id, "triage").await.unwrap().unwrap();
        tx.work_items_by_parent(&triage.parent_ref(), None)
            .await
            .unwrap()
    };
    assert!(!items.is_empty());
    assert!(items.iter().all(|i| i.state == WorkItemState::Canceled));
}

// ============================================================================
// Child completion propagates up through the default policy
// ============================================================================

#[tokio::test]
async fn test_child_completion_completes_parent() {
    let (engine, store) = hierarchy_engine();
    let parent = engine
        .initialize_root_workflow("patient_visit", None, None)
        .await
        .unwrap();
    let child = engine
        .workflow_composite_task_workflows(parent, "diagnostics")
        .await
        .unwrap()[0]
        .id;

    run_task(&engine, child, "triage", json!({})).await;

    // the child started, so every initialized ancestor started too
    assert_eq!(
        engine.workflow_by_id(parent).await.unwrap().unwrap().state,
        WorkflowState::Started
    );

    run_task(&engine, child, "assign_doctor", json!({})).await;

    assert_eq!(
        engine.workflow_by_id(child).await.unwrap().unwrap().state,
        WorkflowState::Completed
    );
    assert_eq!(
        latest_task(&store, parent, "diagnostics").await.unwrap().state,
        TaskState::Completed
    );
    assert_eq!(
        engine.workflow_by_id(parent).await.unwrap().unwrap().state,
        WorkflowState::Completed
    );
}

// ============================================================================
// Child failure fails the parent by default
// ============================================================================

#[tokio::test]
async fn test_child_failure_fails_parent_by_default() {
    let (engine, store) = hierarchy_engine();
    let parent = engine
        .initialize_root_workflow("patient_visit", None, None)
        .await
        .unwrap();
    let child = engine
        .workflow_composite_task_workflows(parent, "diagnostics")
        .await
        .unwrap()[0]
        .id;

    let item = open_item(&engine, child, "triage").await;
    engine.start_work_item(item, json!({})).await.unwrap();
    engine.fail_work_item(item, None).await.unwrap();

    assert_eq!(
        engine.workflow_by_id(child).await.unwrap().unwrap().state,
        WorkflowState::Failed
    );
    assert_eq!(
        latest_task(&store, parent, "diagnostics").await.unwrap().state,
        TaskState::Failed
    );
    assert_eq!(
        engine.workflow_by_id(parent).await.unwrap().unwrap().state,
        WorkflowState::Failed
    );
}

// ============================================================================
// Dynamic composite with a custom all-finalized policy
// ============================================================================

fn dynamic_engine() -> (WorkflowEngine, Arc<MemoryStore>) {
    let parent = WorkflowBuilder::new("campaign")
        .start("start")
        .end("end")
        .task(
            TaskBuilder::dynamic(
                "fanout",
                vec![ChildRef::latest("workflow_a"), ChildRef::latest("workflow_b")],
            )
            .activities(Arc::new(SpawnAllFinalizeAll(vec![
                "workflow_a",
                "workflow_b",
            ]))),
        )
        .flow("start", "fanout")
        .flow("fanout", "end")
        .build()
        .unwrap();

    let mut registry = Registry::new();
    registry.register(VersionManager::new("workflow_a").version("v1", child_def("workflow_a", "work")));
    registry.register(VersionManager::new("workflow_b").version("v1", child_def("workflow_b", "work")));
    registry.register(VersionManager::new("campaign").version("v1", parent));
    let store = Arc::new(MemoryStore::new());
    (WorkflowEngine::new(store.clone(), registry), store)
}

#[tokio::test]
async fn test_dynamic_composite_custom_policy_survives_child_failure() {
    let (engine, _store) = dynamic_engine();
    let parent = engine
        .initialize_root_workflow("campaign", None, None)
        .await
        .unwrap();

    let children = engine
        .workflow_composite_task_workflows(parent, "fanout")
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    let a = children.iter().find(|c| c.name == "workflow_a").unwrap().id;
    let b = children.iter().find(|c| c.name == "workflow_b").unwrap().id;

    // fail workflow A through its single work item
    let item = open_item(&engine, a, "work").await;
    engine.start_work_item(item, json!({})).await.unwrap();
    engine.fail_work_item(item, None).await.unwrap();

    assert_eq!(
        engine.workflow_by_id(a).await.unwrap().unwrap().state,
        WorkflowState::Failed
    );
    // the custom policy keeps the parent going
    assert_eq!(
        engine.workflow_by_id(parent).await.unwrap().unwrap().state,
        WorkflowState::Started
    );

    // complete workflow B; all children finalized -> parent completes
    run_task(&engine, b, "work", json!({})).await;

    assert_eq!(
        engine.workflow_by_id(b).await.unwrap().unwrap().state,
        WorkflowState::Completed
    );
    assert_eq!(
        engine.workflow_by_id(parent).await.unwrap().unwrap().state,
        WorkflowState::Completed
    );
}
