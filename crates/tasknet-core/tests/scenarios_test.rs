// End-to-end net scenarios: and-split/and-join, xor-split loops with task
// generations, and payload-driven xor routing.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use common::{latest_task, marking, open_item, run_task, task_generations, SpawnOne};
use tasknet_core::{
    EngineError, JoinKind, MemoryStore, Registry, Result, RouteContext, SplitKind, SplitRouter,
    TaskBuilder, TaskState, VersionManager, WorkItemState, WorkflowBuilder, WorkflowDefinition,
    WorkflowEngine, WorkflowState,
};

fn engine_for(def: WorkflowDefinition) -> (WorkflowEngine, Arc<MemoryStore>) {
    let name = def.name.clone();
    let mut registry = Registry::new();
    registry.register(VersionManager::new(name).version("v1", def));
    let store = Arc::new(MemoryStore::new());
    (WorkflowEngine::new(store.clone(), registry), store)
}

// ============================================================================
// And-split / and-join checkout
// ============================================================================

fn checkout() -> WorkflowDefinition {
    WorkflowBuilder::new("checkout")
        .start("start")
        .end("end")
        .condition("scanned")
        .condition("paid_pack")
        .condition("paid_receipt")
        .condition("packed")
        .condition("receipted")
        .task(TaskBuilder::new("scan_goods").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("pay").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("pack_goods").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("issue_receipt").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("check_goods").activities(Arc::new(SpawnOne)))
        .flow("start", "scan_goods")
        .flow("scan_goods", "scanned")
        .flow("scanned", "pay")
        .flow("pay", "paid_pack")
        .flow("pay", "paid_receipt")
        .flow("paid_pack", "pack_goods")
        .flow("paid_receipt", "issue_receipt")
        .flow("pack_goods", "packed")
        .flow("issue_receipt", "receipted")
        .flow("packed", "check_goods")
        .flow("receipted", "check_goods")
        .flow("check_goods", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_checkout_runs_to_completion() {
    let (engine, store) = engine_for(checkout());
    let wf = engine
        .initialize_root_workflow("checkout", None, None)
        .await
        .unwrap();

    // initialize puts one token on start and enables the first task
    let scan = latest_task(&store, wf, "scan_goods").await.unwrap();
    assert_eq!(scan.state, TaskState::Enabled);
    assert_eq!(marking(&store, wf, "start").await, 0);

    run_task(&engine, wf, "scan_goods", json!({})).await;
    assert_eq!(
        latest_task(&store, wf, "pay").await.unwrap().state,
        TaskState::Enabled
    );

    // the and split enables both branches
    run_task(&engine, wf, "pay", json!({})).await;
    assert_eq!(
        latest_task(&store, wf, "pack_goods").await.unwrap().state,
        TaskState::Enabled
    );
    assert_eq!(
        latest_task(&store, wf, "issue_receipt").await.unwrap().state,
        TaskState::Enabled
    );

    // the and join waits for the second branch
    run_task(&engine, wf, "pack_goods", json!({})).await;
    assert_eq!(
        latest_task(&store, wf, "check_goods").await.unwrap().state,
        TaskState::Disabled
    );

    run_task(&engine, wf, "issue_receipt", json!({})).await;
    assert_eq!(
        latest_task(&store, wf, "check_goods").await.unwrap().state,
        TaskState::Enabled
    );

    run_task(&engine, wf, "check_goods", json!({})).await;

    let row = engine.workflow_by_id(wf).await.unwrap().unwrap();
    assert_eq!(row.state, WorkflowState::Completed);
    assert!(row.finalized_at.is_some());
    assert_eq!(marking(&store, wf, "end").await, 1);
    for task in [
        "scan_goods",
        "pay",
        "pack_goods",
        "issue_receipt",
        "check_goods",
    ] {
        assert_eq!(
            latest_task(&store, wf, task).await.unwrap().state,
            TaskState::Completed
        );
    }
}

#[tokio::test]
async fn test_finalized_workflow_rejects_transitions() {
    let (engine, _store) = engine_for(checkout());
    let wf = engine
        .initialize_root_workflow("checkout", None, None)
        .await
        .unwrap();

    let item = open_item(&engine, wf, "scan_goods").await;
    engine.cancel_root_workflow(wf, None).await.unwrap();

    let err = engine.start_work_item(item, json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidWorkflowState { .. }));

    let err = engine.cancel_root_workflow(wf, None).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_WORKFLOW_STATE");
}

// ============================================================================
// Xor-join loop re-entry creates new generations
// ============================================================================

// start -> a; a and-splits to pre_b and post_ab; b feeds post_ab again;
// post_ab -> c (xor join) -> post_c -> d -> end
fn loop_net() -> WorkflowDefinition {
    WorkflowBuilder::new("loop_net")
        .start("start")
        .end("end")
        .condition("pre_b")
        .condition("post_ab")
        .condition("post_c")
        .task(TaskBuilder::new("a").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("b").activities(Arc::new(SpawnOne)))
        .task(
            TaskBuilder::new("c")
                .join(JoinKind::Xor)
                .activities(Arc::new(SpawnOne)),
        )
        .task(TaskBuilder::new("d").activities(Arc::new(SpawnOne)))
        .flow("start", "a")
        .flow("a", "pre_b")
        .flow("a", "post_ab")
        .flow("pre_b", "b")
        .flow("b", "post_ab")
        .flow("post_ab", "c")
        .flow("c", "post_c")
        .flow("post_c", "d")
        .flow("d", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_loop_reentry_spawns_new_generation() {
    let (engine, store) = engine_for(loop_net());
    let wf = engine
        .initialize_root_workflow("loop_net", None, None)
        .await
        .unwrap();

    run_task(&engine, wf, "a", json!({})).await;

    // both b and c hold tokens now
    assert_eq!(latest_task(&store, wf, "b").await.unwrap().state, TaskState::Enabled);
    let c1 = latest_task(&store, wf, "c").await.unwrap();
    assert_eq!((c1.generation, c1.state), (1, TaskState::Enabled));

    // b feeds post_ab again while c generation 1 is still live; the token
    // parks until c finalizes
    run_task(&engine, wf, "b", json!({})).await;
    assert_eq!(marking(&store, wf, "post_ab").await, 1);
    assert_eq!(latest_task(&store, wf, "c").await.unwrap().generation, 1);

    // completing c consumes the parked token into a fresh generation
    run_task(&engine, wf, "c", json!({})).await;
    let c2 = latest_task(&store, wf, "c").await.unwrap();
    assert_eq!((c2.generation, c2.state), (2, TaskState::Enabled));

    let generations = task_generations(&store, wf, "c").await;
    assert_eq!(generations.len(), 2);
    assert_eq!(generations[0].state, TaskState::Completed);
    // exactly one non-finalized row per (workflow, task)
    assert_eq!(
        generations.iter().filter(|t| !t.state.is_final()).count(),
        1
    );

    // work items never leak across generations
    let items = engine.workflow_task_work_items(wf, "c").await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].state, WorkItemState::Initialized);
    assert_eq!(items[0].parent.task_generation, 2);
}

// ============================================================================
// Budget routing through an xor split
// ============================================================================

struct BudgetRouter;

#[async_trait]
impl SplitRouter for BudgetRouter {
    async fn route(&self, ctx: &RouteContext) -> Result<Option<String>> {
        let amount = ctx
            .payload
            .as_ref()
            .and_then(|p| p["totalAmount"].as_u64())
            .unwrap_or(0);
        Ok(Some(if amount < 50_000 {
            "for_director".to_string()
        } else {
            "for_executive".to_string()
        }))
    }
}

fn budget_net() -> WorkflowDefinition {
    WorkflowBuilder::new("budget")
        .start("start")
        .end("end")
        .condition("for_director")
        .condition("for_executive")
        .task(
            TaskBuilder::new("develop_budget")
                .split(SplitKind::Xor)
                .router(Arc::new(BudgetRouter))
                .activities(Arc::new(SpawnOne)),
        )
        .task(TaskBuilder::new("director_approval").activities(Arc::new(SpawnOne)))
        .task(TaskBuilder::new("executive_approval").activities(Arc::new(SpawnOne)))
        .flow("start", "develop_budget")
        .flow("develop_budget", "for_director")
        .flow("develop_budget", "for_executive")
        .flow("for_director", "director_approval")
        .flow("for_executive", "executive_approval")
        .flow("director_approval", "end")
        .flow("executive_approval", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_small_budget_routes_to_director() {
    let (engine, store) = engine_for(budget_net());
    let wf = engine
        .initialize_root_workflow("budget", None, None)
        .await
        .unwrap();

    run_task(&engine, wf, "develop_budget", json!({"totalAmount": 30_000})).await;

    assert_eq!(
        latest_task(&store, wf, "director_approval").await.unwrap().state,
        TaskState::Enabled
    );
    assert_eq!(
        latest_task(&store, wf, "executive_approval").await.unwrap().state,
        TaskState::Disabled
    );
    // xor-split exclusivity: exactly one output condition was incremented
    assert_eq!(marking(&store, wf, "for_director").await, 0); // consumed at enable
    assert_eq!(marking(&store, wf, "for_executive").await, 0);
}

#[tokio::test]
async fn test_large_budget_routes_to_executive() {
    let (engine, store) = engine_for(budget_net());
    let wf = engine
        .initialize_root_workflow("budget", None, None)
        .await
        .unwrap();

    run_task(&engine, wf, "develop_budget", json!({"totalAmount": 75_000})).await;

    assert_eq!(
        latest_task(&store, wf, "executive_approval").await.unwrap().state,
        TaskState::Enabled
    );
    assert_eq!(
        latest_task(&store, wf, "director_approval").await.unwrap().state,
        TaskState::Disabled
    );

    run_task(&engine, wf, "executive_approval", json!({})).await;
    let row = engine.workflow_by_id(wf).await.unwrap().unwrap();
    assert_eq!(row.state, WorkflowState::Completed);
}

// ============================================================================
// Failure cascade and transactionality
// ============================================================================

#[tokio::test]
async fn test_work_item_failure_fails_workflow_and_cancels_siblings() {
    let (engine, store) = engine_for(checkout());
    let wf = engine
        .initialize_root_workflow("checkout", None, None)
        .await
        .unwrap();

    run_task(&engine, wf, "scan_goods", json!({})).await;
    run_task(&engine, wf, "pay", json!({})).await;

    // fail one branch while the other is still enabled
    let pack = open_item(&engine, wf, "pack_goods").await;
    engine.start_work_item(pack, json!({})).await.unwrap();
    engine.fail_work_item(pack, None).await.unwrap();

    let row = engine.workflow_by_id(wf).await.unwrap().unwrap();
    assert_eq!(row.state, WorkflowState::Failed);
    assert_eq!(
        latest_task(&store, wf, "pack_goods").await.unwrap().state,
        TaskState::Failed
    );
    assert_eq!(
        latest_task(&store, wf, "issue_receipt").await.unwrap().state,
        TaskState::Canceled
    );
    let receipts = engine
        .workflow_task_work_items(wf, "issue_receipt")
        .await
        .unwrap();
    assert!(receipts.iter().all(|i| i.state == WorkItemState::Canceled));
}

// an xor join with two simultaneously marked inputs is a defect; the
// transaction aborts and no partial state commits
fn ambiguous_net() -> WorkflowDefinition {
    WorkflowBuilder::new("ambiguous")
        .start("start")
        .end("end")
        .condition("left")
        .condition("right")
        .task(TaskBuilder::new("a").activities(Arc::new(SpawnOne)))
        .task(
            TaskBuilder::new("x")
                .join(JoinKind::Xor)
                .activities(Arc::new(SpawnOne)),
        )
        .flow("start", "a")
        .flow("a", "left")
        .flow("a", "right")
        .flow("left", "x")
        .flow("right", "x")
        .flow("x", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_ambiguous_xor_join_aborts_without_partial_state() {
    let (engine, _store) = engine_for(ambiguous_net());
    let wf = engine
        .initialize_root_workflow("ambiguous", None, None)
        .await
        .unwrap();

    let item = open_item(&engine, wf, "a").await;
    engine.start_work_item(item, json!({})).await.unwrap();
    let err = engine.complete_work_item(item, json!({})).await.unwrap_err();
    assert_eq!(err.code(), "XOR_JOIN_AMBIGUOUS");

    // the whole transaction rolled back: the work item is still started
    let items = engine.workflow_task_work_items(wf, "a").await.unwrap();
    assert_eq!(items[0].state, WorkItemState::Started);
}
