// Scheduled jobs: atomic registration inside the transaction, deferred
// release, the stale-generation guard, and cancellation alongside the task.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use common::{run_task, SpawnOne};
use tasknet_core::{
    ActivityScope, ExecutionMode, JobRunStatus, JobSpec, JobState, ManualClock, MemoryStore,
    Registry, Result, Store, TaskActivities, TaskBuilder, VersionManager, WorkItemState,
    WorkflowBuilder, WorkflowDefinition, WorkflowEngine, WorkflowState,
};

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Defers its only work item by one minute
struct ScheduleOnly;

#[async_trait]
impl TaskActivities for ScheduleOnly {
    async fn on_enabled(&self, scope: &mut ActivityScope<'_>) -> Result<()> {
        if scope.execution_mode() == ExecutionMode::Normal {
            let run_at = scope.now() + Duration::seconds(60);
            scope.schedule(run_at, JobSpec::InitializeWorkItem { payload: None });
        }
        Ok(())
    }
}

/// Spawns a work item immediately and schedules a follow-up one
struct SpawnAndSchedule;

#[async_trait]
impl TaskActivities for SpawnAndSchedule {
    async fn on_enabled(&self, scope: &mut ActivityScope<'_>) -> Result<()> {
        if scope.execution_mode() == ExecutionMode::Normal {
            scope.initialize_work_item(None);
            let run_at = scope.now() + Duration::seconds(60);
            scope.schedule(run_at, JobSpec::InitializeWorkItem { payload: None });
        }
        Ok(())
    }
}

fn single_task(name: &str, activities: Arc<dyn TaskActivities>) -> WorkflowDefinition {
    WorkflowBuilder::new(name)
        .start("start")
        .end("end")
        .task(TaskBuilder::new("work").activities(activities))
        .flow("start", "work")
        .flow("work", "end")
        .build()
        .unwrap()
}

fn job_engine(def: WorkflowDefinition) -> (WorkflowEngine, Arc<MemoryStore>, Arc<ManualClock>) {
    let name = def.name.clone();
    let mut registry = Registry::new();
    registry.register(VersionManager::new(name).version("v1", def));
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = WorkflowEngine::new(store.clone(), registry).with_clock(clock.clone());
    (engine, store, clock)
}

async fn job_states(store: &MemoryStore, workflow_id: uuid::Uuid, task: &str) -> Vec<JobState> {
    let mut tx = store.begin().await.unwrap();
    let row = tx.latest_task(workflow_id, task).await.unwrap().unwrap();
    tx.jobs_by_parent(&row.parent_ref())
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.state)
        .collect()
}

#[tokio::test]
async fn test_due_job_initializes_the_deferred_work_item() {
    let (engine, _store, _clock) = job_engine(single_task("deferred", Arc::new(ScheduleOnly)));
    let wf = engine
        .initialize_root_workflow("deferred", None, None)
        .await
        .unwrap();

    // nothing to do yet
    assert!(engine
        .workflow_task_work_items(wf, "work")
        .await
        .unwrap()
        .is_empty());
    assert!(engine.run_due_jobs(t0()).await.unwrap().is_empty());

    // past the due time the job creates the work item under the same
    // generation
    let outcomes = engine.run_due_jobs(t0() + Duration::seconds(120)).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, JobRunStatus::Done);

    let items = engine.workflow_task_work_items(wf, "work").await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].state, WorkItemState::Initialized);

    run_task(&engine, wf, "work", json!({})).await;
    assert_eq!(
        engine.workflow_by_id(wf).await.unwrap().unwrap().state,
        WorkflowState::Completed
    );
}

#[tokio::test]
async fn test_finalizing_a_task_cancels_its_pending_jobs() {
    let (engine, store, _clock) =
        job_engine(single_task("guarded", Arc::new(SpawnAndSchedule)));
    let wf = engine
        .initialize_root_workflow("guarded", None, None)
        .await
        .unwrap();

    // the task completes before its follow-up job fires
    run_task(&engine, wf, "work", json!({})).await;
    assert_eq!(
        engine.workflow_by_id(wf).await.unwrap().unwrap().state,
        WorkflowState::Completed
    );

    // completing the task already canceled its pending jobs; nothing fires
    let outcomes = engine.run_due_jobs(t0() + Duration::seconds(120)).await.unwrap();
    assert!(outcomes.is_empty());
    assert_eq!(job_states(&store, wf, "work").await, vec![JobState::Canceled]);

    // no stray work item appeared in a later drain either
    let items = engine.workflow_task_work_items(wf, "work").await.unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn test_stale_generation_guard_aborts_racing_jobs() {
    // a scheduler race can hand the engine a pending job whose task
    // generation is no longer current; the run must abort, not pollute the
    // newer state
    let (engine, store, _clock) = job_engine(single_task("racy", Arc::new(SpawnOne)));
    let wf = engine
        .initialize_root_workflow("racy", None, None)
        .await
        .unwrap();
    run_task(&engine, wf, "work", json!({})).await;

    let parent = {
        let mut tx = store.begin().await.unwrap();
        tx.latest_task(wf, "work").await.unwrap().unwrap().parent_ref()
    };
    {
        let mut tx = store.begin().await.unwrap();
        tx.insert_job(tasknet_core::ScheduledJobRow {
            id: uuid::Uuid::now_v7(),
            parent,
            run_at: t0(),
            spec: JobSpec::InitializeWorkItem { payload: None },
            state: JobState::Pending,
            created_at: t0(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    let outcomes = engine.run_due_jobs(t0() + Duration::seconds(1)).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, JobRunStatus::StaleGeneration);

    // the finalized generation gained no new work item
    let items = engine.workflow_task_work_items(wf, "work").await.unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn test_cancel_cascade_cancels_pending_jobs() {
    let (engine, store, _clock) = job_engine(single_task("doomed", Arc::new(ScheduleOnly)));
    let wf = engine
        .initialize_root_workflow("doomed", None, None)
        .await
        .unwrap();

    engine.cancel_root_workflow(wf, None).await.unwrap();
    assert_eq!(job_states(&store, wf, "work").await, vec![JobState::Canceled]);

    // a canceled job never becomes due
    assert!(engine
        .run_due_jobs(t0() + Duration::seconds(300))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_failed_operations_commit_nothing() {
    let (engine, store, _clock) = job_engine(single_task("tight", Arc::new(ScheduleOnly)));
    let wf = engine
        .initialize_root_workflow("tight", None, None)
        .await
        .unwrap();

    let err = engine
        .initialize_work_item(
            tasknet_core::WorkItemTarget {
                path: vec![],
                parent_workflow_id: wf,
                parent_task_name: "missing".to_string(),
            },
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TASK_NOT_FOUND");

    // only the job from the committed initialize transaction exists
    assert_eq!(job_states(&store, wf, "work").await, vec![JobState::Pending]);
}
