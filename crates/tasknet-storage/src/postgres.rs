// PostgreSQL implementation of the store contract
//
// Every `begin()` opens a SERIALIZABLE transaction; serialization failures
// surface as StoreError::Conflict so the host can retry the operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Postgres;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use tasknet_core::{
    AuditSpanRow, ConditionRow, ParentRef, ScheduledJobRow, SnapshotRow, Store, StoreError,
    StoreTx, TaskRow, TaskState, TaskStateLogRow, WorkItemRow, WorkItemState, WorkflowRow,
    WorkflowStateLogRow,
};

use crate::models::{
    ConditionRecord, JobRecord, SnapshotRecord, SpanRecord, TaskRecord, WorkItemRecord,
    WorkflowRecord,
};
use crate::schema;

/// PostgreSQL-backed store
///
/// # Example
///
/// ```ignore
/// use tasknet_storage::PgStore;
///
/// let store = PgStore::connect("postgres://localhost/tasknet").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn db_err(e: sqlx::Error) -> StoreError {
    if let Some(code) = e.as_database_error().and_then(|d| d.code()) {
        // 40001 serialization_failure, 40P01 deadlock_detected
        if code == "40001" || code == "40P01" {
            warn!("transaction conflict, caller may retry: {}", e);
            return StoreError::Conflict(e.to_string());
        }
    }
    error!("query failed: {}", e);
    StoreError::Database(e.to_string())
}

impl PgStore {
    /// Wrap an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema (idempotent)
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        debug!("schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_workflow(&mut self, row: WorkflowRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasknet_workflows
                (id, name, version_name, parent_workflow_id, parent_task_name,
                 parent_task_generation, state, execution_mode,
                 migration_from_workflow_id, payload, created_at, finalized_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.version_name)
        .bind(row.parent.as_ref().map(|p| p.workflow_id))
        .bind(row.parent.as_ref().map(|p| p.task_name.clone()))
        .bind(row.parent.as_ref().map(|p| p.task_generation as i32))
        .bind(row.state.to_string())
        .bind(row.execution_mode.to_string())
        .bind(row.migration_from_workflow_id)
        .bind(&row.payload)
        .bind(row.created_at)
        .bind(row.finalized_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn workflow(&mut self, id: Uuid) -> Result<Option<WorkflowRow>, StoreError> {
        let record = sqlx::query_as::<_, WorkflowRecord>(
            r#"SELECT * FROM tasknet_workflows WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(record.map(Into::into))
    }

    async fn update_workflow(&mut self, row: &WorkflowRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tasknet_workflows
            SET state = $2,
                execution_mode = $3,
                parent_workflow_id = $4,
                parent_task_name = $5,
                parent_task_generation = $6,
                payload = $7,
                finalized_at = $8
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(row.state.to_string())
        .bind(row.execution_mode.to_string())
        .bind(row.parent.as_ref().map(|p| p.workflow_id))
        .bind(row.parent.as_ref().map(|p| p.task_name.clone()))
        .bind(row.parent.as_ref().map(|p| p.task_generation as i32))
        .bind(&row.payload)
        .bind(row.finalized_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn workflows_by_parent(
        &mut self,
        parent: &ParentRef,
    ) -> Result<Vec<WorkflowRow>, StoreError> {
        let records = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            SELECT * FROM tasknet_workflows
            WHERE parent_workflow_id = $1
              AND parent_task_name = $2
              AND parent_task_generation = $3
            ORDER BY id
            "#,
        )
        .bind(parent.workflow_id)
        .bind(&parent.task_name)
        .bind(parent.task_generation as i32)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn workflows_by_parent_workflow(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowRow>, StoreError> {
        let records = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            SELECT * FROM tasknet_workflows
            WHERE parent_workflow_id = $1
            ORDER BY id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn insert_task(&mut self, row: TaskRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasknet_tasks (id, workflow_id, name, generation, state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.id)
        .bind(row.workflow_id)
        .bind(&row.name)
        .bind(row.generation as i32)
        .bind(row.state.to_string())
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_task(&mut self, row: &TaskRow) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE tasknet_tasks SET state = $2 WHERE id = $1"#)
            .bind(row.id)
            .bind(row.state.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn tasks_by_workflow(&mut self, workflow_id: Uuid) -> Result<Vec<TaskRow>, StoreError> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT * FROM tasknet_tasks
            WHERE workflow_id = $1
            ORDER BY name, generation
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn tasks_by_workflow_state(
        &mut self,
        workflow_id: Uuid,
        state: TaskState,
    ) -> Result<Vec<TaskRow>, StoreError> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT * FROM tasknet_tasks
            WHERE workflow_id = $1 AND state = $2
            ORDER BY name, generation
            "#,
        )
        .bind(workflow_id)
        .bind(state.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn latest_task(
        &mut self,
        workflow_id: Uuid,
        name: &str,
    ) -> Result<Option<TaskRow>, StoreError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT * FROM tasknet_tasks
            WHERE workflow_id = $1 AND name = $2
            ORDER BY generation DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(record.map(Into::into))
    }

    async fn task_at(
        &mut self,
        workflow_id: Uuid,
        name: &str,
        generation: u32,
    ) -> Result<Option<TaskRow>, StoreError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT * FROM tasknet_tasks
            WHERE workflow_id = $1 AND name = $2 AND generation = $3
            "#,
        )
        .bind(workflow_id)
        .bind(name)
        .bind(generation as i32)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(record.map(Into::into))
    }

    async fn insert_condition(&mut self, row: ConditionRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasknet_conditions (id, workflow_id, name, kind, marking, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.id)
        .bind(row.workflow_id)
        .bind(&row.name)
        .bind(row.kind.to_string())
        .bind(row.marking as i32)
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_condition(&mut self, row: &ConditionRow) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE tasknet_conditions SET marking = $2 WHERE id = $1"#)
            .bind(row.id)
            .bind(row.marking as i32)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn condition(
        &mut self,
        workflow_id: Uuid,
        name: &str,
    ) -> Result<Option<ConditionRow>, StoreError> {
        let record = sqlx::query_as::<_, ConditionRecord>(
            r#"SELECT * FROM tasknet_conditions WHERE workflow_id = $1 AND name = $2"#,
        )
        .bind(workflow_id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(record.map(Into::into))
    }

    async fn conditions_by_workflow(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Vec<ConditionRow>, StoreError> {
        let records = sqlx::query_as::<_, ConditionRecord>(
            r#"SELECT * FROM tasknet_conditions WHERE workflow_id = $1 ORDER BY name"#,
        )
        .bind(workflow_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn insert_work_item(&mut self, row: WorkItemRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasknet_work_items
                (id, workflow_id, task_name, task_generation, state, payload,
                 created_at, finalized_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(row.id)
        .bind(row.parent.workflow_id)
        .bind(&row.parent.task_name)
        .bind(row.parent.task_generation as i32)
        .bind(row.state.to_string())
        .bind(&row.payload)
        .bind(row.created_at)
        .bind(row.finalized_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_work_item(&mut self, row: &WorkItemRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tasknet_work_items
            SET state = $2, payload = $3, finalized_at = $4
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(row.state.to_string())
        .bind(&row.payload)
        .bind(row.finalized_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn work_item(&mut self, id: Uuid) -> Result<Option<WorkItemRow>, StoreError> {
        let record = sqlx::query_as::<_, WorkItemRecord>(
            r#"SELECT * FROM tasknet_work_items WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(record.map(Into::into))
    }

    async fn work_items_by_parent(
        &mut self,
        parent: &ParentRef,
        state: Option<WorkItemState>,
    ) -> Result<Vec<WorkItemRow>, StoreError> {
        let records = sqlx::query_as::<_, WorkItemRecord>(
            r#"
            SELECT * FROM tasknet_work_items
            WHERE workflow_id = $1
              AND task_name = $2
              AND task_generation = $3
              AND ($4::TEXT IS NULL OR state = $4)
            ORDER BY id
            "#,
        )
        .bind(parent.workflow_id)
        .bind(&parent.task_name)
        .bind(parent.task_generation as i32)
        .bind(state.map(|s| s.to_string()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn insert_job(&mut self, row: ScheduledJobRow) -> Result<(), StoreError> {
        let spec = serde_json::to_value(&row.spec)?;
        sqlx::query(
            r#"
            INSERT INTO tasknet_scheduled_jobs
                (id, workflow_id, task_name, task_generation, run_at, spec, state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(row.id)
        .bind(row.parent.workflow_id)
        .bind(&row.parent.task_name)
        .bind(row.parent.task_generation as i32)
        .bind(row.run_at)
        .bind(spec)
        .bind(row.state.to_string())
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_job(&mut self, row: &ScheduledJobRow) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE tasknet_scheduled_jobs SET state = $2, run_at = $3 WHERE id = $1"#)
            .bind(row.id)
            .bind(row.state.to_string())
            .bind(row.run_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn job(&mut self, id: Uuid) -> Result<Option<ScheduledJobRow>, StoreError> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"SELECT * FROM tasknet_scheduled_jobs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        record.map(TryInto::try_into).transpose()
    }

    async fn jobs_by_parent(
        &mut self,
        parent: &ParentRef,
    ) -> Result<Vec<ScheduledJobRow>, StoreError> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM tasknet_scheduled_jobs
            WHERE workflow_id = $1 AND task_name = $2 AND task_generation = $3
            ORDER BY id
            "#,
        )
        .bind(parent.workflow_id)
        .bind(&parent.task_name)
        .bind(parent.task_generation as i32)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        records.into_iter().map(TryInto::try_into).collect()
    }

    async fn due_jobs(&mut self, now: DateTime<Utc>) -> Result<Vec<ScheduledJobRow>, StoreError> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM tasknet_scheduled_jobs
            WHERE state = 'pending' AND run_at <= $1
            ORDER BY run_at, id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        records.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_span(&mut self, row: AuditSpanRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasknet_audit_spans
                (span_id, sequence, trace_id, parent_span_id, operation_type,
                 operation, resource_type, resource_id, resource_name,
                 workflow_id, task_generation, started_at, ended_at, attributes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(row.span_id)
        .bind(row.sequence)
        .bind(row.trace_id)
        .bind(row.parent_span_id)
        .bind(row.operation_type.to_string())
        .bind(&row.operation)
        .bind(row.resource_type.to_string())
        .bind(row.resource_id)
        .bind(&row.resource_name)
        .bind(row.workflow_id)
        .bind(row.task_generation.map(|g| g as i32))
        .bind(row.started_at)
        .bind(row.ended_at)
        .bind(&row.attributes)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn max_span_sequence(&mut self) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"SELECT COALESCE(MAX(sequence), -1) FROM tasknet_audit_spans"#,
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(row.0)
    }

    async fn spans_by_trace(&mut self, trace_id: Uuid) -> Result<Vec<AuditSpanRow>, StoreError> {
        let records = sqlx::query_as::<_, SpanRecord>(
            r#"
            SELECT * FROM tasknet_audit_spans
            WHERE trace_id = $1
            ORDER BY started_at, sequence
            "#,
        )
        .bind(trace_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn spans_by_trace_workflow(
        &mut self,
        trace_id: Uuid,
        workflow_id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditSpanRow>, StoreError> {
        let records = sqlx::query_as::<_, SpanRecord>(
            r#"
            SELECT * FROM tasknet_audit_spans
            WHERE trace_id = $1
              AND workflow_id = $2
              AND ($3::TIMESTAMPTZ IS NULL OR started_at <= $3)
            ORDER BY started_at, sequence
            "#,
        )
        .bind(trace_id)
        .bind(workflow_id)
        .bind(until)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn insert_snapshot(&mut self, row: SnapshotRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasknet_snapshots
                (id, trace_id, workflow_id, taken_at, sequence, state)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.id)
        .bind(row.trace_id)
        .bind(row.workflow_id)
        .bind(row.taken_at)
        .bind(row.sequence)
        .bind(&row.state)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn latest_snapshot(
        &mut self,
        workflow_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SnapshotRow>, StoreError> {
        let record = sqlx::query_as::<_, SnapshotRecord>(
            r#"
            SELECT * FROM tasknet_snapshots
            WHERE workflow_id = $1 AND taken_at <= $2
            ORDER BY taken_at DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(record.map(Into::into))
    }

    async fn append_task_state_log(&mut self, row: TaskStateLogRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasknet_task_state_log
                (workflow_id, task_name, generation, state, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(row.workflow_id)
        .bind(&row.task_name)
        .bind(row.generation as i32)
        .bind(row.state.to_string())
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_workflow_state_log(
        &mut self,
        row: WorkflowStateLogRow,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasknet_workflow_state_log (workflow_id, state, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(row.workflow_id)
        .bind(row.state.to_string())
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(db_err)
    }
}
