// Schema bootstrap
//
// One statement per table/index, idempotent, applied in order by
// `PgStore::migrate()`. Index choices mirror the store contract's query
// surface: parent-scoped lookups for work items, jobs, and child workflows,
// descending-generation lookup for tasks, and (trace, workflow, started_at)
// for audit reconstruction.

pub(crate) const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasknet_workflows (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        version_name TEXT NOT NULL,
        parent_workflow_id UUID,
        parent_task_name TEXT,
        parent_task_generation INT,
        state TEXT NOT NULL,
        execution_mode TEXT NOT NULL,
        migration_from_workflow_id UUID,
        payload JSONB,
        created_at TIMESTAMPTZ NOT NULL,
        finalized_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_workflows_name
        ON tasknet_workflows (name)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_workflows_version
        ON tasknet_workflows (version_name, name)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_workflows_parent
        ON tasknet_workflows (parent_workflow_id, parent_task_name, parent_task_generation)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasknet_tasks (
        id UUID PRIMARY KEY,
        workflow_id UUID NOT NULL,
        name TEXT NOT NULL,
        generation INT NOT NULL,
        state TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (workflow_id, name, generation)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_tasks_state
        ON tasknet_tasks (workflow_id, state)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_tasks_generation
        ON tasknet_tasks (workflow_id, name, generation DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasknet_conditions (
        id UUID PRIMARY KEY,
        workflow_id UUID NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        marking INT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (workflow_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasknet_work_items (
        id UUID PRIMARY KEY,
        workflow_id UUID NOT NULL,
        task_name TEXT NOT NULL,
        task_generation INT NOT NULL,
        state TEXT NOT NULL,
        payload JSONB,
        created_at TIMESTAMPTZ NOT NULL,
        finalized_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_work_items_parent
        ON tasknet_work_items (workflow_id, task_name, task_generation, state)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasknet_scheduled_jobs (
        id UUID PRIMARY KEY,
        workflow_id UUID NOT NULL,
        task_name TEXT NOT NULL,
        task_generation INT NOT NULL,
        run_at TIMESTAMPTZ NOT NULL,
        spec JSONB NOT NULL,
        state TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_jobs_due
        ON tasknet_scheduled_jobs (state, run_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_jobs_parent
        ON tasknet_scheduled_jobs (workflow_id, task_name, task_generation)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasknet_audit_spans (
        span_id UUID PRIMARY KEY,
        sequence BIGINT NOT NULL,
        trace_id UUID NOT NULL,
        parent_span_id UUID,
        operation_type TEXT NOT NULL,
        operation TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_id UUID NOT NULL,
        resource_name TEXT NOT NULL,
        workflow_id UUID NOT NULL,
        task_generation INT,
        started_at TIMESTAMPTZ NOT NULL,
        ended_at TIMESTAMPTZ NOT NULL,
        attributes JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_spans_trace
        ON tasknet_audit_spans (trace_id, started_at, sequence)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_spans_workflow
        ON tasknet_audit_spans (trace_id, workflow_id, started_at, sequence)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasknet_snapshots (
        id UUID PRIMARY KEY,
        trace_id UUID NOT NULL,
        workflow_id UUID NOT NULL,
        taken_at TIMESTAMPTZ NOT NULL,
        sequence BIGINT NOT NULL,
        state JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_snapshots_workflow
        ON tasknet_snapshots (workflow_id, taken_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasknet_task_state_log (
        id BIGSERIAL PRIMARY KEY,
        workflow_id UUID NOT NULL,
        task_name TEXT NOT NULL,
        generation INT NOT NULL,
        state TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_task_state_log_key
        ON tasknet_task_state_log (workflow_id, task_name, generation, state)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasknet_workflow_state_log (
        id BIGSERIAL PRIMARY KEY,
        workflow_id UUID NOT NULL,
        state TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasknet_workflow_state_log_key
        ON tasknet_workflow_state_log (workflow_id, state)
    "#,
];
