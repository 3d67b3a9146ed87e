// Migration runner
//
// Fast-forwards a live root workflow into a new definition version, one
// adjacent hop at a time. Each hop is a single transaction: cancel the
// source workflow with reason `migration` (audit only, no user cancellation
// callbacks), create a new root workflow in fast-forward mode chained via
// migrationFromWorkflowId, let the firing engine replay it — consulting the
// hop's task migrators for every task it enables — and flip the execution
// mode back to normal once the replay queue drains. Tasks whose migrator
// chose `continue` are left enabled for normal operation.

use std::collections::VecDeque;

use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::context::{MigrationReplay, SpanInfo};
use crate::engine::WorkflowEngine;
use crate::entities::{ExecutionMode, OperationType, ResourceType, WorkflowState};
use crate::error::{EngineError, Result};
use crate::firing;
use crate::versions::Migration;

impl WorkflowEngine {
    /// Migrate a root workflow to `target_version`, walking the chain of
    /// adjacent migrations one hop (one transaction) at a time. Returns the
    /// id of the workflow running the target version.
    #[instrument(skip(self))]
    pub async fn migrate(&self, root_workflow_id: Uuid, target_version: &str) -> Result<Uuid> {
        let mut current_id = root_workflow_id;

        loop {
            let wf = self
                .workflow_by_id(current_id)
                .await?
                .ok_or(EngineError::WorkflowNotFound(current_id))?;
            if !wf.is_root() {
                return Err(EngineError::InvalidWorkflowState {
                    workflow_id: current_id,
                    state: "child workflows do not migrate".to_string(),
                });
            }
            if wf.version_name == target_version {
                return Ok(current_id);
            }

            let manager = self.registry().manager(&wf.name)?;
            // validates the full chain up front; MigrationChainNotFound
            // before any hop commits
            let chain = manager.migration_chain(&wf.version_name, target_version)?;
            let hop = chain
                .first()
                .copied()
                .ok_or_else(|| EngineError::MigrationChainNotFound {
                    name: wf.name.clone(),
                    from: wf.version_name.clone(),
                    to: target_version.to_string(),
                })?;

            current_id = self.migrate_hop(current_id, hop).await?;
        }
    }

    /// One migration hop in one transaction
    async fn migrate_hop(&self, old_workflow_id: Uuid, migration: &Migration) -> Result<Uuid> {
        let mut ctx = self.begin().await?;

        let old = firing::load_workflow(&mut ctx, old_workflow_id).await?;
        if old.state.is_final() {
            return Err(EngineError::InvalidWorkflowState {
                workflow_id: old_workflow_id,
                state: old.state.to_string(),
            });
        }

        let root = ctx.open_span(
            SpanInfo {
                operation: "migrateWorkflow",
                resource_type: ResourceType::Workflow,
                resource_id: old.id,
                resource_name: &old.name,
                workflow_id: old.id,
                trace_id: old.id,
                task_generation: None,
            },
            OperationType::Mutation,
        );

        // the migrated-away workflow is canceled without user callbacks;
        // only audit spans record the cascade
        firing::finalize_workflow_cascade(
            &mut ctx,
            old.id,
            WorkflowState::Canceled,
            "migration",
            false,
        )
        .await?;

        let new_id = Uuid::now_v7();
        let (new_row, steps) = Self::create_root_in(
            &mut ctx,
            new_id,
            &old.name,
            Some(&migration.to),
            old.payload.clone(),
            ExecutionMode::FastForward,
            Some(old.id),
        )
        .await?;

        if let Some(hook) = &migration.initializer {
            hook.run(ctx.tx(), &old, &new_row).await?;
        }

        ctx.migration = Some(MigrationReplay {
            old_workflow_id: old.id,
            migrators: migration.task_migrators.clone(),
        });
        firing::drive(&mut ctx, steps).await?;
        ctx.migration = None;

        // replay is over: the new tree runs normally from here on
        self.flip_to_normal(&mut ctx, new_id).await?;

        let new_wf = firing::load_workflow(&mut ctx, new_id).await?;
        if let Some(hook) = &migration.finalizer {
            hook.run(ctx.tx(), &old, &new_wf).await?;
        }

        ctx.close_span(
            root,
            json!({
                crate::audit::attr::MIGRATION_FROM_WORKFLOW_ID: old.id.to_string(),
                crate::audit::attr::VERSION_NAME: migration.to,
            }),
        )
        .await?;
        ctx.commit().await?;

        info!(%old_workflow_id, %new_id, to = %migration.to, "migrated workflow");
        Ok(new_id)
    }

    /// Set the execution mode of a workflow tree back to normal
    async fn flip_to_normal(
        &self,
        ctx: &mut crate::context::ExecutionContext,
        root_id: Uuid,
    ) -> Result<()> {
        let mut queue = VecDeque::from([root_id]);
        while let Some(id) = queue.pop_front() {
            let mut row = firing::load_workflow(ctx, id).await?;
            if row.execution_mode == ExecutionMode::FastForward {
                row.execution_mode = ExecutionMode::Normal;
                ctx.tx().update_workflow(&row).await?;
            }
            for child in ctx.tx().workflows_by_parent_workflow(id).await? {
                queue.push_back(child.id);
            }
        }
        Ok(())
    }
}
