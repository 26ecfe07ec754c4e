//! Public admin-path operations (spec §6, expansion §4.7): the surface
//! callers outside the scheduler loop use to manage workflows and their
//! task graphs.
//!
//! Workflow create/update/delete and `CreateWorkflowTask` all keep
//! `PlanRegistry` in sync with the relational store immediately after
//! the write commits, mirroring the "PlanRegistry mirrors the
//! relational store" contract in spec.md §3.

use std::sync::Arc;

use workflow_coord::TaskRef;
use workflow_db::models::{UserWorkflowRelevance, Workflow, WorkflowSelector, WorkflowTaskEdgeRow};
use workflow_db::queries::workflow_task::EdgeDiff;
use workflow_db::store::{RelationalStore, TaskCatalog};

use crate::config::AdminConfig;
use crate::error::EngineError;
use crate::planbuild::build_plan;
use crate::registry::PlanRegistry;

/// One task's desired dependency set within a `create_workflow_task`
/// call.
#[derive(Debug, Clone)]
pub struct CreateWorkflowTaskArgs {
    pub project_id: i64,
    pub task_id: i64,
    pub depends_on: Vec<TaskRef>,
}

/// Admin-path API surface. Cheap to clone: every field is an `Arc` or
/// plain config.
#[derive(Clone)]
pub struct AdminApi {
    relational: Arc<dyn RelationalStore>,
    catalog: Arc<dyn TaskCatalog>,
    registry: Arc<PlanRegistry>,
    config: AdminConfig,
}

impl AdminApi {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        catalog: Arc<dyn TaskCatalog>,
        registry: Arc<PlanRegistry>,
        config: AdminConfig,
    ) -> Self {
        Self {
            relational,
            catalog,
            registry,
            config,
        }
    }

    /// User `self.config.bypass_user_id` skips the check; everyone else
    /// needs a matching `UserWorkflowRelevance` row.
    async fn require_access(&self, user_id: i64, workflow_id: i64) -> Result<(), EngineError> {
        if user_id == self.config.bypass_user_id {
            return Ok(());
        }
        match self.relational.get_relevance(user_id, workflow_id).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::Unauthorized {
                user_id,
                workflow_id,
            }),
        }
    }

    /// Rebuild `workflow_id`'s `WorkflowPlan` from the relational store
    /// and install it, replacing any prior entry atomically.
    async fn refresh_plan(&self, workflow_id: i64) -> Result<(), EngineError> {
        let workflow = self.relational.get_workflow(workflow_id).await?;
        let plan = build_plan(self.relational.as_ref(), self.catalog.as_ref(), workflow).await?;
        self.registry.set_plan(workflow_id, plan);
        Ok(())
    }

    pub async fn create_workflow(
        &self,
        user_id: i64,
        workflow_id: i64,
        title: &str,
        cron_expr: &str,
    ) -> Result<Workflow, EngineError> {
        let workflow = self
            .relational
            .create_workflow(workflow_id, title, cron_expr)
            .await?;
        self.relational
            .grant_relevance(user_id, workflow.workflow_id)
            .await?;
        self.refresh_plan(workflow.workflow_id).await?;
        Ok(workflow)
    }

    pub async fn update_workflow(
        &self,
        user_id: i64,
        workflow_id: i64,
        title: &str,
        cron_expr: &str,
    ) -> Result<Workflow, EngineError> {
        self.require_access(user_id, workflow_id).await?;
        let workflow = self
            .relational
            .update_workflow(workflow_id, title, cron_expr)
            .await?;
        self.refresh_plan(workflow_id).await?;
        Ok(workflow)
    }

    pub async fn delete_workflow(&self, user_id: i64, workflow_id: i64) -> Result<(), EngineError> {
        self.require_access(user_id, workflow_id).await?;
        self.relational.delete_workflow(workflow_id).await?;
        self.registry.del_plan(workflow_id);
        Ok(())
    }

    pub async fn get_workflow_list(
        &self,
        selector: &WorkflowSelector,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Workflow>, i64), EngineError> {
        let workflows = self
            .relational
            .list_workflows(selector, page, page_size)
            .await?;
        let total = self.relational.count_workflows(selector).await?;
        Ok((workflows, total))
    }

    pub async fn get_user_workflows(&self, user_id: i64) -> Result<Vec<Workflow>, EngineError> {
        Ok(self.relational.list_user_workflows(user_id).await?)
    }

    /// Replace each named task's dependency set and grant
    /// `UserWorkflowRelevance` is not implied here; the caller must
    /// already hold access (checked below) to the target workflow.
    pub async fn create_workflow_task(
        &self,
        user_id: i64,
        workflow_id: i64,
        tasks: Vec<CreateWorkflowTaskArgs>,
    ) -> Result<Vec<EdgeDiff>, EngineError> {
        self.require_access(user_id, workflow_id).await?;

        let mut diffs = Vec::with_capacity(tasks.len());
        for task in tasks {
            let diff = self
                .relational
                .replace_edges(workflow_id, task.project_id, task.task_id, &task.depends_on)
                .await?;
            diffs.push(diff);
        }
        self.refresh_plan(workflow_id).await?;
        Ok(diffs)
    }

    pub async fn get_workflow_tasks(
        &self,
        workflow_id: i64,
    ) -> Result<Vec<WorkflowTaskEdgeRow>, EngineError> {
        Ok(self.relational.list_edges(workflow_id).await?)
    }
}
