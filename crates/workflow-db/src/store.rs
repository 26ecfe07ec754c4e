//! Trait boundary the scheduling engine programs against, plus the
//! concrete Postgres implementations.

use async_trait::async_trait;
use sqlx::PgPool;
use workflow_coord::TaskRef;

use crate::error::DbError;
use crate::models::{TaskInfo, UserWorkflowRelevance, Workflow, WorkflowSelector, WorkflowTaskEdgeRow};
use crate::queries;

/// Everything the engine needs from persistent Workflow / edge / ACL
/// storage. A production caller gets this from [`PgRelationalStore`]; an
/// engine test gets it from an in-process fake implementing the same
/// trait.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn create_workflow(
        &self,
        workflow_id: i64,
        title: &str,
        cron_expr: &str,
    ) -> Result<Workflow, DbError>;
    async fn update_workflow(
        &self,
        workflow_id: i64,
        title: &str,
        cron_expr: &str,
    ) -> Result<Workflow, DbError>;
    async fn delete_workflow(&self, workflow_id: i64) -> Result<(), DbError>;
    async fn get_workflow(&self, workflow_id: i64) -> Result<Workflow, DbError>;
    async fn list_workflows(
        &self,
        selector: &WorkflowSelector,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<Workflow>, DbError>;
    async fn count_workflows(&self, selector: &WorkflowSelector) -> Result<i64, DbError>;

    async fn list_edges(&self, workflow_id: i64) -> Result<Vec<WorkflowTaskEdgeRow>, DbError>;
    async fn replace_edges(
        &self,
        workflow_id: i64,
        project_id: i64,
        task_id: i64,
        desired: &[TaskRef],
    ) -> Result<queries::workflow_task::EdgeDiff, DbError>;

    async fn grant_relevance(
        &self,
        user_id: i64,
        workflow_id: i64,
    ) -> Result<UserWorkflowRelevance, DbError>;
    async fn get_relevance(
        &self,
        user_id: i64,
        workflow_id: i64,
    ) -> Result<Option<UserWorkflowRelevance>, DbError>;
    async fn list_user_workflows(&self, user_id: i64) -> Result<Vec<Workflow>, DbError>;
}

/// Resolves `(project_id, task_id)` to the `TaskInfo` a `WorkflowPlan`
/// embeds.
#[async_trait]
pub trait TaskCatalog: Send + Sync {
    async fn get_task(&self, project_id: i64, task_id: i64) -> Result<TaskInfo, DbError>;
}

pub struct PgRelationalStore {
    pool: PgPool,
}

impl PgRelationalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationalStore for PgRelationalStore {
    async fn create_workflow(
        &self,
        workflow_id: i64,
        title: &str,
        cron_expr: &str,
    ) -> Result<Workflow, DbError> {
        queries::workflow::create_workflow(&self.pool, workflow_id, title, cron_expr).await
    }

    async fn update_workflow(
        &self,
        workflow_id: i64,
        title: &str,
        cron_expr: &str,
    ) -> Result<Workflow, DbError> {
        queries::workflow::update_workflow(&self.pool, workflow_id, title, cron_expr).await
    }

    async fn delete_workflow(&self, workflow_id: i64) -> Result<(), DbError> {
        queries::workflow::delete_workflow(&self.pool, workflow_id).await
    }

    async fn get_workflow(&self, workflow_id: i64) -> Result<Workflow, DbError> {
        queries::workflow::get_workflow(&self.pool, workflow_id).await
    }

    async fn list_workflows(
        &self,
        selector: &WorkflowSelector,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<Workflow>, DbError> {
        queries::workflow::list_workflows(&self.pool, selector, page, page_size).await
    }

    async fn count_workflows(&self, selector: &WorkflowSelector) -> Result<i64, DbError> {
        queries::workflow::count_workflows(&self.pool, selector).await
    }

    async fn list_edges(&self, workflow_id: i64) -> Result<Vec<WorkflowTaskEdgeRow>, DbError> {
        queries::workflow_task::list_edges(&self.pool, workflow_id).await
    }

    async fn replace_edges(
        &self,
        workflow_id: i64,
        project_id: i64,
        task_id: i64,
        desired: &[TaskRef],
    ) -> Result<queries::workflow_task::EdgeDiff, DbError> {
        queries::workflow_task::replace_edges(&self.pool, workflow_id, project_id, task_id, desired)
            .await
    }

    async fn grant_relevance(
        &self,
        user_id: i64,
        workflow_id: i64,
    ) -> Result<UserWorkflowRelevance, DbError> {
        queries::user_workflow::grant(&self.pool, user_id, workflow_id).await
    }

    async fn get_relevance(
        &self,
        user_id: i64,
        workflow_id: i64,
    ) -> Result<Option<UserWorkflowRelevance>, DbError> {
        queries::user_workflow::get_relevance(&self.pool, user_id, workflow_id).await
    }

    async fn list_user_workflows(&self, user_id: i64) -> Result<Vec<Workflow>, DbError> {
        queries::user_workflow::list_user_workflows(&self.pool, user_id).await
    }
}

pub struct PgTaskCatalog {
    pool: PgPool,
}

impl PgTaskCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskCatalog for PgTaskCatalog {
    async fn get_task(&self, project_id: i64, task_id: i64) -> Result<TaskInfo, DbError> {
        queries::task_catalog::get_task(&self.pool, project_id, task_id)
            .await
            .map(TaskInfo::from)
    }
}
