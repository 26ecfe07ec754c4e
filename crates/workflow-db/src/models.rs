use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use workflow_coord::TaskRef;

/// A cron-scheduled, named DAG of tasks. Presence of a row here mirrors
/// presence in the engine's in-memory registry.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: i64,
    pub title: String,
    pub cron_expr: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One dependency edge: task `(project_id, task_id)` depends on
/// `(dep_project_id, dep_task_id)`. A row whose dependency columns are
/// both `NULL` is a *sentinel*: it asserts that the task exists in the
/// workflow with no dependencies, so a task with zero deps still has a
/// materialized row to select against.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct WorkflowTaskEdgeRow {
    pub id: i64,
    pub workflow_id: i64,
    pub project_id: i64,
    pub task_id: i64,
    pub dep_project_id: Option<i64>,
    pub dep_task_id: Option<i64>,
}

impl WorkflowTaskEdgeRow {
    pub fn task(&self) -> TaskRef {
        TaskRef::new(self.project_id, self.task_id)
    }

    /// The dependency this row asserts, `None` for a sentinel row.
    pub fn dependency(&self) -> Option<TaskRef> {
        match (self.dep_project_id, self.dep_task_id) {
            (Some(p), Some(t)) => Some(TaskRef::new(p, t)),
            _ => None,
        }
    }
}

/// Grants user `user_id` permission to edit `workflow_id`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct UserWorkflowRelevance {
    pub id: i64,
    pub user_id: i64,
    pub workflow_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Row in the seeded task catalog the engine resolves `TaskInfo` from.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TaskCatalogRow {
    pub project_id: i64,
    pub task_id: i64,
    pub name: String,
    pub payload_kind: String,
}

/// A page selector for `Workflow::GetList`. `title_like` filters by a
/// case-insensitive substring; `None` matches every workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowSelector {
    pub title_like: Option<String>,
}

/// Resolved task metadata the engine needs to build a `WorkflowPlan`.
/// `payload_kind` is opaque to the engine; only the agent-side executor
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub project_id: i64,
    pub task_id: i64,
    pub name: String,
    pub payload_kind: String,
}

impl From<TaskCatalogRow> for TaskInfo {
    fn from(row: TaskCatalogRow) -> Self {
        Self {
            project_id: row.project_id,
            task_id: row.task_id,
            name: row.name,
            payload_kind: row.payload_kind,
        }
    }
}
