use std::collections::HashSet;

use sqlx::PgPool;
use workflow_coord::TaskRef;

use crate::error::DbError;
use crate::models::WorkflowTaskEdgeRow;

/// Result of a [`replace_edges`] call: which rows were deleted and which
/// dependencies were newly created. Rows present in both the prior and
/// desired sets are left untouched.
#[derive(Debug, Clone, Default)]
pub struct EdgeDiff {
    pub deleted_ids: Vec<i64>,
    pub created: Vec<TaskRef>,
}

pub async fn list_edges(
    pool: &PgPool,
    workflow_id: i64,
) -> Result<Vec<WorkflowTaskEdgeRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowTaskEdgeRow>(
        "SELECT id, workflow_id, project_id, task_id, dep_project_id, dep_task_id
         FROM workflow_task_edges
         WHERE workflow_id = $1
         ORDER BY id",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Every distinct `(project_id, task_id)` that has at least one edge row
/// (sentinel or dependency) in this workflow.
pub fn tasks_in_edges(edges: &[WorkflowTaskEdgeRow]) -> Vec<TaskRef> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in edges {
        let task = row.task();
        if seen.insert(task) {
            out.push(task);
        }
    }
    out
}

/// Replace the dependency edges of `(project_id, task_id)` within
/// `workflow_id` with exactly `desired`, computing the minimal delete-set
/// and create-set rather than dropping and re-inserting everything.
///
/// When `desired` is empty and no edge row for this task exists yet, a
/// sentinel row (both dependency columns `NULL`) is inserted so the task
/// is still materialized in the workflow.
pub async fn replace_edges(
    pool: &PgPool,
    workflow_id: i64,
    project_id: i64,
    task_id: i64,
    desired: &[TaskRef],
) -> Result<EdgeDiff, DbError> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, WorkflowTaskEdgeRow>(
        "SELECT id, workflow_id, project_id, task_id, dep_project_id, dep_task_id
         FROM workflow_task_edges
         WHERE workflow_id = $1 AND project_id = $2 AND task_id = $3
         FOR UPDATE",
    )
    .bind(workflow_id)
    .bind(project_id)
    .bind(task_id)
    .fetch_all(&mut *tx)
    .await?;

    let desired_set: HashSet<TaskRef> = desired.iter().copied().collect();
    let mut existing_set = HashSet::new();
    let mut keep_sentinel = false;
    let mut delete_ids = Vec::new();

    for row in &current {
        match row.dependency() {
            Some(dep) if desired_set.contains(&dep) => {
                existing_set.insert(dep);
            }
            Some(_) => delete_ids.push(row.id),
            None if desired_set.is_empty() => keep_sentinel = true,
            None => delete_ids.push(row.id),
        }
    }

    if !delete_ids.is_empty() {
        sqlx::query("DELETE FROM workflow_task_edges WHERE id = ANY($1)")
            .bind(&delete_ids)
            .execute(&mut *tx)
            .await?;
    }

    let mut created = Vec::new();
    for dep in &desired_set {
        if !existing_set.contains(dep) {
            sqlx::query(
                "INSERT INTO workflow_task_edges (workflow_id, project_id, task_id, dep_project_id, dep_task_id)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(workflow_id)
            .bind(project_id)
            .bind(task_id)
            .bind(dep.project_id)
            .bind(dep.task_id)
            .execute(&mut *tx)
            .await?;
            created.push(*dep);
        }
    }

    if desired_set.is_empty() && !keep_sentinel {
        sqlx::query(
            "INSERT INTO workflow_task_edges (workflow_id, project_id, task_id, dep_project_id, dep_task_id)
             VALUES ($1, $2, $3, NULL, NULL)",
        )
        .bind(workflow_id)
        .bind(project_id)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(EdgeDiff {
        deleted_ids: delete_ids,
        created,
    })
}

pub async fn delete_task_edges(
    pool: &PgPool,
    workflow_id: i64,
    project_id: i64,
    task_id: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "DELETE FROM workflow_task_edges WHERE workflow_id = $1 AND project_id = $2 AND task_id = $3",
    )
    .bind(workflow_id)
    .bind(project_id)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}
