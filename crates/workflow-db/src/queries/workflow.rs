use sqlx::PgPool;

use crate::error::DbError;
use crate::models::{Workflow, WorkflowSelector};

pub async fn create_workflow(
    pool: &PgPool,
    workflow_id: i64,
    title: &str,
    cron_expr: &str,
) -> Result<Workflow, DbError> {
    let row = sqlx::query_as::<_, Workflow>(
        r#"
        INSERT INTO workflows (workflow_id, title, cron_expr)
        VALUES ($1, $2, $3)
        RETURNING workflow_id, title, cron_expr, created_at, updated_at
        "#,
    )
    .bind(workflow_id)
    .bind(title)
    .bind(cron_expr)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_workflow(pool: &PgPool, workflow_id: i64) -> Result<Workflow, DbError> {
    sqlx::query_as::<_, Workflow>(
        "SELECT workflow_id, title, cron_expr, created_at, updated_at FROM workflows WHERE workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("workflow {workflow_id}")))
}

pub async fn update_workflow(
    pool: &PgPool,
    workflow_id: i64,
    title: &str,
    cron_expr: &str,
) -> Result<Workflow, DbError> {
    let row = sqlx::query_as::<_, Workflow>(
        r#"
        UPDATE workflows
        SET title = $2, cron_expr = $3, updated_at = now()
        WHERE workflow_id = $1
        RETURNING workflow_id, title, cron_expr, created_at, updated_at
        "#,
    )
    .bind(workflow_id)
    .bind(title)
    .bind(cron_expr)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("workflow {workflow_id}")))?;
    Ok(row)
}

pub async fn delete_workflow(pool: &PgPool, workflow_id: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM workflows WHERE workflow_id = $1")
        .bind(workflow_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_workflows(
    pool: &PgPool,
    selector: &WorkflowSelector,
    page: i64,
    page_size: i64,
) -> Result<Vec<Workflow>, DbError> {
    let offset = page.saturating_sub(1).max(0) * page_size;
    let like = selector
        .title_like
        .as_ref()
        .map(|s| format!("%{s}%"))
        .unwrap_or_else(|| "%".to_owned());
    let rows = sqlx::query_as::<_, Workflow>(
        r#"
        SELECT workflow_id, title, cron_expr, created_at, updated_at
        FROM workflows
        WHERE title ILIKE $1
        ORDER BY workflow_id
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(like)
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_workflows(pool: &PgPool, selector: &WorkflowSelector) -> Result<i64, DbError> {
    let like = selector
        .title_like
        .as_ref()
        .map(|s| format!("%{s}%"))
        .unwrap_or_else(|| "%".to_owned());
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM workflows WHERE title ILIKE $1")
        .bind(like)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_selector_matches_everything() {
        let selector = WorkflowSelector::default();
        assert!(selector.title_like.is_none());
    }
}
