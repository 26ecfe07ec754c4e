use sqlx::PgPool;

use crate::error::DbError;
use crate::models::{UserWorkflowRelevance, Workflow};

pub async fn grant(
    pool: &PgPool,
    user_id: i64,
    workflow_id: i64,
) -> Result<UserWorkflowRelevance, DbError> {
    let row = sqlx::query_as::<_, UserWorkflowRelevance>(
        r#"
        INSERT INTO user_workflow_relevance (user_id, workflow_id)
        VALUES ($1, $2)
        ON CONFLICT (user_id, workflow_id) DO UPDATE SET user_id = EXCLUDED.user_id
        RETURNING id, user_id, workflow_id, created_at
        "#,
    )
    .bind(user_id)
    .bind(workflow_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_relevance(
    pool: &PgPool,
    user_id: i64,
    workflow_id: i64,
) -> Result<Option<UserWorkflowRelevance>, DbError> {
    let row = sqlx::query_as::<_, UserWorkflowRelevance>(
        "SELECT id, user_id, workflow_id, created_at FROM user_workflow_relevance WHERE user_id = $1 AND workflow_id = $2",
    )
    .bind(user_id)
    .bind(workflow_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_user_workflows(pool: &PgPool, user_id: i64) -> Result<Vec<Workflow>, DbError> {
    let rows = sqlx::query_as::<_, Workflow>(
        r#"
        SELECT w.workflow_id, w.title, w.cron_expr, w.created_at, w.updated_at
        FROM workflows w
        JOIN user_workflow_relevance r ON r.workflow_id = w.workflow_id
        WHERE r.user_id = $1
        ORDER BY w.workflow_id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
