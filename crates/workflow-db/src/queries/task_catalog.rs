use sqlx::PgPool;

use crate::error::DbError;
use crate::models::TaskCatalogRow;

pub async fn upsert_task(
    pool: &PgPool,
    project_id: i64,
    task_id: i64,
    name: &str,
    payload_kind: &str,
) -> Result<TaskCatalogRow, DbError> {
    let row = sqlx::query_as::<_, TaskCatalogRow>(
        r#"
        INSERT INTO task_catalog (project_id, task_id, name, payload_kind)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (project_id, task_id)
        DO UPDATE SET name = EXCLUDED.name, payload_kind = EXCLUDED.payload_kind
        RETURNING project_id, task_id, name, payload_kind
        "#,
    )
    .bind(project_id)
    .bind(task_id)
    .bind(name)
    .bind(payload_kind)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_task(
    pool: &PgPool,
    project_id: i64,
    task_id: i64,
) -> Result<TaskCatalogRow, DbError> {
    sqlx::query_as::<_, TaskCatalogRow>(
        "SELECT project_id, task_id, name, payload_kind FROM task_catalog WHERE project_id = $1 AND task_id = $2",
    )
    .bind(project_id)
    .bind(task_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("task {project_id}/{task_id}")))
}
