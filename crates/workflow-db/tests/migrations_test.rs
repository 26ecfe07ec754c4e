use workflow_db::pool;

const EXPECTED_TABLES: &[&str] = &[
    "workflows",
    "workflow_task_edges",
    "user_workflow_relevance",
    "task_catalog",
];

#[tokio::test]
async fn migrations_create_all_tables() {
    let db = workflow_test_utils::create_test_db("workflow_migrations_test").await;
    let pg_pool = db.pool();

    for table in EXPECTED_TABLES {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(table)
        .fetch_one(pg_pool)
        .await
        .unwrap();
        assert!(exists, "expected table {table} to exist");
    }

    db.drop().await;
}

#[tokio::test]
async fn run_migrations_is_idempotent() {
    let db = workflow_test_utils::create_test_db("workflow_migrations_idempotent_test").await;
    pool::run_migrations(db.pool(), pool::default_migrations_path())
        .await
        .unwrap();
    db.drop().await;
}
