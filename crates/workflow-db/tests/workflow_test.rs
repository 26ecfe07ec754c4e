use workflow_coord::TaskRef;
use workflow_db::models::WorkflowSelector;
use workflow_db::queries::{workflow, workflow_task};

#[tokio::test]
async fn create_get_update_delete_roundtrip() {
    let db = workflow_test_utils::create_test_db("workflow_crud_test").await;
    let pool = db.pool();

    let created = workflow::create_workflow(pool, 42, "nightly build", "0 0 * * *")
        .await
        .unwrap();
    assert_eq!(created.workflow_id, 42);

    let fetched = workflow::get_workflow(pool, 42).await.unwrap();
    assert_eq!(fetched.title, "nightly build");

    let updated = workflow::update_workflow(pool, 42, "nightly build v2", "0 1 * * *")
        .await
        .unwrap();
    assert_eq!(updated.title, "nightly build v2");
    assert_eq!(updated.cron_expr, "0 1 * * *");

    workflow::delete_workflow(pool, 42).await.unwrap();
    assert!(workflow::get_workflow(pool, 42).await.is_err());

    db.drop().await;
}

#[tokio::test]
async fn list_workflows_paginates_and_filters() {
    let db = workflow_test_utils::create_test_db("workflow_list_test").await;
    let pool = db.pool();

    workflow::create_workflow(pool, 1, "alpha build", "@daily")
        .await
        .unwrap();
    workflow::create_workflow(pool, 2, "beta build", "@daily")
        .await
        .unwrap();
    workflow::create_workflow(pool, 3, "gamma deploy", "@daily")
        .await
        .unwrap();

    let selector = WorkflowSelector {
        title_like: Some("build".to_owned()),
    };
    let matched = workflow::list_workflows(pool, &selector, 1, 10).await.unwrap();
    assert_eq!(matched.len(), 2);

    let total = workflow::count_workflows(pool, &selector).await.unwrap();
    assert_eq!(total, 2);

    let page = workflow::list_workflows(pool, &WorkflowSelector::default(), 1, 2)
        .await
        .unwrap();
    assert_eq!(page.len(), 2);

    db.drop().await;
}

#[tokio::test]
async fn replace_edges_computes_minimal_diff() {
    let db = workflow_test_utils::create_test_db("workflow_edge_replace_test").await;
    let pool = db.pool();

    workflow::create_workflow(pool, 7, "edge workflow", "@hourly")
        .await
        .unwrap();

    let first = workflow_task::replace_edges(
        pool,
        7,
        1,
        10,
        &[TaskRef::new(1, 20), TaskRef::new(1, 30)],
    )
    .await
    .unwrap();
    assert!(first.deleted_ids.is_empty());
    assert_eq!(first.created.len(), 2);

    // Desired set drops (1,20) and adds (1,40); (1,30) is untouched.
    let second = workflow_task::replace_edges(
        pool,
        7,
        1,
        10,
        &[TaskRef::new(1, 30), TaskRef::new(1, 40)],
    )
    .await
    .unwrap();
    assert_eq!(second.deleted_ids.len(), 1);
    assert_eq!(second.created, vec![TaskRef::new(1, 40)]);

    let edges = workflow_task::list_edges(pool, 7).await.unwrap();
    let deps: Vec<_> = edges.iter().filter_map(|e| e.dependency()).collect();
    assert_eq!(deps.len(), 2);
    assert!(deps.contains(&TaskRef::new(1, 30)));
    assert!(deps.contains(&TaskRef::new(1, 40)));

    db.drop().await;
}

#[tokio::test]
async fn replace_edges_with_empty_desired_inserts_sentinel() {
    let db = workflow_test_utils::create_test_db("workflow_edge_sentinel_test").await;
    let pool = db.pool();

    workflow::create_workflow(pool, 9, "sentinel workflow", "@hourly")
        .await
        .unwrap();

    let diff = workflow_task::replace_edges(pool, 9, 1, 5, &[]).await.unwrap();
    assert!(diff.created.is_empty());

    let edges = workflow_task::list_edges(pool, 9).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert!(edges[0].dependency().is_none());

    // Calling it again with still-empty desired must not insert a
    // second sentinel.
    let diff_again = workflow_task::replace_edges(pool, 9, 1, 5, &[]).await.unwrap();
    assert!(diff_again.deleted_ids.is_empty());
    assert!(diff_again.created.is_empty());
    let edges_again = workflow_task::list_edges(pool, 9).await.unwrap();
    assert_eq!(edges_again.len(), 1);

    db.drop().await;
}
