//! Builds a [`WorkflowPlan`] from the relational store's `Workflow` row
//! and its edge rows (spec §4.4 `set_plan`).

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;

use workflow_coord::TaskRef;
use workflow_db::models::{Workflow, WorkflowSelector};
use workflow_db::queries::workflow_task::tasks_in_edges;
use workflow_db::store::{RelationalStore, TaskCatalog};

use crate::dag;
use crate::error::EngineError;
use crate::model::{PlanState, WorkflowPlan};
use crate::registry::PlanRegistry;

/// Resolve `workflow`'s edges and task catalog entries into a fresh
/// `WorkflowPlan`, ready to install into the [`crate::registry::PlanRegistry`].
///
/// Fails with [`EngineError::InvalidDag`] if the task graph contains a
/// cycle, or [`EngineError::Fatal`] if the cron expression cannot be
/// parsed or never fires.
pub async fn build_plan(
    relational: &dyn RelationalStore,
    catalog: &dyn TaskCatalog,
    workflow: Workflow,
) -> Result<WorkflowPlan, EngineError> {
    let edges = relational.list_edges(workflow.workflow_id).await?;
    let refs = tasks_in_edges(&edges);

    let mut task_flow: HashMap<TaskRef, Vec<TaskRef>> = HashMap::new();
    for row in &edges {
        let entry = task_flow.entry(row.task()).or_default();
        if let Some(dep) = row.dependency() {
            entry.push(dep);
        }
    }
    for task in &refs {
        task_flow.entry(*task).or_default();
    }

    dag::kahn(&task_flow).map_err(|node| EngineError::InvalidDag {
        workflow_id: workflow.workflow_id,
        task: node,
    })?;

    let mut tasks = HashMap::with_capacity(refs.len());
    for task in &refs {
        let info = catalog.get_task(task.project_id, task.task_id).await?;
        tasks.insert(*task, info);
    }

    let expr = Schedule::from_str(&workflow.cron_expr)
        .map_err(|e| EngineError::Fatal(format!("invalid cron expression {:?}: {e}", workflow.cron_expr)))?;

    let now = Utc::now();
    let mut upcoming = expr.after(&now);
    let first = upcoming
        .next()
        .ok_or_else(|| EngineError::Fatal(format!("cron expression {:?} never fires", workflow.cron_expr)))?;
    let second = upcoming.next();
    let fire_period = match second {
        Some(second) => (second - first).to_std().unwrap_or(Duration::from_secs(1)),
        None => Duration::from_secs(1),
    };

    Ok(WorkflowPlan {
        workflow,
        expr,
        next_time: first.timestamp(),
        tasks,
        task_flow,
        plan_state: PlanState::not_running(),
        fire_period,
    })
}

/// Load every `Workflow` row from the relational store and install a
/// freshly-built plan for each into `registry` (spec §4.4: "loads plans
/// at startup"). A workflow whose plan fails to build (invalid DAG, bad
/// cron expression) is skipped with a warning rather than aborting the
/// whole startup; it is simply absent from the registry until an admin
/// fixes it and triggers a refresh.
pub async fn load_all_plans(
    relational: &dyn RelationalStore,
    catalog: &dyn TaskCatalog,
    registry: &Arc<PlanRegistry>,
    warning: &dyn crate::warning::WarningSink,
) -> Result<usize, EngineError> {
    let mut page = 1i64;
    const PAGE_SIZE: i64 = 200;
    let mut installed = 0usize;

    loop {
        let workflows = relational
            .list_workflows(&WorkflowSelector::default(), page, PAGE_SIZE)
            .await?;
        if workflows.is_empty() {
            break;
        }
        let fetched = workflows.len();

        for workflow in workflows {
            let workflow_id = workflow.workflow_id;
            match build_plan(relational, catalog, workflow).await {
                Ok(plan) => {
                    registry.set_plan(workflow_id, plan);
                    installed += 1;
                }
                Err(error) => {
                    warning.warning(crate::model::WarningData {
                        source: "startup".to_owned(),
                        message: format!("failed to build plan for workflow {workflow_id}: {error}"),
                        workflow_id: Some(workflow_id),
                        task: None,
                    });
                }
            }
        }

        if (fetched as i64) < PAGE_SIZE {
            break;
        }
        page += 1;
    }

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use workflow_db::error::DbError;
    use workflow_db::models::{
        TaskInfo, UserWorkflowRelevance, WorkflowSelector, WorkflowTaskEdgeRow,
    };
    use workflow_db::queries::workflow_task::EdgeDiff;

    #[derive(Default)]
    struct FakeStore {
        workflows: Mutex<HashMap<i64, Workflow>>,
        edges: Mutex<HashMap<i64, Vec<WorkflowTaskEdgeRow>>>,
    }

    #[async_trait]
    impl RelationalStore for FakeStore {
        async fn create_workflow(&self, _: i64, _: &str, _: &str) -> Result<Workflow, DbError> {
            unimplemented!()
        }
        async fn update_workflow(&self, _: i64, _: &str, _: &str) -> Result<Workflow, DbError> {
            unimplemented!()
        }
        async fn delete_workflow(&self, _: i64) -> Result<(), DbError> {
            unimplemented!()
        }
        async fn get_workflow(&self, workflow_id: i64) -> Result<Workflow, DbError> {
            self.workflows
                .lock()
                .unwrap()
                .get(&workflow_id)
                .cloned()
                .ok_or_else(|| DbError::NotFound("workflow".to_owned()))
        }
        async fn list_workflows(
            &self,
            _: &WorkflowSelector,
            page: i64,
            page_size: i64,
        ) -> Result<Vec<Workflow>, DbError> {
            let mut rows: Vec<Workflow> = self.workflows.lock().unwrap().values().cloned().collect();
            rows.sort_by_key(|w| w.workflow_id);
            let offset = ((page - 1).max(0) * page_size) as usize;
            Ok(rows.into_iter().skip(offset).take(page_size as usize).collect())
        }
        async fn count_workflows(&self, _: &WorkflowSelector) -> Result<i64, DbError> {
            unimplemented!()
        }
        async fn list_edges(&self, workflow_id: i64) -> Result<Vec<WorkflowTaskEdgeRow>, DbError> {
            Ok(self
                .edges
                .lock()
                .unwrap()
                .get(&workflow_id)
                .cloned()
                .unwrap_or_default())
        }
        async fn replace_edges(
            &self,
            _: i64,
            _: i64,
            _: i64,
            _: &[TaskRef],
        ) -> Result<EdgeDiff, DbError> {
            unimplemented!()
        }
        async fn grant_relevance(&self, _: i64, _: i64) -> Result<UserWorkflowRelevance, DbError> {
            unimplemented!()
        }
        async fn get_relevance(
            &self,
            _: i64,
            _: i64,
        ) -> Result<Option<UserWorkflowRelevance>, DbError> {
            unimplemented!()
        }
        async fn list_user_workflows(&self, _: i64) -> Result<Vec<Workflow>, DbError> {
            unimplemented!()
        }
    }

    struct FakeCatalog;

    #[async_trait]
    impl TaskCatalog for FakeCatalog {
        async fn get_task(&self, project_id: i64, task_id: i64) -> Result<TaskInfo, DbError> {
            Ok(TaskInfo {
                project_id,
                task_id,
                name: format!("task-{task_id}"),
                payload_kind: "noop".to_owned(),
            })
        }
    }

    fn edge(workflow_id: i64, project_id: i64, task_id: i64, dep: Option<TaskRef>) -> WorkflowTaskEdgeRow {
        WorkflowTaskEdgeRow {
            id: task_id,
            workflow_id,
            project_id,
            task_id,
            dep_project_id: dep.map(|d| d.project_id),
            dep_task_id: dep.map(|d| d.task_id),
        }
    }

    fn sample_workflow() -> Workflow {
        Workflow {
            workflow_id: 1,
            title: "t".to_owned(),
            cron_expr: "0 * * * * *".to_owned(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn builds_tasks_and_task_flow_from_edges() {
        let store = FakeStore::default();
        let a = TaskRef::new(1, 1);
        let b = TaskRef::new(1, 2);
        store.edges.lock().unwrap().insert(
            1,
            vec![edge(1, 1, 1, None), edge(1, 1, 2, Some(a))],
        );

        let plan = build_plan(&store, &FakeCatalog, sample_workflow()).await.unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.task_flow.get(&b).unwrap(), &vec![a]);
        assert!(plan.task_flow.get(&a).unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_a_cyclic_graph() {
        let store = FakeStore::default();
        let a = TaskRef::new(1, 1);
        let b = TaskRef::new(1, 2);
        store
            .edges
            .lock()
            .unwrap()
            .insert(1, vec![edge(1, 1, 1, Some(b)), edge(1, 1, 2, Some(a))]);

        let err = build_plan(&store, &FakeCatalog, sample_workflow())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDag { .. }));
    }

    fn workflow_with(workflow_id: i64, cron_expr: &str) -> Workflow {
        Workflow {
            workflow_id,
            cron_expr: cron_expr.to_owned(),
            ..sample_workflow()
        }
    }

    #[tokio::test]
    async fn load_all_plans_installs_every_workflow() {
        let store = FakeStore::default();
        {
            let mut workflows = store.workflows.lock().unwrap();
            workflows.insert(1, workflow_with(1, "0 * * * * *"));
            workflows.insert(2, workflow_with(2, "0 * * * * *"));
        }

        let registry = Arc::new(PlanRegistry::new());
        let installed = load_all_plans(&store, &FakeCatalog, &registry, &crate::warning::NullWarningSink)
            .await
            .unwrap();

        assert_eq!(installed, 2);
        assert_eq!(registry.plan_count(), 2);
        assert!(registry.get_plan(1).is_some());
        assert!(registry.get_plan(2).is_some());
    }

    #[tokio::test]
    async fn load_all_plans_skips_a_workflow_with_a_bad_cron_expression() {
        let store = FakeStore::default();
        {
            let mut workflows = store.workflows.lock().unwrap();
            workflows.insert(1, workflow_with(1, "0 * * * * *"));
            workflows.insert(2, workflow_with(2, "not a cron expression"));
        }

        let registry = Arc::new(PlanRegistry::new());
        let installed = load_all_plans(&store, &FakeCatalog, &registry, &crate::warning::NullWarningSink)
            .await
            .unwrap();

        assert_eq!(installed, 1);
        assert_eq!(registry.plan_count(), 1);
        assert!(registry.get_plan(1).is_some());
        assert!(registry.get_plan(2).is_none());
    }
}
