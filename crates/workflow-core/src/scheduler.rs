//! The Scheduler Loop (spec §4.5): a single cooperative consumer of
//! schedule events, task results, and an idle timer, driving every
//! registered `WorkflowPlan` forward.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use workflow_coord::{CoordStore, KeySchema, TaskRef};
use workflow_db::store::{RelationalStore, TaskCatalog};

use crate::config::SchedulerConfig;
use crate::model::{RunStatus, TaskDispatch, TaskFinishedQueueContent, TaskResult, TaskState, WarningData};
use crate::planstate::{self, PlanFinish};
use crate::readiness::{self};
use crate::registry::PlanRegistry;
use crate::retry::with_backoff;
use crate::warning::WarningSink;

const DISPATCH_RETRY_ATTEMPTS: u32 = 3;
const DISPATCH_RETRY_BASE: Duration = Duration::from_millis(100);

/// One task cleared by the readiness evaluator, awaiting a dispatch-key
/// write.
#[derive(Debug, Clone, Copy)]
struct TaskEvent {
    workflow_id: i64,
    task: TaskRef,
}

/// Owns the scheduling state machine. `relational`/`catalog` are kept
/// around so a future admin-triggered reload can resolve a fresh plan
/// without constructing a new `Scheduler`; the loop itself only reads
/// plans already installed in `registry`.
pub struct Scheduler {
    registry: Arc<PlanRegistry>,
    coord: CoordStore,
    schema: KeySchema,
    #[allow(dead_code)]
    relational: Arc<dyn RelationalStore>,
    #[allow(dead_code)]
    catalog: Arc<dyn TaskCatalog>,
    config: SchedulerConfig,
    warning: Arc<dyn WarningSink>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<PlanRegistry>,
        coord: CoordStore,
        schema: KeySchema,
        relational: Arc<dyn RelationalStore>,
        catalog: Arc<dyn TaskCatalog>,
        config: SchedulerConfig,
        warning: Arc<dyn WarningSink>,
    ) -> Self {
        Self {
            registry,
            coord,
            schema,
            relational,
            catalog,
            config,
            warning,
        }
    }

    fn warn(&self, source: &str, message: String, workflow_id: Option<i64>, task: Option<TaskRef>) {
        self.warning.warning(WarningData {
            source: source.to_owned(),
            message,
            workflow_id,
            task,
        });
    }

    /// Run until `cancel` fires. Spawns a background task draining the
    /// distributed result queue into `result_rx`; the loop itself is the
    /// single serial consumer of schedule events, task results, and the
    /// idle timer (spec §5).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (result_tx, mut result_rx) = mpsc::channel::<TaskResult>(256);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TaskEvent>();

        let dequeue_cancel = cancel.clone();
        let queue = self.coord.queue(self.schema.result_queue());
        let dequeue_warning = Arc::clone(&self.warning);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dequeue_cancel.cancelled() => return,
                    item = queue.dequeue::<TaskFinishedQueueContent>() => {
                        match item {
                            Ok(TaskFinishedQueueContent::V1(result)) => {
                                if result_tx.send(result).await.is_err() {
                                    return;
                                }
                            }
                            Err(error) => {
                                dequeue_warning.warning(WarningData {
                                    source: "result-queue".to_owned(),
                                    message: format!("dequeue failed: {error}"),
                                    workflow_id: None,
                                    task: None,
                                });
                            }
                        }
                    }
                }
            }
        });

        let mut sleep_for = self.try_schedule(&event_tx).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                Some(event) = event_rx.recv() => {
                    self.handle_schedule_event(event).await;
                }
                Some(result) = result_rx.recv() => {
                    self.handle_task_result(result, &event_tx).await;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
            sleep_for = self.try_schedule(&event_tx).await;
        }
    }

    /// Scan the registry for due plans, start each, and return how long
    /// to sleep until the next plan fires (or `idle_interval` if the
    /// registry is empty).
    async fn try_schedule(&self, event_tx: &mpsc::UnboundedSender<TaskEvent>) -> Duration {
        let now = Utc::now().timestamp();

        let mut due = Vec::new();
        self.registry.plan_range(|workflow_id, plan| {
            if plan.next_time <= now {
                due.push(workflow_id);
            }
        });

        for workflow_id in due {
            self.try_start_plan(workflow_id, event_tx).await;
            self.advance_next_time(workflow_id);
        }

        let mut next_in = self.config.idle_interval;
        let now = Utc::now().timestamp();
        self.registry.plan_range(|_, plan| {
            let remaining = (plan.next_time - now).max(0) as u64;
            next_in = next_in.min(Duration::from_secs(remaining));
        });
        next_in.max(Duration::from_millis(10))
    }

    /// Advance `workflow_id`'s `next_time` to the cron expression's next
    /// fire after now, installing the updated plan atomically.
    fn advance_next_time(&self, workflow_id: i64) {
        let Some(plan) = self.registry.get_plan(workflow_id) else {
            return;
        };
        let now = Utc::now();
        let mut updated = (*plan).clone();
        updated.next_time = updated
            .expr
            .after(&now)
            .next()
            .map(|t| t.timestamp())
            .unwrap_or_else(|| now.timestamp() + self.config.idle_interval.as_secs() as i64);
        self.registry.set_plan(workflow_id, updated);
    }

    /// If `plan.is_running()` is false, transactionally mark it RUNNING
    /// and evaluate readiness. A no-op if the plan is missing or already
    /// fresh-RUNNING.
    async fn try_start_plan(&self, workflow_id: i64, event_tx: &mpsc::UnboundedSender<TaskEvent>) {
        let Some(plan) = self.registry.get_plan(workflow_id) else {
            return;
        };
        if plan.is_running() {
            return;
        }

        let fire_period_secs = plan.fire_period.as_secs().max(1) as i64;
        let started =
            match planstate::set_plan_running(&self.coord, &self.schema, workflow_id, fire_period_secs).await {
                Ok(started) => started,
                Err(error) => {
                    self.warn(
                        "scheduler",
                        format!("set_plan_running failed: {error}"),
                        Some(workflow_id),
                        None,
                    );
                    return;
                }
            };
        if !started {
            return;
        }

        let mut running = (*plan).clone();
        running.plan_state.status = RunStatus::Running;
        running.plan_state.latest_try_time = Utc::now().timestamp();
        self.registry.set_plan(workflow_id, running);

        self.evaluate_and_dispatch(workflow_id, event_tx).await;
    }

    /// Load task states, run `can_schedule`, persist any STARTING-grace
    /// recoveries, and either finish the plan or emit one `TaskEvent` per
    /// ready task.
    async fn evaluate_and_dispatch(&self, workflow_id: i64, event_tx: &mpsc::UnboundedSender<TaskEvent>) {
        let Some(plan) = self.registry.get_plan(workflow_id) else {
            return;
        };

        let states = match planstate::get_task_states(&self.coord, &self.schema, workflow_id).await {
            Ok(states) => states,
            Err(error) => {
                self.warn(
                    "scheduler",
                    format!("get_task_states failed: {error}"),
                    Some(workflow_id),
                    None,
                );
                return;
            }
        };
        let states: HashMap<TaskRef, TaskState> = states.into_iter().map(|s| (s.task, s)).collect();

        let now = Utc::now().timestamp();
        let readiness = readiness::can_schedule(
            &plan.task_flow,
            &states,
            self.config.schedule_limit,
            self.config.starting_grace,
            now,
        );

        for recovered in &readiness.recoveries {
            let key = self.schema.task(workflow_id, recovered.task);
            if let Err(error) = self.coord.put(&key, recovered, None).await {
                self.warn(
                    "scheduler",
                    format!("persisting STARTING-grace recovery failed: {error}"),
                    Some(workflow_id),
                    Some(recovered.task),
                );
            }
        }

        if let Some(task) = readiness.failed {
            self.finish_plan(workflow_id, true, Some(readiness::workflow_failed_reason(task)))
                .await;
            return;
        }

        if readiness.finished {
            self.finish_plan(workflow_id, false, None).await;
            return;
        }

        for task in readiness.ready {
            // An unbounded channel: send only fails if the receiver (the
            // scheduler loop itself) has been dropped, i.e. on shutdown.
            let _ = event_tx.send(TaskEvent { workflow_id, task });
        }
    }

    /// Write the `/task/schedule/...` dispatch key with bounded retry,
    /// then mark the task STARTING. On persistent dispatch failure the
    /// task is left untouched at its prior status and will be considered
    /// again on the next readiness evaluation.
    async fn handle_schedule_event(&self, event: TaskEvent) {
        let Some(plan) = self.registry.get_plan(event.workflow_id) else {
            return;
        };
        let Some(info) = plan.tasks.get(&event.task).cloned() else {
            self.warn(
                "scheduler",
                "dispatch target missing from plan.tasks".to_owned(),
                Some(event.workflow_id),
                Some(event.task),
            );
            return;
        };

        let tmp_id = Uuid::new_v4().to_string();
        let dispatch = TaskDispatch {
            workflow_id: event.workflow_id,
            task: event.task,
            tmp_id: tmp_id.clone(),
            payload_kind: info.payload_kind,
        };
        let key = self.schema.schedule(event.task);

        let write = with_backoff(DISPATCH_RETRY_ATTEMPTS, DISPATCH_RETRY_BASE, || {
            let coord = self.coord.clone();
            let key = key.clone();
            let dispatch = dispatch.clone();
            async move { coord.put(&key, &dispatch, None).await }
        })
        .await;

        if let Err(error) = write {
            self.warn(
                "scheduler",
                format!("dispatch write exhausted retries: {error}"),
                Some(event.workflow_id),
                Some(event.task),
            );
            return;
        }

        let workflow_id = event.workflow_id;
        let task = event.task;
        let schema = self.schema.clone();
        let outcome = self
            .coord
            .stm(|view| {
                let schema = schema.clone();
                let tmp_id = tmp_id.clone();
                async move { planstate::mark_task_dispatched(view, &schema, workflow_id, task, &tmp_id).await }
            })
            .await;

        if let Err(error) = outcome {
            self.warn(
                "scheduler",
                format!("mark_task_dispatched did not converge: {error}"),
                Some(workflow_id),
                Some(task),
            );
        }
    }

    /// Apply a task result via `set_task_finished`, then either
    /// re-evaluate readiness (more tasks may now be unblocked), finish
    /// the plan, or -- only on an STM failure, never after a committed
    /// terminal status -- re-enqueue the raw result for another replica.
    async fn handle_task_result(&self, result: TaskResult, event_tx: &mpsc::UnboundedSender<TaskEvent>) {
        let workflow_id = result.workflow_id;
        let schema = self.schema.clone();
        let schedule_limit = self.config.schedule_limit;

        let outcome = self
            .coord
            .stm(|view| {
                let schema = schema.clone();
                let result = result.clone();
                async move { planstate::set_task_finished(view, &schema, workflow_id, &result, schedule_limit).await }
            })
            .await;

        match outcome {
            Ok(PlanFinish::NotFinished) => {
                // `set_task_finished` only sees the task-state keys that
                // already exist, not the plan's full task set, so it
                // cannot itself decide the plan is finished; re-running
                // readiness evaluation does, since it holds the full
                // `task_flow` and finishes the plan once every task in
                // the DAG (not just every dispatched task) is DONE.
                self.evaluate_and_dispatch(workflow_id, event_tx).await;
            }
            Ok(PlanFinish::Failed(task)) => {
                self.finish_plan(workflow_id, true, Some(readiness::workflow_failed_reason(task)))
                    .await;
            }
            Err(error) => {
                self.warn(
                    "scheduler",
                    format!("set_task_finished did not converge: {error}"),
                    Some(workflow_id),
                    Some(result.task),
                );
                let queue = self.coord.queue(self.schema.result_queue());
                if let Err(error) = queue.enqueue(&TaskFinishedQueueContent::V1(result)).await {
                    self.warn(
                        "scheduler",
                        format!("re-enqueue after stm failure also failed: {error}"),
                        Some(workflow_id),
                        None,
                    );
                }
            }
        }
    }

    /// Persist the plan's terminal state, clear its CoordStore keys, and
    /// mirror the outcome into the in-memory plan.
    async fn finish_plan(&self, workflow_id: i64, failed: bool, reason: Option<String>) {
        if let Err(error) =
            planstate::finish_plan(&self.coord, &self.schema, workflow_id, failed, reason.clone()).await
        {
            self.warn(
                "scheduler",
                format!("finish_plan failed: {error}"),
                Some(workflow_id),
                None,
            );
            return;
        }

        if let Err(error) = planstate::clear_workflow_keys(&self.coord, &self.schema, workflow_id).await {
            self.warn(
                "scheduler",
                format!("clear_workflow_keys failed: {error}"),
                Some(workflow_id),
                None,
            );
        }

        if let Some(plan) = self.registry.get_plan(workflow_id) {
            let mut updated = (*plan).clone();
            updated.plan_state.status = if failed { RunStatus::Fail } else { RunStatus::Done };
            updated.plan_state.reason = reason.clone();
            self.registry.set_plan(workflow_id, updated);
        }

        if failed {
            tracing::warn!(workflow_id, reason = reason.as_deref().unwrap_or(""), "workflow run failed");
        } else {
            tracing::info!(workflow_id, "workflow run completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::str::FromStr;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;
    use workflow_coord::InMemoryCoordStore;
    use workflow_db::error::DbError;
    use workflow_db::models::{
        TaskInfo, UserWorkflowRelevance, Workflow, WorkflowSelector, WorkflowTaskEdgeRow,
    };
    use workflow_db::queries::workflow_task::EdgeDiff;

    use crate::model::{PlanState, WorkflowPlan};
    use crate::warning::NullWarningSink;

    struct UnusedStore;

    #[async_trait]
    impl RelationalStore for UnusedStore {
        async fn create_workflow(&self, _: i64, _: &str, _: &str) -> Result<Workflow, DbError> {
            unimplemented!()
        }
        async fn update_workflow(&self, _: i64, _: &str, _: &str) -> Result<Workflow, DbError> {
            unimplemented!()
        }
        async fn delete_workflow(&self, _: i64) -> Result<(), DbError> {
            unimplemented!()
        }
        async fn get_workflow(&self, _: i64) -> Result<Workflow, DbError> {
            unimplemented!()
        }
        async fn list_workflows(&self, _: &WorkflowSelector, _: i64, _: i64) -> Result<Vec<Workflow>, DbError> {
            unimplemented!()
        }
        async fn count_workflows(&self, _: &WorkflowSelector) -> Result<i64, DbError> {
            unimplemented!()
        }
        async fn list_edges(&self, _: i64) -> Result<Vec<WorkflowTaskEdgeRow>, DbError> {
            unimplemented!()
        }
        async fn replace_edges(&self, _: i64, _: i64, _: i64, _: &[TaskRef]) -> Result<EdgeDiff, DbError> {
            unimplemented!()
        }
        async fn grant_relevance(&self, _: i64, _: i64) -> Result<UserWorkflowRelevance, DbError> {
            unimplemented!()
        }
        async fn get_relevance(&self, _: i64, _: i64) -> Result<Option<UserWorkflowRelevance>, DbError> {
            unimplemented!()
        }
        async fn list_user_workflows(&self, _: i64) -> Result<Vec<Workflow>, DbError> {
            unimplemented!()
        }
    }

    struct UnusedCatalog;

    #[async_trait]
    impl TaskCatalog for UnusedCatalog {
        async fn get_task(&self, _: i64, _: i64) -> Result<TaskInfo, DbError> {
            unimplemented!()
        }
    }

    fn linear_plan(workflow_id: i64, a: TaskRef, b: TaskRef) -> WorkflowPlan {
        let mut tasks = HashMap::new();
        tasks.insert(
            a,
            TaskInfo {
                project_id: a.project_id,
                task_id: a.task_id,
                name: "a".to_owned(),
                payload_kind: "noop".to_owned(),
            },
        );
        tasks.insert(
            b,
            TaskInfo {
                project_id: b.project_id,
                task_id: b.task_id,
                name: "b".to_owned(),
                payload_kind: "noop".to_owned(),
            },
        );
        let mut task_flow = HashMap::new();
        task_flow.insert(a, Vec::new());
        task_flow.insert(b, vec![a]);

        WorkflowPlan {
            workflow: Workflow {
                workflow_id,
                title: "t".to_owned(),
                cron_expr: "* * * * * *".to_owned(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            expr: cron::Schedule::from_str("* * * * * *").unwrap(),
            next_time: 0,
            tasks,
            task_flow,
            plan_state: PlanState::not_running(),
            fire_period: StdDuration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn happy_path_dispatches_then_finishes_the_plan() {
        let coord = CoordStore::new(InMemoryCoordStore::new());
        let schema = KeySchema::new("/workflow");
        let registry = Arc::new(PlanRegistry::new());

        let a = TaskRef::new(1, 1);
        let b = TaskRef::new(1, 2);
        registry.set_plan(7, linear_plan(7, a, b));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&registry),
            coord.clone(),
            schema.clone(),
            Arc::new(UnusedStore),
            Arc::new(UnusedCatalog),
            SchedulerConfig {
                schedule_limit: 3,
                starting_grace: StdDuration::from_secs(5),
                idle_interval: StdDuration::from_millis(20),
                stm_retry_limit: 5,
            },
            Arc::new(NullWarningSink),
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));

        // Wait for A's dispatch key, then report it DONE.
        let dispatch_a: TaskDispatch = timeout(StdDuration::from_secs(2), async {
            loop {
                if let Some(d) = coord.get::<TaskDispatch>(&schema.schedule(a)).await.unwrap() {
                    return d;
                }
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .expect("A dispatched");

        let result_queue = coord.queue(schema.result_queue());
        result_queue
            .enqueue(&TaskFinishedQueueContent::V1(TaskResult {
                tmp_id: dispatch_a.tmp_id,
                workflow_id: 7,
                task: a,
                success: true,
            }))
            .await
            .unwrap();

        let dispatch_b: TaskDispatch = timeout(StdDuration::from_secs(2), async {
            loop {
                if let Some(d) = coord.get::<TaskDispatch>(&schema.schedule(b)).await.unwrap() {
                    return d;
                }
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .expect("B dispatched");

        result_queue
            .enqueue(&TaskFinishedQueueContent::V1(TaskResult {
                tmp_id: dispatch_b.tmp_id,
                workflow_id: 7,
                task: b,
                success: true,
            }))
            .await
            .unwrap();

        timeout(StdDuration::from_secs(2), async {
            loop {
                if coord
                    .get::<PlanState>(&schema.plan(7))
                    .await
                    .unwrap()
                    .is_none()
                {
                    return;
                }
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .expect("plan keys cleared after completion");

        cancel.cancel();
        let _ = timeout(StdDuration::from_secs(1), handle).await;
    }
}
