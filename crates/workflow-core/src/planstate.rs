//! Free functions reading and writing plan/task state keys in CoordStore.
//!
//! Mirrors the free-function style `workflow_db::queries` uses over a
//! pool, rather than a stateful struct: every function takes the store
//! (or an in-progress `StmView`) and the keys it needs explicitly.

use std::time::{SystemTime, UNIX_EPOCH};

use workflow_coord::{CoordError, CoordStore, KeySchema, StmView, TaskRef};

use crate::model::{PlanState, RunStatus, ScheduleRecord, TaskResult, TaskState};

/// Outcome of applying a task result within [`set_task_finished`].
///
/// `set_task_finished` only ever sees the task-state keys that already
/// exist in CoordStore, which are created lazily on dispatch -- it has
/// no access to the plan's full `TaskRef` set and so cannot itself
/// decide "every task in the plan is DONE". That decision belongs to
/// `can_schedule`, which holds the full `task_flow`; callers re-evaluate
/// readiness after every `NotFinished` result and finish the plan from
/// there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFinish {
    /// Other tasks remain outstanding; nothing to finalize yet. The
    /// caller should re-run readiness evaluation, which finishes the
    /// plan itself once every task in the DAG is DONE.
    NotFinished,
    /// `task` exhausted `SCHEDULE_LIMIT` attempts; the plan is terminal.
    Failed(TaskRef),
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub async fn get_plan_state(
    store: &CoordStore,
    schema: &KeySchema,
    workflow_id: i64,
) -> Result<Option<PlanState>, CoordError> {
    store.get(&schema.plan(workflow_id)).await
}

/// Transactionally mark `workflow_id` as `RUNNING`. Fails (returns
/// `Ok(false)`, no write) if the plan is already `RUNNING` and its
/// `latest_try_time` is still within `fire_period` of now -- the
/// liveness fence that lets a genuinely stuck plan be retried without
/// waiting for an explicit reset.
pub async fn set_plan_running(
    store: &CoordStore,
    schema: &KeySchema,
    workflow_id: i64,
    fire_period_secs: i64,
) -> Result<bool, CoordError> {
    let key = schema.plan(workflow_id);
    store
        .stm(|view| {
            let key = key.clone();
            async move {
                let current: Option<PlanState> = view.get(&key).await?;
                let now = now();
                if let Some(ref state) = current {
                    if state.status == RunStatus::Running
                        && now.saturating_sub(state.latest_try_time) <= fire_period_secs
                    {
                        return Ok(false);
                    }
                }
                let next = PlanState {
                    status: RunStatus::Running,
                    latest_try_time: now,
                    reason: None,
                    records: current.map(|s| s.records).unwrap_or_default(),
                };
                view.put(&key, &next)?;
                Ok(true)
            }
        })
        .await
}

/// Persist the plan's terminal state: `DONE` with no reason, or `FAIL`
/// with `reason`, snapshotting the current per-task states.
pub async fn finish_plan(
    store: &CoordStore,
    schema: &KeySchema,
    workflow_id: i64,
    failed: bool,
    reason: Option<String>,
) -> Result<(), CoordError> {
    let records = get_task_states(store, schema, workflow_id).await?;
    let state = PlanState {
        status: if failed { RunStatus::Fail } else { RunStatus::Done },
        latest_try_time: now(),
        reason,
        records,
    };
    store.put(&schema.plan(workflow_id), &state, None).await
}

pub async fn get_task_states(
    store: &CoordStore,
    schema: &KeySchema,
    workflow_id: i64,
) -> Result<Vec<TaskState>, CoordError> {
    let rows: Vec<(String, TaskState)> = store.get_prefix(&schema.task_prefix(workflow_id)).await?;
    Ok(rows.into_iter().map(|(_, state)| state).collect())
}

/// Record a dispatch attempt: bumps `schedule_count`, sets
/// `current_status = STARTING`, `start_time = now`, and appends a
/// schedule record carrying the freshly-minted `tmp_id`.
pub async fn mark_task_dispatched(
    view: &mut StmView<'_>,
    schema: &KeySchema,
    workflow_id: i64,
    task: TaskRef,
    tmp_id: &str,
) -> Result<TaskState, CoordError> {
    let key = schema.task(workflow_id, task);
    let mut state: TaskState = view.get(&key).await?.unwrap_or_else(|| TaskState::fresh(task));
    state.schedule_count += 1;
    state.current_status = RunStatus::Starting;
    state.start_time = now();
    state.schedule_records.push(ScheduleRecord {
        tmp_id: tmp_id.to_owned(),
        status: RunStatus::Starting,
        event_time: now(),
    });
    view.put(&key, &state)?;
    Ok(state)
}

/// Apply `result` to its task state and report whether the plan is now
/// finished. Idempotent per `tmp_id`: if the latest schedule record
/// already reflects this `tmp_id`'s terminal status, the state is left
/// untouched and the same `plan_finished` verdict is recomputed.
pub async fn set_task_finished(
    view: &mut StmView<'_>,
    schema: &KeySchema,
    workflow_id: i64,
    result: &TaskResult,
    schedule_limit: u32,
) -> Result<PlanFinish, CoordError> {
    let key = schema.task(workflow_id, result.task);
    let mut state: TaskState = view
        .get(&key)
        .await?
        .unwrap_or_else(|| TaskState::fresh(result.task));

    let terminal_status = if result.success {
        RunStatus::Done
    } else {
        RunStatus::Fail
    };

    let already_applied = state
        .schedule_records
        .last()
        .map(|record| record.tmp_id == result.tmp_id && record.status == terminal_status)
        .unwrap_or(false);

    if !already_applied {
        state.current_status = terminal_status;
        state.schedule_records.push(ScheduleRecord {
            tmp_id: result.tmp_id.clone(),
            status: terminal_status,
            event_time: now(),
        });
        view.put(&key, &state)?;
    }

    let schedule_limit_hit =
        state.current_status == RunStatus::Fail && state.schedule_count >= schedule_limit;
    if schedule_limit_hit {
        return Ok(PlanFinish::Failed(state.task));
    }

    Ok(PlanFinish::NotFinished)
}

/// Range-delete both the plan key and every per-task key for
/// `workflow_id`. Called once a plan reaches a terminal state.
pub async fn clear_workflow_keys(
    store: &CoordStore,
    schema: &KeySchema,
    workflow_id: i64,
) -> Result<(), CoordError> {
    store.delete(&schema.plan(workflow_id)).await?;
    store.delete_prefix(&schema.task_prefix(workflow_id)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_coord::InMemoryCoordStore;

    fn store() -> CoordStore {
        CoordStore::new(InMemoryCoordStore::new())
    }

    #[tokio::test]
    async fn set_plan_running_rejects_a_fresh_running_plan() {
        let store = store();
        let schema = KeySchema::new("/workflow");
        assert!(set_plan_running(&store, &schema, 1, 60).await.unwrap());
        assert!(!set_plan_running(&store, &schema, 1, 60).await.unwrap());
    }

    #[tokio::test]
    async fn set_plan_running_allows_a_stale_running_plan() {
        let store = store();
        let schema = KeySchema::new("/workflow");
        store
            .put(
                &schema.plan(1),
                &PlanState {
                    status: RunStatus::Running,
                    latest_try_time: 0,
                    reason: None,
                    records: Vec::new(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(set_plan_running(&store, &schema, 1, 1).await.unwrap());
    }

    #[tokio::test]
    async fn set_task_finished_is_idempotent_per_tmp_id() {
        let store = store();
        let schema = KeySchema::new("/workflow");
        let result = TaskResult {
            tmp_id: "attempt-1".to_owned(),
            workflow_id: 1,
            task: TaskRef::new(1, 1),
            success: true,
        };

        let first = store
            .stm(|view| {
                let result = result.clone();
                let schema = schema.clone();
                async move { set_task_finished(view, &schema, 1, &result, 3).await }
            })
            .await
            .unwrap();

        let second = store
            .stm(|view| {
                let result = result.clone();
                let schema = schema.clone();
                async move { set_task_finished(view, &schema, 1, &result, 3).await }
            })
            .await
            .unwrap();

        assert_eq!(first, second);

        let state: TaskState = store.get(&schema.task(1, result.task)).await.unwrap().unwrap();
        assert_eq!(state.schedule_records.len(), 1);
    }

    #[tokio::test]
    async fn clear_workflow_keys_leaves_no_residue() {
        let store = store();
        let schema = KeySchema::new("/workflow");
        store.put(&schema.plan(1), &PlanState::not_running(), None).await.unwrap();
        store
            .put(&schema.task(1, TaskRef::new(1, 1)), &TaskState::fresh(TaskRef::new(1, 1)), None)
            .await
            .unwrap();

        clear_workflow_keys(&store, &schema, 1).await.unwrap();

        assert!(get_plan_state(&store, &schema, 1).await.unwrap().is_none());
        assert!(get_task_states(&store, &schema, 1).await.unwrap().is_empty());
    }
}
