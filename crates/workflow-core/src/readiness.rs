//! `can_schedule`: given a plan's DAG and a snapshot of per-task state,
//! decide which tasks to dispatch next and whether the plan is finished
//! or has failed (spec §4.6).

use std::collections::HashMap;
use std::time::Duration;

use workflow_coord::TaskRef;

use crate::model::{RunStatus, ScheduleRecord, TaskState};

/// Result of one readiness evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Tasks to dispatch next. Order is insignificant.
    pub ready: Vec<TaskRef>,
    /// `true` iff every task in the DAG is DONE.
    pub finished: bool,
    /// Set iff a task exceeded `SCHEDULE_LIMIT`; the plan is terminal and
    /// `ready`/`finished` should be ignored in favor of this.
    pub failed: Option<TaskRef>,
    /// `STARTING` tasks whose grace period expired: rewritten to
    /// `NOT_RUNNING` with an appended schedule record carrying the prior
    /// `tmp_id`. Callers persist these before dispatching `ready`.
    pub recoveries: Vec<TaskState>,
}

/// Build the human-readable `reason` stored on a `PlanState` when a task
/// exceeds its retry budget.
pub fn workflow_failed_reason(task: TaskRef) -> String {
    format!("{task} 任务执行失败")
}

/// Evaluate readiness for one plan. `task_flow` maps each task to its
/// predecessors (spec §3); `task_states` is the current snapshot loaded
/// from CoordStore, keyed by `TaskRef`; `now` is unix seconds.
///
/// Per spec §9 REDESIGN FLAGS, a `RUNNING` task is treated as "awaiting
/// result, not ready" -- it is never re-added to the ready set.
pub fn can_schedule(
    task_flow: &HashMap<TaskRef, Vec<TaskRef>>,
    task_states: &HashMap<TaskRef, TaskState>,
    schedule_limit: u32,
    starting_grace: Duration,
    now: i64,
) -> Readiness {
    let mut ready = Vec::new();
    let mut recoveries = Vec::new();
    let mut finished = true;

    for (task, deps) in task_flow {
        if task_states
            .get(task)
            .is_some_and(|s| s.current_status == RunStatus::Done)
        {
            continue;
        }

        let deps_done = deps.iter().all(|dep| {
            task_states
                .get(dep)
                .is_some_and(|s| s.current_status == RunStatus::Done)
        });
        if !deps_done {
            finished = false;
            continue;
        }

        let state = task_states
            .get(task)
            .cloned()
            .unwrap_or_else(|| TaskState::fresh(*task));

        match state.current_status {
            RunStatus::NotRunning => {
                ready.push(*task);
                finished = false;
            }
            RunStatus::Running => {
                finished = false;
            }
            RunStatus::Fail => {
                if state.schedule_count >= schedule_limit {
                    return Readiness {
                        ready: Vec::new(),
                        finished: true,
                        failed: Some(*task),
                        recoveries: Vec::new(),
                    };
                }
                ready.push(*task);
                finished = false;
            }
            RunStatus::Starting => {
                if state.schedule_count >= schedule_limit {
                    return Readiness {
                        ready: Vec::new(),
                        finished: true,
                        failed: Some(*task),
                        recoveries: Vec::new(),
                    };
                }
                finished = false;
                ready.push(*task);

                if now.saturating_sub(state.start_time) > starting_grace.as_secs() as i64 {
                    let prior_tmp_id = state
                        .schedule_records
                        .last()
                        .map(|r| r.tmp_id.clone())
                        .unwrap_or_default();
                    let mut recovered = state.clone();
                    recovered.current_status = RunStatus::NotRunning;
                    recovered.schedule_records.push(ScheduleRecord {
                        tmp_id: prior_tmp_id,
                        status: RunStatus::NotRunning,
                        event_time: now,
                    });
                    recoveries.push(recovered);
                }
            }
            RunStatus::Done => unreachable!("DONE tasks are skipped above"),
        }
    }

    if finished {
        return Readiness {
            ready: Vec::new(),
            finished: true,
            failed: None,
            recoveries,
        };
    }

    Readiness {
        ready,
        finished: false,
        failed: None,
        recoveries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(pairs: &[(TaskRef, &[TaskRef])]) -> HashMap<TaskRef, Vec<TaskRef>> {
        pairs.iter().map(|(k, v)| (*k, v.to_vec())).collect()
    }

    fn done(task: TaskRef) -> TaskState {
        let mut s = TaskState::fresh(task);
        s.current_status = RunStatus::Done;
        s
    }

    #[test]
    fn s1_linear_chain_advances_one_task_at_a_time() {
        let a = TaskRef::new(1, 1);
        let b = TaskRef::new(1, 2);
        let c = TaskRef::new(1, 3);
        let graph = flow(&[(a, &[]), (b, &[a]), (c, &[b])]);

        let r = can_schedule(&graph, &HashMap::new(), 3, Duration::from_secs(5), 0);
        assert_eq!(r.ready, vec![a]);
        assert!(!r.finished);

        let states = HashMap::from([(a, done(a))]);
        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 0);
        assert_eq!(r.ready, vec![b]);

        let states = HashMap::from([(a, done(a)), (b, done(b))]);
        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 0);
        assert_eq!(r.ready, vec![c]);

        let states = HashMap::from([(a, done(a)), (b, done(b)), (c, done(c))]);
        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 0);
        assert!(r.ready.is_empty());
        assert!(r.finished);
    }

    #[test]
    fn s2_fan_out_fan_in() {
        let root = TaskRef::new(1, 1);
        let l = TaskRef::new(1, 2);
        let r_task = TaskRef::new(1, 3);
        let join = TaskRef::new(1, 4);
        let graph = flow(&[
            (root, &[]),
            (l, &[root]),
            (r_task, &[root]),
            (join, &[l, r_task]),
        ]);

        let r = can_schedule(&graph, &HashMap::new(), 3, Duration::from_secs(5), 0);
        assert_eq!(r.ready, vec![root]);

        let states = HashMap::from([(root, done(root))]);
        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 0);
        let mut ready = r.ready.clone();
        ready.sort_by_key(|t| t.task_id);
        assert_eq!(ready, vec![l, r_task]);

        let states = HashMap::from([(root, done(root)), (l, done(l))]);
        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 0);
        assert_eq!(r.ready, vec![r_task]);

        let states = HashMap::from([(root, done(root)), (l, done(l)), (r_task, done(r_task))]);
        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 0);
        assert_eq!(r.ready, vec![join]);
    }

    #[test]
    fn s3_retry_cap_fails_the_plan() {
        let x = TaskRef::new(1, 1);
        let graph = flow(&[(x, &[])]);
        let mut state = TaskState::fresh(x);
        state.current_status = RunStatus::Fail;
        state.schedule_count = 3;
        let states = HashMap::from([(x, state)]);

        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 0);
        assert!(r.ready.is_empty());
        assert!(r.finished);
        assert_eq!(r.failed, Some(x));
    }

    #[test]
    fn s4_stale_starting_is_recovered_and_re_readied() {
        let y = TaskRef::new(1, 1);
        let graph = flow(&[(y, &[])]);
        let mut state = TaskState::fresh(y);
        state.current_status = RunStatus::Starting;
        state.schedule_count = 1;
        state.start_time = 0;
        state.schedule_records.push(ScheduleRecord {
            tmp_id: "attempt-1".to_owned(),
            status: RunStatus::Starting,
            event_time: 0,
        });
        let states = HashMap::from([(y, state)]);

        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 6);
        assert_eq!(r.ready, vec![y]);
        assert!(!r.finished);
        assert_eq!(r.recoveries.len(), 1);
        assert_eq!(r.recoveries[0].current_status, RunStatus::NotRunning);
        assert_eq!(
            r.recoveries[0].schedule_records.last().unwrap().tmp_id,
            "attempt-1"
        );
    }

    #[test]
    fn fresh_starting_within_grace_is_not_recovered() {
        let y = TaskRef::new(1, 1);
        let graph = flow(&[(y, &[])]);
        let mut state = TaskState::fresh(y);
        state.current_status = RunStatus::Starting;
        state.start_time = 0;
        let states = HashMap::from([(y, state)]);

        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 2);
        assert!(r.recoveries.is_empty());
        assert_eq!(r.ready, vec![y]);
    }

    #[test]
    fn running_task_is_not_ready_redesign_flag() {
        let z = TaskRef::new(1, 1);
        let graph = flow(&[(z, &[])]);
        let mut state = TaskState::fresh(z);
        state.current_status = RunStatus::Running;
        let states = HashMap::from([(z, state)]);

        let r = can_schedule(&graph, &states, 3, Duration::from_secs(5), 0);
        assert!(r.ready.is_empty());
        assert!(!r.finished);
        assert!(r.failed.is_none());
    }

    #[test]
    fn finished_iff_every_task_done() {
        let a = TaskRef::new(1, 1);
        let b = TaskRef::new(1, 2);
        let graph = flow(&[(a, &[]), (b, &[a])]);

        let states = HashMap::from([(a, done(a)), (b, done(b))]);
        assert!(can_schedule(&graph, &states, 3, Duration::from_secs(5), 0).finished);

        let states = HashMap::from([(a, done(a))]);
        assert!(!can_schedule(&graph, &states, 3, Duration::from_secs(5), 0).finished);
    }
}
