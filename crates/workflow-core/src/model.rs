use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use workflow_coord::TaskRef;
use workflow_db::models::TaskInfo;

/// Lifecycle status shared by plans and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotRunning,
    Starting,
    Running,
    Done,
    Fail,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid run status: {0}")]
pub struct ParseRunStatusError(String);

impl FromStr for RunStatus {
    type Err = ParseRunStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_running" => Ok(Self::NotRunning),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "fail" => Ok(Self::Fail),
            other => Err(ParseRunStatusError(other.to_owned())),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotRunning => "not_running",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Done => "done",
            Self::Fail => "fail",
        };
        write!(f, "{s}")
    }
}

/// One entry in a task's append-only `schedule_records` trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub tmp_id: String,
    pub status: RunStatus,
    pub event_time: i64,
}

/// Persisted at `/workflow/plan/{workflow_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanState {
    pub status: RunStatus,
    pub latest_try_time: i64,
    pub reason: Option<String>,
    pub records: Vec<TaskState>,
}

impl PlanState {
    pub fn not_running() -> Self {
        Self {
            status: RunStatus::NotRunning,
            latest_try_time: 0,
            reason: None,
            records: Vec::new(),
        }
    }

    /// Enforces the transition graph: `NotRunning -> Running ->
    /// {Done, Fail}`; out of a terminal state only `NotRunning` is
    /// reachable, and only via an explicit reset (never returned by this
    /// method itself -- callers construct a fresh `PlanState` for that).
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self.status, next),
            (NotRunning, Running) | (Running, Done) | (Running, Fail)
        )
    }
}

/// Persisted at `/workflow/task/{workflow_id}/{project_id}/{task_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task: TaskRef,
    pub current_status: RunStatus,
    pub schedule_count: u32,
    pub start_time: i64,
    pub schedule_records: Vec<ScheduleRecord>,
}

impl TaskState {
    pub fn fresh(task: TaskRef) -> Self {
        Self {
            task,
            current_status: RunStatus::NotRunning,
            schedule_count: 0,
            start_time: 0,
            schedule_records: Vec::new(),
        }
    }
}

/// In-memory runtime representation of one scheduled workflow.
#[derive(Clone)]
pub struct WorkflowPlan {
    pub workflow: workflow_db::models::Workflow,
    pub expr: Schedule,
    pub next_time: i64,
    pub tasks: HashMap<TaskRef, TaskInfo>,
    /// `task -> its predecessors` (the DAG in dependency form).
    pub task_flow: HashMap<TaskRef, Vec<TaskRef>>,
    pub plan_state: PlanState,
    /// Cached duration between two consecutive fire times, computed once
    /// at build time (see `fire_period`). Used by `is_running`'s
    /// liveness fence instead of a comparison that grows unboundedly.
    pub fire_period: Duration,
}

impl WorkflowPlan {
    /// `true` if the plan's own bookkeeping says a run is already
    /// in-flight and still fresh. A `Running` plan whose
    /// `latest_try_time` is older than one fire period is considered
    /// stuck and eligible for retry (scenario S5).
    pub fn is_running(&self) -> bool {
        if self.plan_state.status != RunStatus::Running {
            return false;
        }
        let now = Utc::now().timestamp();
        let age = now.saturating_sub(self.plan_state.latest_try_time);
        age <= self.fire_period.as_secs() as i64
    }
}

/// Result delivered by an agent after executing a dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub tmp_id: String,
    pub workflow_id: i64,
    pub task: TaskRef,
    pub success: bool,
}

/// Versioned envelope on the result queue. New versions are additive;
/// an unrecognized version is logged and dropped without re-enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "version", content = "data")]
pub enum TaskFinishedQueueContent {
    V1(TaskResult),
}

/// Payload written to `/task/schedule/{project_id}/{task_id}`, watched by
/// agents for work to execute. `payload_kind` round-trips `TaskInfo`'s
/// field of the same name; the engine never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub workflow_id: i64,
    pub task: TaskRef,
    pub tmp_id: String,
    pub payload_kind: String,
}

/// Agent presence record written at `/register/{project_id}/{ip}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub project_id: i64,
    pub ip: String,
    pub hostname: String,
    pub registered_at: i64,
    pub capabilities: Vec<String>,
}

/// Payload delivered to `WarningSink::warning`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningData {
    pub source: String,
    pub message: String,
    pub workflow_id: Option<i64>,
    pub task: Option<TaskRef>,
}
