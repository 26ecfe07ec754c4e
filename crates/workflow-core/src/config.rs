use std::env;
use std::time::Duration;

/// Tunables for the scheduler loop and readiness evaluator.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum dispatch attempts per task per workflow run.
    pub schedule_limit: u32,
    /// Seconds a task may remain STARTING before recovery resets it.
    pub starting_grace: Duration,
    /// Fallback re-evaluation interval when the registry is empty.
    pub idle_interval: Duration,
    pub stm_retry_limit: u32,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let schedule_limit = env::var("WORKFLOW_SCHEDULE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        Self {
            schedule_limit,
            ..Self::default()
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_limit: 3,
            starting_grace: Duration::from_secs(5),
            idle_interval: Duration::from_secs(1),
            stm_retry_limit: 5,
        }
    }
}

/// Admin-path authorization policy. `bypass_user_id` is the id that
/// skips the `UserWorkflowRelevance` check entirely.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub bypass_user_id: i64,
}

impl AdminConfig {
    pub fn from_env() -> Self {
        let bypass_user_id = env::var("WORKFLOW_ADMIN_BYPASS_USER_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        Self { bypass_user_id }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self { bypass_user_id: 1 }
    }
}
