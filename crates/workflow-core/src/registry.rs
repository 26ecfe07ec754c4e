//! In-memory map of active plans, keyed by workflow id.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::model::WorkflowPlan;

/// Concurrent map of `workflow_id -> WorkflowPlan`. Plans are replaced
/// atomically (a fresh `Arc` swapped in), never patched in place, so a
/// reader holding a clone of an `Arc` never observes a half-updated
/// plan.
#[derive(Default)]
pub struct PlanRegistry {
    plans: DashMap<i64, Arc<WorkflowPlan>>,
    count: AtomicUsize,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `plan`, replacing any existing entry for the same id.
    pub fn set_plan(&self, workflow_id: i64, plan: WorkflowPlan) {
        let is_new = self
            .plans
            .insert(workflow_id, Arc::new(plan))
            .is_none();
        if is_new {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn get_plan(&self, workflow_id: i64) -> Option<Arc<WorkflowPlan>> {
        self.plans.get(&workflow_id).map(|entry| Arc::clone(&entry))
    }

    pub fn del_plan(&self, workflow_id: i64) -> Option<Arc<WorkflowPlan>> {
        let removed = self.plans.remove(&workflow_id).map(|(_, plan)| plan);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn plan_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Visit every plan currently registered. `visitor` sees a consistent
    /// snapshot of each individual plan (it is an `Arc` clone), but
    /// concurrent inserts/removals during iteration are not reflected
    /// mid-pass.
    pub fn plan_range(&self, mut visitor: impl FnMut(i64, &Arc<WorkflowPlan>)) {
        for entry in self.plans.iter() {
            visitor(*entry.key(), entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanState;
    use chrono::Utc;
    use cron::Schedule;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::time::Duration;

    fn dummy_plan(workflow_id: i64) -> WorkflowPlan {
        WorkflowPlan {
            workflow: workflow_db::models::Workflow {
                workflow_id,
                title: "t".to_owned(),
                cron_expr: "* * * * * *".to_owned(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            expr: Schedule::from_str("* * * * * *").unwrap(),
            next_time: 0,
            tasks: HashMap::new(),
            task_flow: HashMap::new(),
            plan_state: PlanState::not_running(),
            fire_period: Duration::from_secs(1),
        }
    }

    #[test]
    fn set_then_get_returns_the_same_plan() {
        let registry = PlanRegistry::new();
        registry.set_plan(1, dummy_plan(1));
        assert!(registry.get_plan(1).is_some());
        assert_eq!(registry.plan_count(), 1);
    }

    #[test]
    fn replacing_an_existing_id_does_not_double_count() {
        let registry = PlanRegistry::new();
        registry.set_plan(1, dummy_plan(1));
        registry.set_plan(1, dummy_plan(1));
        assert_eq!(registry.plan_count(), 1);
    }

    #[test]
    fn del_plan_decrements_the_counter() {
        let registry = PlanRegistry::new();
        registry.set_plan(1, dummy_plan(1));
        registry.del_plan(1);
        assert_eq!(registry.plan_count(), 0);
        assert!(registry.get_plan(1).is_none());
    }

    #[test]
    fn plan_range_visits_every_entry() {
        let registry = PlanRegistry::new();
        registry.set_plan(1, dummy_plan(1));
        registry.set_plan(2, dummy_plan(2));
        let mut seen = Vec::new();
        registry.plan_range(|id, _plan| seen.push(id));
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
    }
}
