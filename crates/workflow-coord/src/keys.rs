//! Typed key helpers over the `/workflow/...` key schema (spec §4.2).

use serde::{Deserialize, Serialize};

/// Compound key identifying a task: `(project_id, task_id)`.
///
/// Value equality is structural -- two `TaskRef`s are equal iff both
/// fields match, which is what `derive(PartialEq, Eq, Hash)` gives us for
/// free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRef {
    pub project_id: i64,
    pub task_id: i64,
}

impl TaskRef {
    pub fn new(project_id: i64, task_id: i64) -> Self {
        Self {
            project_id,
            task_id,
        }
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.task_id)
    }
}

/// Key-building helpers, namespaced under a configurable root prefix.
#[derive(Debug, Clone)]
pub struct KeySchema {
    root: String,
}

impl KeySchema {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        if root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    /// `/workflow/plan/{workflow_id}`
    pub fn plan(&self, workflow_id: i64) -> String {
        format!("{}/plan/{workflow_id}", self.root)
    }

    /// `/workflow/task/{workflow_id}/{project_id}/{task_id}`
    pub fn task(&self, workflow_id: i64, task: TaskRef) -> String {
        format!(
            "{}/task/{workflow_id}/{}/{}",
            self.root, task.project_id, task.task_id
        )
    }

    /// Prefix covering every task-state key for a workflow.
    pub fn task_prefix(&self, workflow_id: i64) -> String {
        format!("{}/task/{workflow_id}/", self.root)
    }

    /// `/workflow/queue/` -- result-queue prefix.
    pub fn result_queue(&self) -> String {
        format!("{}/queue/", self.root)
    }

    /// `/register/{project_id}/{ip}` -- agent presence.
    ///
    /// Registered under the root's parent namespace rather than under
    /// `/workflow`, matching spec §4.2's key schema verbatim.
    pub fn register(&self, project_id: i64, ip: &str) -> String {
        format!("/register/{project_id}/{ip}")
    }

    pub fn register_prefix(&self, project_id: i64) -> String {
        format!("/register/{project_id}/")
    }

    /// `/task/schedule/{project_id}/{task_id}` -- task dispatch.
    pub fn schedule(&self, task: TaskRef) -> String {
        format!("/task/schedule/{}/{}", task.project_id, task.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_key_shape() {
        let schema = KeySchema::new("/workflow");
        assert_eq!(schema.plan(42), "/workflow/plan/42");
    }

    #[test]
    fn task_key_shape() {
        let schema = KeySchema::new("/workflow");
        let key = schema.task(42, TaskRef::new(1, 7));
        assert_eq!(key, "/workflow/task/42/1/7");
        assert!(key.starts_with(&schema.task_prefix(42)));
    }

    #[test]
    fn trailing_slash_normalized() {
        let schema = KeySchema::new("/workflow/");
        assert_eq!(schema.plan(1), "/workflow/plan/1");
    }

    #[test]
    fn task_ref_display() {
        let r = TaskRef::new(1, 2);
        assert_eq!(r.to_string(), "1/2");
    }
}
