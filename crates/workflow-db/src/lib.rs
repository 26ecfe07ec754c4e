//! Postgres-backed relational store: `Workflow`, `WorkflowTaskEdge`,
//! `UserWorkflowRelevance`, and the task catalog the engine resolves
//! `TaskInfo` against.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;
pub mod store;

pub use error::DbError;
pub use store::{PgRelationalStore, PgTaskCatalog};
