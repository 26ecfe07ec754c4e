//! The workflow scheduling and execution engine (spec.md core): the
//! in-memory plan registry, the tick-driven scheduler loop, per-plan
//! state machine, DAG readiness evaluation, and the admin-path API
//! surface that keeps the registry in sync with the relational store.

pub mod admin;
pub mod config;
pub mod dag;
pub mod error;
pub mod model;
pub mod planbuild;
pub mod planstate;
pub mod readiness;
pub mod registrar;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod warning;

pub use admin::{AdminApi, CreateWorkflowTaskArgs};
pub use config::{AdminConfig, SchedulerConfig};
pub use error::{EngineError, PublicError};
pub use model::{
    ClientInfo, PlanState, RunStatus, ScheduleRecord, TaskDispatch, TaskFinishedQueueContent,
    TaskResult, TaskState, WarningData, WorkflowPlan,
};
pub use registrar::{run_registrar, RegistrarSet};
pub use registry::PlanRegistry;
pub use scheduler::Scheduler;
pub use warning::{NullWarningSink, TracingWarningSink, WarningSink};
