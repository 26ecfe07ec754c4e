//! `WarningSink`: best-effort delivery of non-fatal operational warnings
//! (spec §6). Telemetry/warning delivery itself is out of scope; this is
//! the named interface the scheduler calls against.

use crate::model::WarningData;

pub trait WarningSink: Send + Sync {
    fn warning(&self, data: WarningData);
}

/// Logs every warning at `warn` level via `tracing`. The production
/// default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWarningSink;

impl WarningSink for TracingWarningSink {
    fn warning(&self, data: WarningData) {
        tracing::warn!(
            source = %data.source,
            workflow_id = data.workflow_id,
            task = %data.task.map(|t| t.to_string()).unwrap_or_default(),
            "{}",
            data.message,
        );
    }
}

/// Discards every warning. Used by tests that assert on scheduler
/// behavior without caring about the log side channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWarningSink;

impl WarningSink for NullWarningSink {
    fn warning(&self, _data: WarningData) {}
}
