use thiserror::Error;

/// Errors surfaced by the [`crate::CoordStore`] adapter.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("coordination store unreachable: {0}")]
    Unavailable(String),

    #[error("stm did not converge within {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("lease {0} not found or already expired")]
    LeaseExpired(i64),

    #[error("queue {0} closed")]
    QueueClosed(String),

    #[error("value at key {key:?} failed to deserialize: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("backend error: {0}")]
    Backend(String),
}
