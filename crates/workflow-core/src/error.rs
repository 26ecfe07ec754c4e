use thiserror::Error;
use workflow_coord::{CoordError, TaskRef};

/// Internal error type the engine operates on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("user {user_id} is not authorized to edit workflow {workflow_id}")]
    Unauthorized { user_id: i64, workflow_id: i64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("stm did not converge after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("workflow {workflow_id} task graph contains a cycle at {task}")]
    InvalidDag { workflow_id: i64, task: TaskRef },

    #[error("workflow {workflow_id} failed: {reason}")]
    WorkflowFailed { workflow_id: i64, reason: String },

    #[error("transient backend error: {0}")]
    TransientBackend(String),

    #[error("fatal engine error: {0}")]
    Fatal(String),
}

impl From<CoordError> for EngineError {
    fn from(err: CoordError) -> Self {
        match err {
            CoordError::Conflict { attempts } => EngineError::Conflict { attempts },
            CoordError::Unavailable(_) => EngineError::TransientBackend(err.to_string()),
            other => EngineError::Fatal(other.to_string()),
        }
    }
}

impl From<workflow_db::DbError> for EngineError {
    fn from(err: workflow_db::DbError) -> Self {
        match err {
            workflow_db::DbError::NotFound(what) => EngineError::NotFound(what),
            other => EngineError::TransientBackend(other.to_string()),
        }
    }
}

/// Public-facing error: an integer code plus a Chinese-language message,
/// with the full diagnostic kept server-side only.
#[derive(Debug, Clone)]
pub struct PublicError {
    pub code: i32,
    pub message_zh: String,
    pub diagnostic: String,
}

impl std::fmt::Display for PublicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message_zh)
    }
}

impl std::error::Error for PublicError {}

impl From<&EngineError> for PublicError {
    fn from(err: &EngineError) -> Self {
        let (code, message_zh) = match err {
            EngineError::Unauthorized { .. } => (403, "无权限操作该工作流".to_owned()),
            EngineError::NotFound(_) => (404, "记录不存在".to_owned()),
            EngineError::Conflict { .. } => (409, "状态更新冲突，请重试".to_owned()),
            EngineError::InvalidDag { .. } => (422, "任务依赖关系存在环".to_owned()),
            EngineError::WorkflowFailed { .. } => (500, "工作流执行失败".to_owned()),
            EngineError::TransientBackend(_) => (503, "后端暂时不可用，请重试".to_owned()),
            EngineError::Fatal(_) => (500, "内部错误".to_owned()),
        };
        Self {
            code,
            message_zh,
            diagnostic: err.to_string(),
        }
    }
}

impl From<EngineError> for PublicError {
    fn from(err: EngineError) -> Self {
        PublicError::from(&err)
    }
}
