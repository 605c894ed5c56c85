use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("task {task_id} cannot be restarted while {state}")]
    NotRestartable { task_id: String, state: String },
}

/// Failures reported by a retrieval engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to fetch media info: {0}")]
    Probe(String),
    #[error("download failed: {0}")]
    Retrieve(String),
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("external tool is missing: {0}")]
    ToolMissing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
