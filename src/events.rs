use std::sync::Arc;

use anyhow::Result;

use crate::models::TaskListSnapshot;

/// Receives every registry snapshot in mutation order, on the registry's
/// event thread. A slow implementation delays later events, never writers.
pub trait EventEmitter: Send + Sync {
    fn emit_task_update(&self, snapshot: &TaskListSnapshot) -> Result<()>;
}

#[derive(Default)]
pub struct StdoutEventEmitter;

impl EventEmitter for StdoutEventEmitter {
    fn emit_task_update(&self, snapshot: &TaskListSnapshot) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_string(snapshot)?;
        println!("task_update {payload}");
        Ok(())
    }
}

#[derive(Default)]
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_task_update(&self, _snapshot: &TaskListSnapshot) -> Result<()> {
        Ok(())
    }
}

pub type SharedEmitter = Arc<dyn EventEmitter>;
